//! Resource identity.

use std::fmt;

/// Stable identifier of a registered native resource.
///
/// Identifiers are allocated from a monotonic counter and are never reused, even after the resource they name has
/// been disposed. A stale identifier therefore fails a liveness check instead of aliasing some newer resource.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Creates a `ResourceId` from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of this identifier.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque address of a native resource.
///
/// The binding layer never dereferences these: they are compared for equality (deduplication) and handed back to the
/// native library when a resource has to be released.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NativePtr(usize);

impl NativePtr {
    /// Creates a `NativePtr` from a raw pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Creates a `NativePtr` from a raw address.
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw address.
    pub const fn addr(&self) -> usize {
        self.0
    }
}

impl fmt::Debug for NativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativePtr({:#x})", self.0)
    }
}

/// Kind of a native resource.
///
/// Each kind is indexed separately: the same address registered under two different kinds names two different
/// resources.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// A format driver.
    Driver,
    /// An open dataset. The only dataset-class kind: it owns a lock and may own children.
    Dataset,
    /// A vector layer.
    Layer,
    /// A raster band.
    RasterBand,
    /// A multidimensional group.
    Group,
    /// A multidimensional array.
    MdArray,
    /// A dimension of a multidimensional array.
    Dimension,
    /// An attribute of a group or array.
    Attribute,
    /// A spatial reference system.
    SpatialReference,
    /// A geometry.
    Geometry,
}

impl ResourceKind {
    /// All resource kinds, in declaration order.
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Driver,
        ResourceKind::Dataset,
        ResourceKind::Layer,
        ResourceKind::RasterBand,
        ResourceKind::Group,
        ResourceKind::MdArray,
        ResourceKind::Dimension,
        ResourceKind::Attribute,
        ResourceKind::SpatialReference,
        ResourceKind::Geometry,
    ];

    /// Returns `true` if resources of this kind own a dataset lock and may own children.
    pub const fn is_dataset(&self) -> bool {
        matches!(self, ResourceKind::Dataset)
    }

    /// Returns the name of this kind, as used in logs and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Driver => "driver",
            ResourceKind::Dataset => "dataset",
            ResourceKind::Layer => "layer",
            ResourceKind::RasterBand => "raster_band",
            ResourceKind::Group => "group",
            ResourceKind::MdArray => "md_array",
            ResourceKind::Dimension => "dimension",
            ResourceKind::Attribute => "attribute",
            ResourceKind::SpatialReference => "spatial_reference",
            ResourceKind::Geometry => "geometry",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of one native resource instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResourceHandle {
    id: ResourceId,
    kind: ResourceKind,
    ptr: NativePtr,
}

impl ResourceHandle {
    pub(crate) const fn new(id: ResourceId, kind: ResourceKind, ptr: NativePtr) -> Self {
        Self { id, kind, ptr }
    }

    /// Returns the identifier of the resource.
    pub const fn id(&self) -> ResourceId {
        self.id
    }

    /// Returns the kind of the resource.
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Returns the native address of the resource.
    pub const fn ptr(&self) -> NativePtr {
        self.ptr
    }

    /// Returns `true` if both handles name the same native resource.
    ///
    /// Identity is decided by kind and native address alone.
    pub fn same_resource(&self, other: &ResourceHandle) -> bool {
        self.kind == other.kind && self.ptr == other.ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_resource_ignores_id() {
        let a = ResourceHandle::new(ResourceId::from_raw(1), ResourceKind::Layer, NativePtr::from_addr(0x10));
        let b = ResourceHandle::new(ResourceId::from_raw(7), ResourceKind::Layer, NativePtr::from_addr(0x10));
        let c = ResourceHandle::new(ResourceId::from_raw(1), ResourceKind::RasterBand, NativePtr::from_addr(0x10));

        assert!(a.same_resource(&b));
        assert!(!a.same_resource(&c));
    }

    #[test]
    fn only_datasets_are_dataset_class() {
        let datasets = ResourceKind::ALL.iter().filter(|kind| kind.is_dataset()).count();
        assert_eq!(datasets, 1);
        assert!(ResourceKind::Dataset.is_dataset());
    }

    #[test]
    fn native_ptr_debug_is_hex() {
        assert_eq!(format!("{:?}", NativePtr::from_addr(255)), "NativePtr(0xff)");
    }
}
