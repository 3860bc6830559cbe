//! Host-side wrapper objects.
//!
//! Host wrappers are reference counted. The registry only ever keeps a weak reference to them, so a wrapper stays
//! reachable exactly as long as host code (or a job persisting it) holds a strong reference. When the last strong
//! reference goes away, the wrapper's finalizer posts the resource identifier on the finalize queue of the controlling
//! loop, which disposes the resource on its next turn.

use std::{any::Any, fmt, ops::Deref, sync::Arc};

use tokio::sync::mpsc;

use crate::handle::ResourceId;

/// Type-erased, strong reference to a host value.
pub type HostRef = Arc<dyn Any + Send + Sync>;

pub(crate) type FinalizeSender = mpsc::UnboundedSender<ResourceId>;

/// Posts a resource identifier on the finalize queue when dropped.
pub(crate) struct Finalizer {
    id: ResourceId,
    tx: FinalizeSender,
}

impl Finalizer {
    pub(crate) fn new(id: ResourceId, tx: FinalizeSender) -> Self {
        Self { id, tx }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        // The controlling loop may already be gone, in which case there is nothing left to dispose.
        let _ = self.tx.send(self.id);
    }
}

/// A host wrapper around a registered native resource.
///
/// Wrappers of resources that live under a dataset keep a strong reference to the dataset's wrapper, so a dataset can
/// never be finalized while any of its children are still reachable.
pub struct HostObject<T> {
    id: ResourceId,
    parent: Option<HostRef>,
    value: T,
    _finalizer: Finalizer,
}

impl<T> HostObject<T> {
    pub(crate) fn new(id: ResourceId, parent: Option<HostRef>, value: T, finalizer: Finalizer) -> Self {
        Self {
            id,
            parent,
            value,
            _finalizer: finalizer,
        }
    }

    /// Returns the identifier of the wrapped resource.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Returns the wrapper of the dataset this resource lives under, if any.
    pub fn parent(&self) -> Option<&HostRef> {
        self.parent.as_ref()
    }

    /// Returns a reference to the wrapped value.
    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for HostObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for HostObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}
