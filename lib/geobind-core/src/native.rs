//! Native library interface.

use crate::handle::{NativePtr, ResourceKind};

/// Release operations of the native library driven by the registry.
///
/// The registry never opens or reads resources itself: those calls are made by job native steps against whatever API
/// the native library exposes. What it does own is the end of a resource's life, and these are the calls it makes
/// when a resource is disposed.
///
/// Implementations must be callable from any thread. None of these methods are invoked while the registry's structural
/// lock is held.
pub trait NativeLibrary: Send + Sync + 'static {
    /// Closes a dataset.
    ///
    /// Called exactly once per dataset, after all of its children have been disposed and once no job holds or waits on
    /// the dataset lock.
    fn close_dataset(&self, dataset: NativePtr);

    /// Releases a layer that was obtained as the result set of a query against `dataset`.
    ///
    /// Called while holding the dataset lock, and always before the dataset is closed.
    fn release_result_set(&self, dataset: NativePtr, layer: NativePtr);

    /// Destroys an unparented resource that the binding owns, such as a spatial reference or a geometry.
    fn destroy(&self, kind: ResourceKind, ptr: NativePtr);
}
