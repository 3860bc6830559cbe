//! Dataset locks.
//!
//! Every dataset owns exactly one lock, shared by reference with all of its descendants. Any native call touching a
//! dataset, or anything beneath it, must hold that lock for the whole duration of the call.
//!
//! The lock is also what keeps the native dataset open: the dataset is closed when the last reference to its lock is
//! dropped, which happens once the dataset has been disposed, all of its children have been disposed, and no job still
//! holds or waits on the lock.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as BlockingMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::{
    handle::{NativePtr, ResourceId},
    native::NativeLibrary,
};

struct DatasetShared {
    dataset_id: ResourceId,
    dataset: NativePtr,
    mutex: Arc<BlockingMutex<()>>,
    deferred: Mutex<Vec<NativePtr>>,
    library: Arc<dyn NativeLibrary>,
}

impl DatasetShared {
    /// Releases result sets whose disposal happened while the lock was busy.
    ///
    /// Must only be called while holding the lock, or once no lock holder can exist anymore.
    fn release_deferred(&self) {
        let deferred = std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner));
        for layer in deferred {
            trace!(dataset_id = %self.dataset_id, layer = ?layer, "Releasing deferred result set.");
            self.library.release_result_set(self.dataset, layer);
        }
    }
}

impl Drop for DatasetShared {
    fn drop(&mut self) {
        self.release_deferred();
        self.library.close_dataset(self.dataset);

        debug!(dataset_id = %self.dataset_id, "Closed dataset.");
    }
}

/// Lock guarding every native call made on a dataset or any of its descendants.
#[derive(Clone)]
pub(crate) struct DatasetLock {
    shared: Arc<DatasetShared>,
}

impl DatasetLock {
    pub(crate) fn new(dataset_id: ResourceId, dataset: NativePtr, library: Arc<dyn NativeLibrary>) -> Self {
        Self {
            shared: Arc::new(DatasetShared {
                dataset_id,
                dataset,
                mutex: Arc::new(BlockingMutex::new(())),
                deferred: Mutex::new(Vec::new()),
                library,
            }),
        }
    }

    pub(crate) fn dataset_id(&self) -> ResourceId {
        self.shared.dataset_id
    }

    /// Acquires the lock, blocking the current thread until it is available.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub(crate) fn acquire(&self) -> DatasetGuard {
        let permit = match Arc::clone(&self.shared.mutex).try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                trace!(dataset_id = %self.shared.dataset_id, "Dataset lock contended. Waiting.");
                Arc::clone(&self.shared.mutex).blocking_lock_owned()
            }
        };

        DatasetGuard {
            held: Some(HeldLock {
                _permit: permit,
                shared: Arc::clone(&self.shared),
            }),
        }
    }

    /// Releases a result set layer belonging to this dataset.
    ///
    /// The release happens immediately when the lock is free. Otherwise it is deferred to the current holder, which
    /// performs it when releasing the lock, or at the latest right before the dataset is closed.
    pub(crate) fn release_result_set(&self, layer: NativePtr) {
        match Arc::clone(&self.shared.mutex).try_lock_owned() {
            Ok(_permit) => self.shared.library.release_result_set(self.shared.dataset, layer),
            Err(_) => {
                trace!(dataset_id = %self.shared.dataset_id, layer = ?layer, "Dataset busy. Deferring result set release.");
                self.shared
                    .deferred
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(layer);
            }
        }
    }
}

struct HeldLock {
    // Field order matters: the permit is released before the shared state, which may close the dataset, is dropped.
    _permit: OwnedMutexGuard<()>,
    shared: Arc<DatasetShared>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.shared.release_deferred();
    }
}

/// A held dataset lock.
///
/// The lock is released when the guard is dropped. A guard obtained for a resource that does not belong to any dataset,
/// such as a free-standing geometry, holds nothing.
#[must_use = "the dataset lock is released as soon as the guard is dropped"]
pub struct DatasetGuard {
    held: Option<HeldLock>,
}

impl DatasetGuard {
    pub(crate) fn unheld() -> Self {
        Self { held: None }
    }

    /// Returns the identifier of the dataset whose lock is held, if any.
    pub fn dataset_id(&self) -> Option<ResourceId> {
        self.held.as_ref().map(|held| held.shared.dataset_id)
    }

    /// Returns `true` if this guard holds a dataset lock.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl fmt::Debug for DatasetGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetGuard")
            .field("dataset_id", &self.dataset_id())
            .finish()
    }
}

/// A set of held dataset locks, acquired in ascending dataset order.
#[must_use = "the dataset locks are released as soon as the set is dropped"]
pub struct LockSet {
    guards: Vec<DatasetGuard>,
}

impl LockSet {
    pub(crate) fn new(guards: Vec<DatasetGuard>) -> Self {
        Self { guards }
    }

    /// Returns the identifiers of the datasets whose locks are held, in acquisition order.
    pub fn dataset_ids(&self) -> Vec<ResourceId> {
        self.guards.iter().filter_map(DatasetGuard::dataset_id).collect()
    }

    /// Returns the number of held locks.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Returns `true` if no lock is held.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl fmt::Debug for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockSet")
            .field("dataset_ids", &self.dataset_ids())
            .finish()
    }
}
