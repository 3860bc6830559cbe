//! Registry of live native resources.
//!
//! The [`ObjectRegistry`] is the single source of truth for whether a native resource is still valid, which dataset
//! owns it, and which lock must be held to touch it. Every host wrapper is registered here under a stable
//! [`ResourceId`], and every native call starts by asking the registry for the lock of the dataset it touches.
//!
//! # Locking
//!
//! Two layers of locks are involved:
//!
//! - the structural lock guarding the registry's own indexes, held only for short, non-blocking bookkeeping
//! - one lock per dataset, shared by all of its descendants and held for the whole duration of a native call
//!
//! The structural lock is always the innermost lock: it is never held while blocking on a dataset lock. Locking several
//! datasets at once always happens in ascending dataset identifier order, which rules out lock-order inversions between
//! two operations naming the same datasets in different orders.

use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use metrics::gauge;
use tracing::{debug, warn};

use crate::{
    error::Error,
    handle::{NativePtr, ResourceHandle, ResourceId, ResourceKind},
    host::HostRef,
    native::NativeLibrary,
};

mod lock;
use self::lock::DatasetLock;
pub use self::lock::{DatasetGuard, LockSet};

type FastHashMap<K, V> = hashbrown::HashMap<K, V, foldhash::quality::RandomState>;

/// Describes a resource about to be registered.
#[derive(Clone, Copy, Debug)]
pub struct NewEntry {
    kind: ResourceKind,
    ptr: NativePtr,
    owner: Option<ResourceId>,
    is_result_set: bool,
    owned: bool,
}

impl NewEntry {
    /// Describes an open dataset.
    pub fn dataset(ptr: NativePtr) -> Self {
        Self {
            kind: ResourceKind::Dataset,
            ptr,
            owner: None,
            is_result_set: false,
            owned: true,
        }
    }

    /// Describes a resource living under a dataset.
    ///
    /// `owner` may name the dataset itself, or any resource already attached to it.
    pub fn child(kind: ResourceKind, ptr: NativePtr, owner: ResourceId) -> Self {
        Self {
            kind,
            ptr,
            owner: Some(owner),
            is_result_set: false,
            owned: false,
        }
    }

    /// Describes a free-standing resource, such as a spatial reference or a geometry.
    ///
    /// The resource is destroyed through the native library when disposed, unless marked as [borrowed][Self::borrowed].
    pub fn unparented(kind: ResourceKind, ptr: NativePtr) -> Self {
        Self {
            kind,
            ptr,
            owner: None,
            is_result_set: false,
            owned: true,
        }
    }

    /// Marks the layer as the result set of a query, which must be released back to its dataset when disposed.
    pub fn result_set(mut self) -> Self {
        self.is_result_set = true;
        self
    }

    /// Marks the resource as owned by the native library rather than by the binding.
    pub fn borrowed(mut self) -> Self {
        self.owned = false;
        self
    }

    /// Returns the kind of the resource.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Returns the native address of the resource.
    pub fn ptr(&self) -> NativePtr {
        self.ptr
    }

    /// Returns the requested owner of the resource, if any.
    pub fn owner(&self) -> Option<ResourceId> {
        self.owner
    }
}

/// Outcome of [`ObjectRegistry::add`].
#[derive(Debug)]
pub struct Registration {
    id: ResourceId,
    wrapper: HostRef,
    is_new: bool,
}

impl Registration {
    /// Returns the identifier assigned to the resource.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Returns the host wrapper registered for the resource.
    pub fn wrapper(&self) -> &HostRef {
        &self.wrapper
    }

    /// Consumes the registration, returning the host wrapper.
    pub fn into_wrapper(self) -> HostRef {
        self.wrapper
    }

    /// Returns `true` if the resource was not registered before this call.
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

struct Entry {
    handle: ResourceHandle,
    owner: Option<ResourceId>,
    children: BTreeSet<ResourceId>,
    lock: Option<DatasetLock>,
    wrapper: Weak<dyn Any + Send + Sync>,
    is_result_set: bool,
    owned: bool,
}

struct RegistryState {
    next_id: u64,
    entries: FastHashMap<ResourceId, Entry>,
    by_ptr: FastHashMap<(ResourceKind, NativePtr), ResourceId>,
    live_by_kind: FastHashMap<ResourceKind, usize>,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            next_id: 1,
            entries: FastHashMap::default(),
            by_ptr: FastHashMap::default(),
            live_by_kind: FastHashMap::default(),
        }
    }

    fn allocate_id(&mut self) -> ResourceId {
        let id = ResourceId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }

    fn is_alive(&self, id: ResourceId) -> bool {
        self.entries.contains_key(&id)
    }

    fn ensure_alive(&self, ids: &[ResourceId]) -> Result<(), Error> {
        match ids.iter().find(|id| !self.is_alive(**id)) {
            Some(id) => Err(Error::already_disposed(*id)),
            None => Ok(()),
        }
    }

    fn lookup(&self, kind: ResourceKind, ptr: NativePtr) -> Option<ResourceId> {
        self.by_ptr.get(&(kind, ptr)).copied()
    }

    fn wrapper_of(&self, id: ResourceId) -> Option<HostRef> {
        self.entries.get(&id).and_then(|entry| entry.wrapper.upgrade())
    }

    /// Resolves the dataset that `id` belongs to, which is `id` itself for datasets.
    fn dataset_of(&self, id: ResourceId) -> Result<ResourceId, Error> {
        let entry = self.entries.get(&id).ok_or(Error::already_disposed(id))?;
        if entry.handle.kind().is_dataset() {
            return Ok(id);
        }

        entry.owner.ok_or_else(|| {
            Error::invalid_argument(format!("{} {} is not attached to a dataset", entry.handle.kind(), id))
        })
    }

    fn lock_of(&self, id: ResourceId) -> Result<Option<DatasetLock>, Error> {
        self.entries
            .get(&id)
            .map(|entry| entry.lock.clone())
            .ok_or(Error::already_disposed(id))
    }

    /// Resolves the dataset that a resource being wrapped lives under, along with the dataset's wrapper.
    ///
    /// A dataset whose wrapper is unreachable is awaiting finalization, which would take any new child down with it, so
    /// it is treated as disposed.
    fn parent_of(&self, owner: Option<ResourceId>) -> Result<Option<(ResourceId, HostRef)>, Error> {
        let Some(owner) = owner else {
            return Ok(None);
        };

        let dataset_id = self.dataset_of(owner)?;
        let parent = self
            .wrapper_of(dataset_id)
            .ok_or(Error::already_disposed(dataset_id))?;
        Ok(Some((dataset_id, parent)))
    }

    /// Registers a resource with no wrapper yet, returning its new identifier.
    fn reserve(
        &mut self,
        entry: NewEntry,
        owner: Option<ResourceId>,
        library: &Arc<dyn NativeLibrary>,
    ) -> Result<ResourceId, Error> {
        let parent_lock = match owner {
            Some(owner) => self.lock_of(owner)?,
            None => None,
        };

        let id = self.allocate_id();
        let lock = if entry.kind.is_dataset() {
            Some(DatasetLock::new(id, entry.ptr, Arc::clone(library)))
        } else {
            parent_lock
        };

        self.entries.insert(
            id,
            Entry {
                handle: ResourceHandle::new(id, entry.kind, entry.ptr),
                owner,
                children: BTreeSet::new(),
                lock,
                wrapper: unwrapped(),
                is_result_set: entry.is_result_set,
                owned: entry.owned,
            },
        );
        self.by_ptr.insert((entry.kind, entry.ptr), id);
        if let Some(owner) = owner.and_then(|owner| self.entries.get_mut(&owner)) {
            owner.children.insert(id);
        }
        self.adjust_live(entry.kind, true);

        Ok(id)
    }

    fn adjust_live(&mut self, kind: ResourceKind, added: bool) {
        let live = self.live_by_kind.entry(kind).or_default();
        if added {
            *live += 1;
        } else {
            *live = live.saturating_sub(1);
        }

        gauge!("geobind.registry.live_resources", "kind" => kind.as_str()).set(*live as f64);
    }

    /// Removes `id` and everything beneath it, depth-first, collecting the removed entries children first.
    fn remove_tree(&mut self, id: ResourceId, removed: &mut Vec<Entry>) {
        let children = match self.entries.get_mut(&id) {
            Some(entry) => std::mem::take(&mut entry.children),
            None => return,
        };

        for child in children {
            self.remove_tree(child, removed);
        }

        if let Some(entry) = self.entries.remove(&id) {
            self.by_ptr.remove(&(entry.handle.kind(), entry.handle.ptr()));
            if let Some(owner) = entry.owner.and_then(|owner| self.entries.get_mut(&owner)) {
                owner.children.remove(&id);
            }
            self.adjust_live(entry.handle.kind(), false);
            removed.push(entry);
        }
    }
}

fn unwrapped() -> Weak<dyn Any + Send + Sync> {
    Weak::<()>::new()
}

/// Disposes of a reserved resource if building its wrapper unwinds.
struct PendingWrap<'a> {
    registry: &'a ObjectRegistry,
    id: ResourceId,
    armed: bool,
}

impl Drop for PendingWrap<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(resource_id = %self.id, "Building host wrapper failed. Disposing resource.");
            self.registry.finalize(self.id);
        }
    }
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    library: Arc<dyn NativeLibrary>,
}

/// Registry of live native resources.
///
/// `ObjectRegistry` is cheaply cloneable: all clones share the same state, and can be freely sent to worker threads.
#[derive(Clone)]
pub struct ObjectRegistry {
    inner: Arc<RegistryInner>,
}

impl ObjectRegistry {
    /// Creates an empty registry releasing resources through the given native library.
    pub fn new(library: Arc<dyn NativeLibrary>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::new()),
                library,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().expect("registry structural lock poisoned")
    }

    /// Registers a native resource, or returns its existing registration.
    ///
    /// When the resource is already registered and its host wrapper is still reachable, the existing identifier and
    /// wrapper are returned and `wrap` is never called. When it is registered but its wrapper has become unreachable
    /// and is awaiting finalization, `wrap` builds a replacement wrapper under the existing identifier. Otherwise, a new
    /// identifier is allocated and passed to `wrap`.
    ///
    /// Resources living under a dataset are passed the dataset's wrapper as their parent, which their own wrapper is
    /// expected to keep reachable.
    ///
    /// `wrap` runs without holding the structural lock. If another wrapper is installed for the same resource while it
    /// runs, that wrapper is returned instead. If `wrap` panics, the resource is disposed as if its wrapper had become
    /// unreachable.
    ///
    /// # Errors
    ///
    /// If the owner has been disposed, or if the wrapper of its dataset is no longer reachable, an `AlreadyDisposed`
    /// error is returned. If the entry is inconsistent (a dataset with an owner, a result set outside of a dataset, an
    /// owner not attached to any dataset), an `InvalidArgument` error is returned.
    pub fn add<F>(&self, entry: NewEntry, wrap: F) -> Result<Registration, Error>
    where
        F: FnOnce(ResourceId, Option<HostRef>) -> HostRef,
    {
        if entry.kind.is_dataset() && entry.owner.is_some() {
            return Err(Error::invalid_argument("a dataset cannot be owned by another resource"));
        }
        if entry.is_result_set && (entry.kind != ResourceKind::Layer || entry.owner.is_none()) {
            return Err(Error::invalid_argument("only layers of a dataset can be result sets"));
        }

        let (id, parent, is_new) = {
            let mut state = self.state();
            let existing = state
                .lookup(entry.kind, entry.ptr)
                .and_then(|id| state.entries.get(&id).map(|existing| (id, existing.owner)));

            match existing {
                Some((id, owner)) => {
                    if let Some(wrapper) = state.wrapper_of(id) {
                        return Ok(Registration {
                            id,
                            wrapper,
                            is_new: false,
                        });
                    }

                    let parent = state.parent_of(owner)?.map(|(_, parent)| parent);
                    (id, parent, false)
                }
                None => {
                    let (owner, parent) = state.parent_of(entry.owner)?.unzip();
                    let id = state.reserve(entry, owner, &self.inner.library)?;
                    (id, parent, true)
                }
            }
        };

        let mut pending = PendingWrap {
            registry: self,
            id,
            armed: true,
        };
        let wrapper = wrap(id, parent);
        pending.armed = false;

        // Declared after `wrapper`, so that a discarded wrapper is dropped once the lock is released.
        let mut state = self.state();
        let installed = state.entries.get_mut(&id).ok_or(Error::already_disposed(id))?;
        if let Some(winner) = installed.wrapper.upgrade() {
            return Ok(Registration {
                id,
                wrapper: winner,
                is_new: false,
            });
        }

        installed.wrapper = Arc::downgrade(&wrapper);
        if is_new {
            debug!(resource_id = %id, kind = %entry.kind, owner = ?installed.owner, "Registered resource.");
        } else {
            debug!(resource_id = %id, kind = %entry.kind, "Rewrapped resource awaiting finalization.");
        }

        Ok(Registration { id, wrapper, is_new })
    }

    /// Disposes of a resource and, first, of everything beneath it.
    ///
    /// Disposing an unknown or already disposed identifier does nothing.
    pub fn dispose(&self, id: ResourceId) {
        let mut removed = Vec::new();
        self.state().remove_tree(id, &mut removed);

        self.release(removed);
    }

    /// Disposes of a resource if its host wrapper is no longer reachable.
    ///
    /// This is the path taken by wrapper finalizers: a resource that was wrapped again after its previous wrapper became
    /// unreachable is left alone. Returns `true` if the resource was disposed.
    pub fn finalize(&self, id: ResourceId) -> bool {
        let mut removed = Vec::new();
        {
            let mut state = self.state();
            match state.entries.get(&id) {
                Some(entry) if entry.wrapper.strong_count() == 0 => state.remove_tree(id, &mut removed),
                _ => return false,
            }
        }

        self.release(removed);
        true
    }

    fn release(&self, removed: Vec<Entry>) {
        for entry in removed {
            let handle = entry.handle;
            match &entry.lock {
                Some(lock) if entry.is_result_set => lock.release_result_set(handle.ptr()),
                Some(_) => {}
                None if entry.owned => self.inner.library.destroy(handle.kind(), handle.ptr()),
                None => {}
            }

            debug!(resource_id = %handle.id(), kind = %handle.kind(), "Disposed resource.");
        }
    }

    /// Returns `true` if the resource has been registered and not yet disposed.
    pub fn is_alive(&self, id: ResourceId) -> bool {
        self.state().is_alive(id)
    }

    /// Checks that every given resource is alive.
    ///
    /// # Errors
    ///
    /// If any of the resources has been disposed, an `AlreadyDisposed` error naming the first of them is returned.
    pub fn ensure_alive(&self, ids: &[ResourceId]) -> Result<(), Error> {
        self.state().ensure_alive(ids)
    }

    /// Returns `true` if the native resource is registered.
    pub fn has(&self, kind: ResourceKind, ptr: NativePtr) -> bool {
        self.state().lookup(kind, ptr).is_some()
    }

    /// Returns the identifier and host wrapper of a registered native resource.
    ///
    /// Returns `None` if the resource is not registered, or if its wrapper is no longer reachable.
    pub fn get(&self, kind: ResourceKind, ptr: NativePtr) -> Option<(ResourceId, HostRef)> {
        let state = self.state();
        let id = state.lookup(kind, ptr)?;
        state.wrapper_of(id).map(|wrapper| (id, wrapper))
    }

    /// Returns the host wrapper of a registered native resource, downcast to its concrete type.
    pub fn get_as<T>(&self, kind: ResourceKind, ptr: NativePtr) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get(kind, ptr).and_then(|(_, wrapper)| wrapper.downcast::<T>().ok())
    }

    /// Returns the dataset that a live resource belongs to, which is the resource itself for datasets.
    ///
    /// # Errors
    ///
    /// If the resource has been disposed, an `AlreadyDisposed` error is returned. If it is not attached to any dataset,
    /// an `InvalidArgument` error is returned.
    pub fn dataset_of(&self, id: ResourceId) -> Result<ResourceId, Error> {
        self.state().dataset_of(id)
    }

    /// Returns the host wrapper of a resource, if it is still reachable.
    pub fn wrapper_of(&self, id: ResourceId) -> Option<HostRef> {
        self.state().wrapper_of(id)
    }

    /// Acquires the structural lock.
    ///
    /// This allows checking liveness and acting on the result atomically. The registry cannot be otherwise used from the
    /// current thread until the guard is dropped.
    pub fn structural(&self) -> StructuralGuard<'_> {
        StructuralGuard { state: self.state() }
    }

    /// Locks the dataset that the given resource belongs to.
    ///
    /// Blocks the current thread until the lock is available. Resources that are not attached to any dataset need no
    /// lock, and get a guard holding nothing.
    ///
    /// # Errors
    ///
    /// If the resource is disposed before the lock is requested, or while waiting on it, an `AlreadyDisposed` error is
    /// returned.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn try_lock_dataset(&self, id: ResourceId) -> Result<DatasetGuard, Error> {
        let lock = self.state().lock_of(id)?;
        let guard = match lock {
            Some(lock) => lock.acquire(),
            None => DatasetGuard::unheld(),
        };

        // Disposal may have raced with the wait.
        self.ensure_alive(&[id])?;
        Ok(guard)
    }

    /// Locks every dataset that the given resources belong to.
    ///
    /// Locks are acquired in ascending dataset identifier order, each dataset being locked once no matter how many of the
    /// given resources belong to it.
    ///
    /// # Errors
    ///
    /// If any of the resources is disposed before the locks are requested, or while waiting on them, an
    /// `AlreadyDisposed` error is returned and no lock is held.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn try_lock_datasets(&self, ids: &[ResourceId]) -> Result<LockSet, Error> {
        let locks = {
            let state = self.state();
            let mut locks = BTreeMap::new();
            for id in ids {
                if let Some(lock) = state.lock_of(*id)? {
                    locks.entry(lock.dataset_id()).or_insert(lock);
                }
            }
            locks
        };

        let guards = locks.into_values().map(|lock| lock.acquire()).collect();
        let set = LockSet::new(guards);

        self.ensure_alive(ids)?;
        Ok(set)
    }

    /// Returns the identifiers of all live resources of the given kind, in ascending order.
    pub fn ids_of_kind(&self, kind: ResourceKind) -> Vec<ResourceId> {
        let state = self.state();
        let mut ids = state
            .entries
            .values()
            .filter(|entry| entry.handle.kind() == kind)
            .map(|entry| entry.handle.id())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Returns a snapshot of the registry state for observability.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state();
        let live_by_kind = state
            .live_by_kind
            .iter()
            .filter(|(_, live)| **live > 0)
            .map(|(kind, live)| (*kind, *live))
            .collect();

        RegistrySnapshot {
            live_by_kind,
            total_live: state.entries.len(),
            next_id: ResourceId::from_raw(state.next_id),
        }
    }
}

/// A held structural lock, for atomic check-and-act sequences.
///
/// Dataset locks must not be requested, and resources must not be disposed, while this guard is held.
pub struct StructuralGuard<'a> {
    state: MutexGuard<'a, RegistryState>,
}

impl StructuralGuard<'_> {
    /// Returns `true` if the resource has been registered and not yet disposed.
    pub fn is_alive(&self, id: ResourceId) -> bool {
        self.state.is_alive(id)
    }

    /// Returns `true` if the native resource is registered.
    pub fn has(&self, kind: ResourceKind, ptr: NativePtr) -> bool {
        self.state.lookup(kind, ptr).is_some()
    }

    /// Returns the identifier of a registered native resource.
    pub fn get(&self, kind: ResourceKind, ptr: NativePtr) -> Option<ResourceId> {
        self.state.lookup(kind, ptr)
    }

    /// Returns the handle of a live resource.
    pub fn handle(&self, id: ResourceId) -> Option<ResourceHandle> {
        self.state.entries.get(&id).map(|entry| entry.handle)
    }

    /// Returns the dataset owning a live resource, if it has one.
    pub fn owner_of(&self, id: ResourceId) -> Option<ResourceId> {
        self.state.entries.get(&id).and_then(|entry| entry.owner)
    }

    /// Returns the dataset that a live resource belongs to, which is the resource itself for datasets.
    pub fn dataset_of(&self, id: ResourceId) -> Result<ResourceId, Error> {
        self.state.dataset_of(id)
    }

    /// Returns the children of a live dataset, in ascending order.
    pub fn children_of(&self, id: ResourceId) -> Vec<ResourceId> {
        self.state
            .entries
            .get(&id)
            .map(|entry| entry.children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if the resource is a layer registered as a result set.
    pub fn is_result_set(&self, id: ResourceId) -> bool {
        self.state.entries.get(&id).is_some_and(|entry| entry.is_result_set)
    }
}

/// A snapshot of the registry state.
#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
    /// Number of live resources of each kind, for kinds with at least one live resource.
    pub live_by_kind: BTreeMap<ResourceKind, usize>,

    /// Total number of live resources.
    pub total_live: usize,

    /// Identifier that the next registered resource will get.
    pub next_id: ResourceId,
}
