//! The controlling loop.

use std::{any::Any, sync::Arc};

use slab::Slab;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, Span};

use crate::{
    dispatch::WorkerPool,
    error::Error,
    handle::ResourceId,
    host::{FinalizeSender, Finalizer, HostObject, HostRef},
    registry::{NewEntry, ObjectRegistry},
};

type PendingCompletion = Box<dyn FnOnce(&mut ControlLoop, Box<dyn Any + Send>)>;

struct Completion {
    key: usize,
    outcome: Box<dyn Any + Send>,
}

/// The controlling side of the binding.
///
/// `ControlLoop` owns everything that must only be touched from the controlling thread: host wrappers are created
/// through it, jobs are submitted to it, and their completion steps run when it is turned. It is not `Send`.
///
/// Each turn of the loop first disposes of resources whose wrappers became unreachable, then runs the completion steps
/// of jobs whose native steps have finished, in the order they finished.
pub struct ControlLoop {
    registry: ObjectRegistry,
    pool: Option<WorkerPool>,
    pending: Slab<PendingCompletion>,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
    finalize_tx: FinalizeSender,
    finalize_rx: UnboundedReceiver<ResourceId>,
    next_job_id: u64,
}

impl ControlLoop {
    /// Creates a new `ControlLoop` over the given registry.
    ///
    /// Without a worker pool, native steps of asynchronous jobs run inline when submitted, and their completion steps
    /// still only run once the loop is turned.
    pub fn new(registry: ObjectRegistry, pool: Option<WorkerPool>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();

        Self {
            registry,
            pool,
            pending: Slab::new(),
            completions_tx,
            completions_rx,
            finalize_tx,
            finalize_rx,
            next_job_id: 1,
        }
    }

    /// Returns the object registry.
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Returns `true` if native steps run on a worker pool.
    pub fn is_threaded(&self) -> bool {
        self.pool.is_some()
    }

    /// Returns the number of jobs whose completion step has not run yet.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Wraps a native resource in a host object.
    ///
    /// When the resource already has a reachable wrapper, that wrapper is returned and `build` is never called, so
    /// fetching the same native resource twice yields the same host object. The wrapper of a resource living under a
    /// dataset keeps the dataset's wrapper reachable.
    ///
    /// `build` may freely use the registry. If it panics, the resource is disposed and the registry stays usable.
    ///
    /// # Errors
    ///
    /// If the entry cannot be registered, an error is returned, notably an `AlreadyDisposed` error for a resource living
    /// under a dataset whose wrapper is no longer reachable. If the resource already has a reachable wrapper of a
    /// different type, an `InvalidArgument` error is returned.
    pub fn wrap<T, F>(&self, entry: NewEntry, build: F) -> Result<Arc<HostObject<T>>, Error>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let finalize_tx = self.finalize_tx.clone();
        let registration = self.registry.add(entry, move |id, parent| {
            Arc::new(HostObject::new(id, parent, build(), Finalizer::new(id, finalize_tx))) as HostRef
        })?;

        let id = registration.id();
        registration.into_wrapper().downcast::<HostObject<T>>().map_err(|_| {
            Error::invalid_argument(format!(
                "{} {} is already wrapped as a different type",
                entry.kind(),
                id
            ))
        })
    }

    /// Runs `native` off the controlling thread, then `complete` with its result when the loop is turned.
    ///
    /// `complete` gets the loop itself, and may dispatch further jobs.
    pub(crate) fn dispatch<T, N, C>(&mut self, native: N, complete: C)
    where
        T: Send + 'static,
        N: FnOnce(&ObjectRegistry) -> Result<T, Error> + Send + 'static,
        C: FnOnce(&mut ControlLoop, Result<T, Error>) + 'static,
    {
        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let key = self.pending.insert(Box::new(move |ctl: &mut ControlLoop, outcome: Box<dyn Any + Send>| {
            let outcome = *outcome
                .downcast::<Result<T, Error>>()
                .expect("type mismatch in job completion");
            complete(ctl, outcome)
        }));

        let completions_tx = self.completions_tx.clone();
        let registry = self.registry.clone();
        let span = Span::current();
        let task = move || {
            let _entered = span.entered();
            trace!(job_id, "Running native step.");

            let outcome: Box<dyn Any + Send> = Box::new(native(&registry));
            let _ = completions_tx.send(Completion { key, outcome });
        };

        debug!(job_id, threaded = self.pool.is_some(), "Dispatching job.");
        match &self.pool {
            Some(pool) => pool.submit(task),
            None => task(),
        }
    }

    /// Processes pending finalizations and finished jobs, without blocking.
    ///
    /// Returns the number of jobs completed.
    pub fn turn(&mut self) -> usize {
        self.run_finalizers();

        let mut completed = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.complete(completion);
            completed += 1;
        }

        // Completion steps release persisted values, which may have been the last references to some wrappers.
        self.run_finalizers();

        completed
    }

    /// Turns the loop until no job is in flight anymore.
    ///
    /// Blocks the current thread while waiting for native steps to finish.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn run_until_idle(&mut self) {
        self.turn();

        while !self.pending.is_empty() {
            match self.completions_rx.blocking_recv() {
                Some(completion) => self.complete(completion),
                None => break,
            }
            self.turn();
        }
    }

    fn complete(&mut self, completion: Completion) {
        if let Some(complete) = self.pending.try_remove(completion.key) {
            complete(self, completion.outcome);
        }
    }

    fn run_finalizers(&mut self) {
        while let Ok(id) = self.finalize_rx.try_recv() {
            if self.registry.finalize(id) {
                trace!(resource_id = %id, "Finalized unreachable resource.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        panic::{self, AssertUnwindSafe},
        rc::Rc,
        thread,
    };

    use super::*;
    use crate::{
        handle::ResourceKind,
        job::Job,
        test_util::{control_loop, ptr, NativeEvent},
    };

    #[test]
    fn wrap_returns_existing_wrapper() {
        let (ctl, _) = control_loop(None);

        let first = ctl.wrap(NewEntry::dataset(ptr(0x10)), || "first").unwrap();
        let second = ctl
            .wrap(NewEntry::dataset(ptr(0x10)), || -> &'static str { panic!("wrapper must not be rebuilt") })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(**second, "first");
    }

    #[test]
    fn wrap_rejects_type_mismatch() {
        let (ctl, _) = control_loop(None);

        let _geometry = ctl
            .wrap(NewEntry::unparented(ResourceKind::Geometry, ptr(0x10)), || 1u32)
            .unwrap();
        let error = ctl
            .wrap(NewEntry::unparented(ResourceKind::Geometry, ptr(0x10)), || "geometry")
            .unwrap_err();

        assert!(matches!(error, Error::InvalidArgument { .. }));
    }

    #[test]
    fn child_wrapper_keeps_dataset_reachable() {
        let (mut ctl, library) = control_loop(None);

        let dataset = ctl.wrap(NewEntry::dataset(ptr(0x10)), || ()).unwrap();
        let dataset_id = dataset.id();
        let band = ctl
            .wrap(NewEntry::child(ResourceKind::RasterBand, ptr(0x20), dataset_id), || ())
            .unwrap();
        assert!(band.parent().is_some());

        drop(dataset);
        ctl.turn();
        assert!(ctl.registry().is_alive(dataset_id));

        drop(band);
        ctl.turn();
        assert!(!ctl.registry().is_alive(dataset_id));
        assert_eq!(library.events(), vec![NativeEvent::CloseDataset(ptr(0x10))]);
    }

    #[test]
    fn child_of_unreachable_dataset_rejected() {
        let (mut ctl, library) = control_loop(None);

        let dataset = ctl.wrap(NewEntry::dataset(ptr(0x10)), || ()).unwrap();
        let dataset_id = dataset.id();
        drop(dataset);

        let error = ctl
            .wrap(NewEntry::child(ResourceKind::Layer, ptr(0x20), dataset_id), || ())
            .unwrap_err();
        assert!(matches!(error, Error::AlreadyDisposed { id } if id == dataset_id));
        assert!(!ctl.registry().has(ResourceKind::Layer, ptr(0x20)));

        ctl.turn();
        assert!(!ctl.registry().is_alive(dataset_id));
        assert_eq!(library.events(), vec![NativeEvent::CloseDataset(ptr(0x10))]);
    }

    #[test]
    fn panicking_build_leaves_loop_usable() {
        let (mut ctl, library) = control_loop(Some(1));
        let dataset = ctl.wrap(NewEntry::dataset(ptr(0x10)), || ()).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            ctl.wrap(NewEntry::unparented(ResourceKind::Geometry, ptr(0x20)), || -> u8 {
                panic!("host value construction failed")
            })
        }));
        assert!(result.is_err());
        assert!(!ctl.registry().has(ResourceKind::Geometry, ptr(0x20)));
        assert_eq!(
            library.events(),
            vec![NativeEvent::Destroy(ResourceKind::Geometry, ptr(0x20))]
        );

        let id = dataset.id();
        let outcome = Rc::new(RefCell::new(None));
        {
            let outcome = Rc::clone(&outcome);
            Job::new(move |registry| {
                let _guard = registry.try_lock_dataset(id)?;
                Ok(7)
            })
            .persist(&dataset)
            .require(id)
            .run_async(&mut ctl, move |result| *outcome.borrow_mut() = Some(result.unwrap()))
            .unwrap();
        }
        ctl.run_until_idle();
        assert_eq!(*outcome.borrow(), Some(7));

        let geometry = ctl
            .wrap(NewEntry::unparented(ResourceKind::Geometry, ptr(0x20)), || 2u8)
            .unwrap();
        assert_eq!(**geometry, 2);
    }

    #[test]
    fn unreachable_wrapper_disposed_on_next_turn() {
        let (mut ctl, library) = control_loop(None);

        let srs = ctl
            .wrap(NewEntry::unparented(ResourceKind::SpatialReference, ptr(0x10)), || ())
            .unwrap();
        let id = srs.id();

        drop(srs);
        assert!(ctl.registry().is_alive(id));

        ctl.turn();
        assert!(!ctl.registry().is_alive(id));
        assert_eq!(
            library.events(),
            vec![NativeEvent::Destroy(ResourceKind::SpatialReference, ptr(0x10))]
        );
    }

    #[test]
    fn explicit_disposal_then_finalization_is_harmless() {
        let (mut ctl, library) = control_loop(None);

        let dataset = ctl.wrap(NewEntry::dataset(ptr(0x10)), || ()).unwrap();
        ctl.registry().dispose(dataset.id());
        drop(dataset);
        ctl.turn();

        assert_eq!(library.closed_count(ptr(0x10)), 1);
    }

    #[test]
    fn inline_jobs_complete_on_next_turn() {
        let (mut ctl, _) = control_loop(None);
        assert!(!ctl.is_threaded());

        let caller = thread::current().id();
        let result = Rc::new(RefCell::new(None));
        {
            let result = Rc::clone(&result);
            Job::new(|_| Ok(thread::current().id()))
                .run_async(&mut ctl, move |outcome| *result.borrow_mut() = Some(outcome.unwrap()))
                .unwrap();
        }

        assert!(result.borrow().is_none());
        assert_eq!(ctl.in_flight(), 1);

        assert_eq!(ctl.turn(), 1);
        assert_eq!(*result.borrow(), Some(caller));
        assert_eq!(ctl.in_flight(), 0);
    }

    #[test]
    fn idle_loop_returns_immediately() {
        let (mut ctl, _) = control_loop(Some(1));
        assert!(ctl.is_threaded());

        ctl.run_until_idle();
        assert_eq!(ctl.turn(), 0);
    }
}
