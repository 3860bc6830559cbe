//! Asynchronous jobs.
//!
//! A [`Job`] runs one native operation in two steps:
//!
//! - the native step, which locks the datasets it needs through the [`ObjectRegistry`], makes the native call, and
//!   returns a plain value or a native failure. It runs on a worker thread, and must not touch host values.
//! - the completion step, which converts that value into a host value. It always runs on the controlling thread, and
//!   only after the native step has fully completed.
//!
//! Host values persisted by a job are kept reachable until its completion step has returned, so the resources they wrap
//! cannot be finalized while the native step still uses them.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use metrics::counter;
use tracing::{debug, error};

use crate::{control::ControlLoop, error::Error, handle::ResourceId, host::HostRef, registry::ObjectRegistry};

type NativeStep<T> = Box<dyn FnOnce(&ObjectRegistry) -> Result<T, Error> + Send>;
type CompletionStep<T, R> = Box<dyn FnOnce(T, &[HostRef]) -> Result<R, Error>>;

/// A two-step native operation.
pub struct Job<T, R = T> {
    persisted: Vec<HostRef>,
    required: Vec<ResourceId>,
    main: NativeStep<T>,
    rval: CompletionStep<T, R>,
}

impl<T> Job<T, T>
where
    T: Send + 'static,
{
    /// Creates a new job with the given native step.
    ///
    /// Until a completion step is set with [`rval`][Self::rval], the job completes with the value returned by the native
    /// step.
    pub fn new<F>(main: F) -> Self
    where
        F: FnOnce(&ObjectRegistry) -> Result<T, Error> + Send + 'static,
    {
        Self {
            persisted: Vec::new(),
            required: Vec::new(),
            main: Box::new(main),
            rval: Box::new(|value, _: &[HostRef]| Ok(value)),
        }
    }
}

impl<T, R> Job<T, R>
where
    T: Send + 'static,
    R: 'static,
{
    /// Keeps the given host value reachable until the job has completed.
    pub fn persist<W>(mut self, object: &Arc<W>) -> Self
    where
        W: Any + Send + Sync,
    {
        self.persisted.push(Arc::clone(object) as HostRef);
        self
    }

    /// Keeps the given type-erased host value reachable until the job has completed.
    pub fn persist_ref(mut self, object: HostRef) -> Self {
        self.persisted.push(object);
        self
    }

    /// Requires the given resource to be alive when the job is run.
    ///
    /// Liveness is checked on the controlling thread before anything is dispatched, and a job touching a disposed
    /// resource never reaches its native step.
    pub fn require(mut self, id: ResourceId) -> Self {
        self.required.push(id);
        self
    }

    /// Sets the completion step.
    ///
    /// The completion step receives the value returned by the native step along with the persisted host values, in
    /// the order they were persisted. It is skipped when the native step fails, the failure being passed on unchanged.
    pub fn rval<R2, F>(self, rval: F) -> Job<T, R2>
    where
        F: FnOnce(T, &[HostRef]) -> Result<R2, Error> + 'static,
    {
        Job {
            persisted: self.persisted,
            required: self.required,
            main: self.main,
            rval: Box::new(rval),
        }
    }

    /// Runs the job on the controlling thread, returning its result.
    ///
    /// # Errors
    ///
    /// If a required resource has been disposed, an `AlreadyDisposed` error is returned and the native step never runs.
    /// Otherwise, any error raised by either step is returned.
    pub fn run_sync(self, ctl: &ControlLoop) -> Result<R, Error> {
        ctl.registry().ensure_alive(&self.required)?;
        counter!("geobind.jobs.submitted", "mode" => "sync").increment(1);

        let Self {
            persisted, main, rval, ..
        } = self;
        let outcome = execute(main, ctl.registry());
        complete(outcome, rval, persisted)
    }

    /// Runs the job asynchronously, passing its result to `callback`.
    ///
    /// The native step is dispatched to the worker pool, and `callback` is called on a later turn of the control loop,
    /// with either the converted value or the first error raised by either step.
    ///
    /// # Errors
    ///
    /// If a required resource has been disposed, an `AlreadyDisposed` error is returned, and neither the native step
    /// nor `callback` ever run.
    pub fn run_async<C>(self, ctl: &mut ControlLoop, callback: C) -> Result<(), Error>
    where
        C: FnOnce(Result<R, Error>) + 'static,
    {
        self.run_async_with(ctl, move |_, result| callback(result))
    }

    /// Runs the job asynchronously, passing the control loop and the job's result to `callback`.
    ///
    /// This allows chaining: `callback` may run further jobs on the loop it is given.
    ///
    /// # Errors
    ///
    /// See [`run_async`][Self::run_async].
    pub fn run_async_with<C>(self, ctl: &mut ControlLoop, callback: C) -> Result<(), Error>
    where
        C: FnOnce(&mut ControlLoop, Result<R, Error>) + 'static,
    {
        ctl.registry().ensure_alive(&self.required)?;
        counter!("geobind.jobs.submitted", "mode" => "async").increment(1);

        let Self {
            persisted, main, rval, ..
        } = self;
        ctl.dispatch(
            move |registry| execute(main, registry),
            move |ctl, outcome| callback(ctl, complete(outcome, rval, persisted)),
        );

        Ok(())
    }

    /// Runs the job asynchronously if a callback is given, or synchronously otherwise.
    ///
    /// Returns the result of the job when run synchronously, and `None` once the job has been dispatched otherwise.
    ///
    /// # Errors
    ///
    /// See [`run_sync`][Self::run_sync] and [`run_async`][Self::run_async].
    pub fn run<C>(self, ctl: &mut ControlLoop, callback: Option<C>) -> Result<Option<R>, Error>
    where
        C: FnOnce(Result<R, Error>) + 'static,
    {
        match callback {
            Some(callback) => self.run_async(ctl, callback).map(|()| None),
            None => self.run_sync(ctl).map(Some),
        }
    }
}

fn execute<T>(main: NativeStep<T>, registry: &ObjectRegistry) -> Result<T, Error> {
    match panic::catch_unwind(AssertUnwindSafe(move || main(registry))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(%message, "Native step panicked.");
            Err(Error::WorkerPanicked { message })
        }
    }
}

fn complete<T, R>(outcome: Result<T, Error>, rval: CompletionStep<T, R>, persisted: Vec<HostRef>) -> Result<R, Error> {
    let result = match outcome {
        Ok(value) => rval(value, &persisted),
        Err(e) => {
            debug!(error = %e, "Native step failed.");
            Err(e)
        }
    };

    // Persisted values may only become unreachable once the completion step has returned.
    drop(persisted);

    match result {
        Ok(_) => counter!("geobind.jobs.completed").increment(1),
        Err(_) => counter!("geobind.jobs.failed").increment(1),
    }

    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
