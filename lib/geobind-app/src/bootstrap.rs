//! Bootstrap utilities.

use std::sync::Arc;

use anyhow::Context as _;
use geobind_core::{ControlLoop, NativeLibrary, ObjectRegistry, WorkerPool};
use tracing::info;

use crate::{BindingConfiguration, GenericError};

/// Builds the control loop of a binding to the given native library.
///
/// A worker pool is started unless asynchronous jobs are disabled, in which case their native steps run inline.
///
/// # Errors
///
/// If the worker pool cannot be started, an error is returned.
pub fn bootstrap(library: Arc<dyn NativeLibrary>, config: &BindingConfiguration) -> Result<ControlLoop, GenericError> {
    let pool = match config.worker_pool_configuration() {
        Some(pool_config) => {
            let pool = WorkerPool::new(&pool_config).context("Failed to start worker pool.")?;
            info!(worker_threads = pool.worker_threads(), "Native calls will run on worker threads.");
            Some(pool)
        }
        None => {
            info!("Asynchronous jobs disabled. Native calls will run on the controlling thread.");
            None
        }
    };

    Ok(ControlLoop::new(ObjectRegistry::new(library), pool))
}

#[cfg(test)]
mod tests {
    use geobind_core::{Job, NativePtr, ResourceKind};

    use super::*;

    struct NoopLibrary;

    impl NativeLibrary for NoopLibrary {
        fn close_dataset(&self, _: NativePtr) {}

        fn release_result_set(&self, _: NativePtr, _: NativePtr) {}

        fn destroy(&self, _: ResourceKind, _: NativePtr) {}
    }

    #[test]
    fn threaded_by_default() {
        let ctl = bootstrap(Arc::new(NoopLibrary), &BindingConfiguration::default()).unwrap();
        assert!(ctl.is_threaded());
    }

    #[test]
    fn inline_when_async_disabled() {
        let config = BindingConfiguration::from_configuration(
            &geobind_config::ConfigurationLoader::default()
                .with_defaults(&[("async_enabled", false)].into_iter().collect::<std::collections::BTreeMap<_, _>>())
                .unwrap()
                .into_generic(),
        )
        .unwrap();

        let mut ctl = bootstrap(Arc::new(NoopLibrary), &config).unwrap();
        assert!(!ctl.is_threaded());

        let value = Job::new(|_| Ok(1)).run_sync(&ctl).unwrap();
        assert_eq!(value, 1);
        ctl.run_until_idle();
    }
}
