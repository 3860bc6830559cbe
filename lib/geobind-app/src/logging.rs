//! Logging.

use anyhow::Context as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

use crate::{BindingConfiguration, GenericError};

/// Initializes the logging subsystem for `tracing`.
///
/// Logs are filtered with the configured log level, and written to standard error either as JSON or in a compact,
/// human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error is returned.
pub fn initialize_logging(config: &BindingConfiguration) -> Result<(), GenericError> {
    let filter = config.log_level().as_env_filter();

    if config.log_format_json() {
        let json_layer = tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_thread_names(true)
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(json_layer.with_filter(filter))
            .try_init()
            .context("Failed to initialize logging.")
    } else {
        let compact_layer = tracing_subscriber::fmt::Layer::new()
            .compact()
            .with_target(true)
            .with_thread_names(true)
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(compact_layer.with_filter(filter))
            .try_init()
            .context("Failed to initialize logging.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialization_fails() {
        let config = BindingConfiguration::default();

        // Other tests in this binary may have initialized logging first.
        let _ = initialize_logging(&config);
        assert!(initialize_logging(&config).is_err());
    }
}
