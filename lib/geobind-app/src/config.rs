use std::{num::NonZeroUsize, path::Path, thread};

use anyhow::{anyhow, Context as _};
use geobind_config::{ConfigurationLoader, GenericConfiguration};
use geobind_core::WorkerPoolConfiguration;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::GenericError;

const ENV_PREFIX: &str = "GEOBIND";

fn default_worker_threads() -> usize {
    thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

const fn default_true() -> bool {
    true
}

fn default_worker_thread_name() -> String {
    "geobind-worker".to_string()
}

fn default_log_level() -> LogLevel {
    LogLevel("info".to_string())
}

/// Binding configuration.
///
/// Every setting can be given in a YAML file, or through a `GEOBIND_`-prefixed environment variable, which takes
/// precedence.
#[derive(Clone, Debug, Deserialize)]
pub struct BindingConfiguration {
    /// Number of worker threads running native calls.
    ///
    /// Defaults to the available parallelism of the host.
    #[serde(default = "default_worker_threads")]
    worker_threads: usize,

    /// Whether asynchronous jobs run on worker threads.
    ///
    /// When disabled, no worker thread is started, and native steps run inline on the controlling thread. Defaults to
    /// `true`.
    #[serde(default = "default_true")]
    async_enabled: bool,

    /// Prefix of worker thread names.
    ///
    /// Defaults to `geobind-worker`.
    #[serde(default = "default_worker_thread_name")]
    worker_thread_name: String,

    /// Log filtering directives.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    log_level: LogLevel,

    /// Whether logs are written as JSON.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    log_format_json: bool,
}

impl BindingConfiguration {
    /// Creates a new `BindingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `BindingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        config
            .as_typed()
            .context("Failed to parse binding configuration.")
    }

    /// Loads the binding configuration from the given file, if any, and from the environment.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or the resulting configuration is invalid, an error is returned.
    pub fn load(config_file: Option<&Path>) -> Result<Self, GenericError> {
        let mut loader = ConfigurationLoader::default();
        if let Some(path) = config_file {
            loader = loader
                .from_yaml(path)
                .with_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;
        }

        let config = loader.from_environment(ENV_PREFIX)?.into_generic();
        Self::from_configuration(&config)
    }

    /// Returns the number of worker threads.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Returns `true` if asynchronous jobs run on worker threads.
    pub fn async_enabled(&self) -> bool {
        self.async_enabled
    }

    /// Returns the log filtering directives.
    pub fn log_level(&self) -> &LogLevel {
        &self.log_level
    }

    /// Returns `true` if logs are written as JSON.
    pub fn log_format_json(&self) -> bool {
        self.log_format_json
    }

    /// Returns the worker pool configuration, or `None` if asynchronous jobs run inline.
    pub fn worker_pool_configuration(&self) -> Option<WorkerPoolConfiguration> {
        self.async_enabled.then(|| {
            WorkerPoolConfiguration::new(self.worker_threads).with_thread_name(self.worker_thread_name.clone())
        })
    }
}

impl Default for BindingConfiguration {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            async_enabled: true,
            worker_thread_name: default_worker_thread_name(),
            log_level: default_log_level(),
            log_format_json: false,
        }
    }
}

/// Validated log filtering directives, such as `info` or `geobind_core=debug,warn`.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(String);

impl LogLevel {
    /// Returns the directives as an `EnvFilter`.
    pub fn as_env_filter(&self) -> EnvFilter {
        EnvFilter::builder().parse_lossy(&self.0)
    }

    /// Returns the directives.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(anyhow!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&value)
            .context("Failed to parse valid log level.")?;
        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn load_yaml(contents: &str) -> Result<BindingConfiguration, GenericError> {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();

        let config = ConfigurationLoader::default().from_yaml(file.path())?.into_generic();
        BindingConfiguration::from_configuration(&config)
    }

    #[test]
    fn defaults() {
        let config = BindingConfiguration::from_configuration(&ConfigurationLoader::default().into_generic()).unwrap();

        assert!(config.worker_threads() >= 1);
        assert!(config.async_enabled());
        assert_eq!(config.log_level().as_str(), "info");
        assert!(!config.log_format_json());

        let pool = config.worker_pool_configuration().unwrap();
        assert_eq!(pool.thread_name(), "geobind-worker");
        assert_eq!(pool.worker_threads(), config.worker_threads());
    }

    #[test]
    fn file_overrides_defaults() {
        let config = load_yaml(
            "worker_threads: 3\nworker_thread_name: gdal\nlog_level: geobind_core=trace,warn\nlog_format_json: true\n",
        )
        .unwrap();

        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.log_level().as_str(), "geobind_core=trace,warn");
        assert!(config.log_format_json());
        assert_eq!(config.worker_pool_configuration().unwrap().thread_name(), "gdal");
    }

    #[test]
    fn async_disabled_means_no_pool() {
        let config = load_yaml("async_enabled: false\n").unwrap();

        assert!(!config.async_enabled());
        assert!(config.worker_pool_configuration().is_none());
    }

    #[test]
    fn invalid_log_level_rejected() {
        assert!(load_yaml("log_level: \"\"\n").is_err());
        assert!(load_yaml("log_level: \"info,geobind_core=loudest\"\n").is_err());
        assert!(LogLevel::try_from("debug".to_string()).is_ok());
    }
}
