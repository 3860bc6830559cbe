//! Layered configuration loading.
#![deny(missing_docs)]

use std::{borrow::Cow, collections::BTreeSet, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::FileProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field, including the matching environment variable when
        /// environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field did not have the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to load configuration."))]
    Generic {
        /// Error source.
        source: figment::Error,
    },
}

impl ConfigurationError {
    fn from_figment(env_prefixes: &BTreeSet<String>, e: figment::Error) -> Self {
        match e.kind {
            Kind::MissingField(field) => {
                let mut keys = vec![field.to_string()];
                keys.extend(
                    env_prefixes
                        .iter()
                        .map(|prefix| format!("{}{}", prefix, field.replace('.', "_").to_uppercase())),
                );

                Self::MissingField {
                    help_text: format!("Try setting `{}`.", keys.join("` or `")),
                    field,
                }
            }
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e },
        }
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl BoxedProvider {
    fn new<P: Provider + Send + Sync + 'static>(provider: P) -> Self {
        Self(Box::new(provider))
    }
}

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader pulling from files and environment variables.
///
/// Sources are merged in the order they are added, later sources taking precedence over earlier ones. The merged
/// configuration can be deserialized directly ([`into_typed`][Self::into_typed]), or queried by key
/// ([`into_generic`][Self::into_generic]).
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefixes: BTreeSet<String>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Adds the given values as the lowest-precedence source.
    ///
    /// # Errors
    ///
    /// If the values cannot be serialized as a map, an error is returned.
    pub fn with_defaults<T>(mut self, defaults: &T) -> Result<Self, ConfigurationError>
    where
        T: Serialize,
    {
        let data = Serialized::defaults(defaults).data().context(Generic)?;
        let dict = data.get(&Profile::Default).cloned().unwrap_or_default();
        self.providers.insert(0, BoxedProvider::new(Serialized::defaults(dict)));
        Ok(self)
    }

    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or is not valid YAML, an error is returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let provider = FileProvider::from_yaml(&path).context(Generic)?;
        self.providers.push(BoxedProvider::new(provider));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring it if it cannot be read or parsed.
    pub fn try_from_yaml<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        self.try_from_file(FileProvider::from_yaml(&path), path.as_ref())
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or is not valid JSON, an error is returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let provider = FileProvider::from_json(&path).context(Generic)?;
        self.providers.push(BoxedProvider::new(provider));
        Ok(self)
    }

    /// Attempts to load the given JSON configuration file, ignoring it if it cannot be read or parsed.
    pub fn try_from_json<P>(self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        self.try_from_file(FileProvider::from_json(&path), path.as_ref())
    }

    fn try_from_file(mut self, provider: Result<FileProvider, figment::Error>, path: &Path) -> Self {
        match provider {
            Ok(provider) => self.providers.push(BoxedProvider::new(provider)),
            Err(e) => {
                debug!(error = %e, file_path = %path.display(), "Unable to read configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables starting with the given prefix.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so that a prefix of `geobind`
    /// matches `GEOBIND_WORKER_THREADS` as the key `worker_threads`. The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment cannot be read, an error is returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` is not `Send`, so its values are captured now.
        let data = Env::prefixed(&prefix).data().context(Generic)?;
        if let Some(dict) = data.get(&Profile::Default) {
            self.providers.push(BoxedProvider::new(Serialized::defaults(dict.clone())));
        }
        self.env_prefixes.insert(prefix);
        Ok(self)
    }

    fn figment(&self) -> Figment {
        self.providers
            .iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider))
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized into `T`, an error is returned.
    pub fn into_typed<T>(self) -> Result<T, ConfigurationError>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.figment()
            .extract()
            .map_err(|e| ConfigurationError::from_figment(&self.env_prefixes, e))
    }

    /// Consumes the loader, returning the merged configuration for keyed access.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.figment(),
                env_prefixes: self.env_prefixes,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: BTreeSet<String>,
}

/// Merged configuration, queried by key.
///
/// Keys are in the form of `a.b.c`, where periods indicate a nested value. Environment variables have no nesting, so a
/// nested key missing from the files is also looked up with periods replaced by underscores.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let figment = &self.inner.figment;
        match figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) && key.contains('.') => figment
                .extract_inner(&key.replace('.', "_"))
                .map_err(|e| ConfigurationError::from_figment(&self.inner.env_prefixes, e)),
            Err(e) => Err(ConfigurationError::from_figment(&self.inner.env_prefixes, e)),
        }
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or its value cannot be deserialized into `T`, an error is returned.
    pub fn get_typed<T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the value exists but cannot be deserialized into `T`, an error is returned.
    pub fn try_get_typed<T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: for<'de> Deserialize<'de>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Gets a configuration value by key, falling back to the default value of `T` if it is missing or invalid.
    pub fn get_typed_or_default<T>(&self, key: &str) -> T
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized into `T`, an error is returned.
    pub fn as_typed<T>(&self) -> Result<T, ConfigurationError>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| ConfigurationError::from_figment(&self.inner.env_prefixes, e))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::NamedTempFile;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Pool {
        worker_threads: usize,
        #[serde(default)]
        async_enabled: bool,
    }

    fn file_with(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn later_sources_take_precedence() {
        let yaml = file_with(".yaml", "worker_threads: 2\nasync_enabled: true\n");
        let json = file_with(".json", r#"{ "worker_threads": 8 }"#);

        let pool: Pool = ConfigurationLoader::default()
            .from_yaml(yaml.path())
            .unwrap()
            .from_json(json.path())
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(
            pool,
            Pool {
                worker_threads: 8,
                async_enabled: true
            }
        );
    }

    #[test]
    fn defaults_have_lowest_precedence() {
        let yaml = file_with(".yaml", "worker_threads: 3\n");

        let pool: Pool = ConfigurationLoader::default()
            .from_yaml(yaml.path())
            .unwrap()
            .with_defaults(&Pool {
                worker_threads: 1,
                async_enabled: true,
            })
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(pool.worker_threads, 3);
        assert!(pool.async_enabled);
    }

    #[test]
    fn missing_optional_file_is_ignored() {
        let config = ConfigurationLoader::default()
            .try_from_yaml("/nonexistent/geobind.yaml")
            .try_from_json("/nonexistent/geobind.json")
            .into_generic();

        assert_eq!(config.try_get_typed::<usize>("worker_threads").unwrap(), None);
        assert!(ConfigurationLoader::default().from_yaml("/nonexistent/geobind.yaml").is_err());
    }

    #[test]
    fn environment_variables_are_prefixed() {
        std::env::set_var("GEOBINDTEST_ENV_WORKER_THREADS", "6");

        let config = ConfigurationLoader::default()
            .from_environment("geobindtest_env")
            .unwrap()
            .into_generic();

        assert_eq!(config.get_typed::<usize>("worker_threads").unwrap(), 6);
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }

    #[test]
    fn missing_field_names_environment_variable() {
        let config = ConfigurationLoader::default()
            .from_environment("GEOBINDTEST_MISSING")
            .unwrap()
            .into_generic();

        let error = config.get_typed::<String>("log_level").unwrap_err();
        match error {
            ConfigurationError::MissingField { help_text, field } => {
                assert_eq!(field, "log_level");
                assert!(help_text.contains("GEOBINDTEST_MISSING_LOG_LEVEL"), "{}", help_text);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn invalid_field_type_reported() {
        let yaml = file_with(".yaml", "worker_threads: many\n");
        let config = ConfigurationLoader::default().from_yaml(yaml.path()).unwrap().into_generic();

        assert!(matches!(
            config.get_typed::<usize>("worker_threads"),
            Err(ConfigurationError::InvalidFieldType { .. })
        ));
        assert_eq!(config.get_typed_or_default::<usize>("worker_threads"), 0);
    }

    #[test]
    fn nested_keys() {
        let yaml = file_with(".yaml", "logging:\n  level: debug\n");
        let config = ConfigurationLoader::default().from_yaml(yaml.path()).unwrap().into_generic();

        assert_eq!(config.get_typed::<String>("logging.level").unwrap(), "debug");
        assert!(config.as_typed::<Pool>().is_err());
    }
}
