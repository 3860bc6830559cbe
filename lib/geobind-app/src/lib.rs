//! Application bootstrap for the binding.
//!
//! Loads the binding configuration, initializes logging, and builds a ready-to-use [`ControlLoop`][geobind_core::ControlLoop].
#![deny(missing_docs)]

/// A type-erased error, carrying context about where it happened.
pub type GenericError = anyhow::Error;

mod bootstrap;
pub use self::bootstrap::bootstrap;

mod config;
pub use self::config::{BindingConfiguration, LogLevel};

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::{bootstrap, logging::initialize_logging, BindingConfiguration, GenericError};
}
