use std::io;

use snafu::Snafu;

use crate::handle::ResourceId;

/// A failure reported by the native library.
///
/// Native calls report failures as a numeric code, and usually a message describing the last error raised by the
/// library. Both are carried unchanged from the native step of a job to its completion step.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(display("native call failed with code {}: {}", code, message))]
pub struct NativeError {
    code: i32,
    message: String,
}

impl NativeError {
    /// Creates a new `NativeError` from the given code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns the native error code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Returns the native error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Binding error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum Error {
    /// The resource was disposed before the operation could run.
    #[snafu(display("Resource {} already destroyed.", id))]
    AlreadyDisposed {
        /// Identifier of the disposed resource.
        id: ResourceId,
    },

    /// The caller supplied an argument of the wrong type, count, or shape.
    #[snafu(display("Invalid argument: {}", message))]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// The native library reported a failure.
    #[snafu(context(false), display("{}", source))]
    NativeOperation {
        /// Error source.
        source: NativeError,
    },

    /// The native step of a job panicked.
    #[snafu(display("Native step panicked: {}", message))]
    WorkerPanicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The worker pool could not be created.
    #[snafu(display("Failed to build worker pool."))]
    WorkerPool {
        /// Error source.
        source: io::Error,
    },
}

impl Error {
    /// Creates an `AlreadyDisposed` error for the given resource.
    pub fn already_disposed(id: ResourceId) -> Self {
        Self::AlreadyDisposed { id }
    }

    /// Creates an `InvalidArgument` error with the given message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns `true` if this error reports a disposed resource.
    pub fn is_already_disposed(&self) -> bool {
        matches!(self, Self::AlreadyDisposed { .. })
    }

    /// Returns the native failure carried by this error, if any.
    pub fn as_native(&self) -> Option<&NativeError> {
        match self {
            Self::NativeOperation { source } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_errors_convert_with_question_mark() {
        fn call() -> Result<(), Error> {
            Err(NativeError::new(3, "Failure"))?;
            Ok(())
        }

        let error = call().unwrap_err();
        let native = error.as_native().expect("native error");
        assert_eq!(native.code(), 3);
        assert_eq!(native.message(), "Failure");
        assert_eq!(error.to_string(), "native call failed with code 3: Failure");
    }

    #[test]
    fn already_disposed_display() {
        let error = Error::already_disposed(ResourceId::from_raw(12));
        assert!(error.is_already_disposed());
        assert_eq!(error.to_string(), "Resource 12 already destroyed.");
    }
}
