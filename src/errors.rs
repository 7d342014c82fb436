use std::backtrace::Backtrace;

use thiserror::Error;

/// Represents errors that can occur while interacting with the device-execution backend. The error categories follow
/// the [Abseil status codes](https://abseil.io/docs/cpp/guides/status-codes) that accelerator runtimes use internally,
/// restricted to the codes this crate actually produces.
///
/// Each variant includes a `backtrace` field that captures the call stack at the point where the error was created,
/// which is useful for debugging. Note that it is represented as a [`String`] and not as a [`Backtrace`] because using
/// the latter in errors is only currently supported in unstable Rust.
///
/// Contract violations (e.g., looking up a device string that was never registered) do not produce [`Error`] values;
/// they panic. Refer to the crate-level documentation for the split between fatal checks and propagated failures.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    #[error("{message}")]
    InvalidArgument { message: String, backtrace: String },

    #[error("{message}")]
    NotFound { message: String, backtrace: String },

    #[error("{message}")]
    FailedPrecondition { message: String, backtrace: String },

    #[error("{message}")]
    Internal { message: String, backtrace: String },
}

impl Error {
    /// Creates a new [`Error::InvalidArgument`].
    pub fn invalid_argument<M: Into<String>>(message: M) -> Self {
        Self::InvalidArgument { message: message.into(), backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::NotFound`].
    pub fn not_found<M: Into<String>>(message: M) -> Self {
        Self::NotFound { message: message.into(), backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::FailedPrecondition`].
    pub fn failed_precondition<M: Into<String>>(message: M) -> Self {
        Self::FailedPrecondition { message: message.into(), backtrace: Backtrace::capture().to_string() }
    }

    /// Creates a new [`Error::Internal`].
    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::Internal { message: message.into(), backtrace: Backtrace::capture().to_string() }
    }

    /// Returns the message that is stored in this [`Error`].
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument { message, .. }
            | Self::NotFound { message, .. }
            | Self::FailedPrecondition { message, .. }
            | Self::Internal { message, .. } => message.as_str(),
        }
    }
}
