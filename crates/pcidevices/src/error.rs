use core::error::Error;
use std::fmt;
use std::io;

use derive_more::Display;
use error_stack::Report;

/// Errors raised while reading or mutating device state.
#[derive(Debug, Display)]
pub enum DeviceError {
    #[display("not found: {what}")]
    NotFound { what: String },
    #[display("sysfs access failed: {message}")]
    Sysfs { message: String },
    #[display("command failed: {message}")]
    Command { message: String },
    #[display("rejected by policy: {message}")]
    Policy { message: String },
    #[display("device plugin protocol error: {message}")]
    Protocol { message: String },
    #[display("record store error: {message}")]
    Store { message: String },
    #[display("failed to parse: {message}")]
    Parse { message: String },
    #[display("kubernetes api error: {message}")]
    Kubernetes { message: String },
}

impl Error for DeviceError {}

impl DeviceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn sysfs(message: impl Into<String>) -> Self {
        Self::Sysfs {
            message: message.into(),
        }
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::Policy {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Maps an io error on `path` to `NotFound` or `Sysfs`.
    pub fn from_io(err: &io::Error, path: impl fmt::Display) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::not_found(path.to_string())
        } else {
            Self::sysfs(format!("{path}: {err}"))
        }
    }
}

pub type DeviceResult<T> = Result<T, Report<DeviceError>>;

/// Returns true when the report was raised for a missing object or path.
pub fn is_not_found(report: &Report<DeviceError>) -> bool {
    matches!(report.current_context(), DeviceError::NotFound { .. })
}

/// Error type handed to the kube controller runtime.
pub struct ReconcileError(pub Report<DeviceError>);

impl fmt::Debug for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl Error for ReconcileError {}

impl From<Report<DeviceError>> for ReconcileError {
    fn from(report: Report<DeviceError>) -> Self {
        Self(report)
    }
}
