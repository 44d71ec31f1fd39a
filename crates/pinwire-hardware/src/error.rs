//! Error types for GPIO backend operations.
//!
//! Adapters report failures as [`BackendError`]. The pin layer converts them
//! into [`pinwire_core::Error`] so callers deal with a single taxonomy.

/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while driving a GPIO backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or opened.
    #[error("Backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    /// The GPIO daemon rejected a command.
    #[error("Daemon command {command} failed with code {code}")]
    Command { command: u32, code: i32 },

    /// Operation is not supported by this backend.
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Communication with the backend failed mid-operation.
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// The backend returned data that could not be interpreted.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Backend configuration error.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The line handle has already been released.
    #[error("Line handle already closed")]
    Closed,

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Create a new unavailable error.
    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a new unsupported operation error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create a new communication error.
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    /// Create a new invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a new configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl From<BackendError> for pinwire_core::Error {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unavailable { backend, reason } => {
                pinwire_core::Error::BackendUnavailable { backend, reason }
            }
            BackendError::Configuration { message } => pinwire_core::Error::Config(message),
            BackendError::Io(io) => pinwire_core::Error::Io(io),
            other => pinwire_core::Error::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_error() {
        let error = BackendError::unavailable("daemon", "connection refused");
        assert_eq!(
            error.to_string(),
            "Backend daemon unavailable: connection refused"
        );
    }

    #[test]
    fn test_command_error_display() {
        let error = BackendError::Command {
            command: 5,
            code: -8,
        };
        assert_eq!(error.to_string(), "Daemon command 5 failed with code -8");
    }

    #[test]
    fn test_conversion_into_core_error() {
        let core: pinwire_core::Error = BackendError::unavailable("sysfs", "missing").into();
        assert!(matches!(
            core,
            pinwire_core::Error::BackendUnavailable { .. }
        ));

        let core: pinwire_core::Error = BackendError::communication("reset by peer").into();
        assert_eq!(
            core.to_string(),
            "Backend error: Communication error: reset by peer"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "value file");
        let error: BackendError = io_error.into();
        assert!(matches!(error, BackendError::Io(_)));
    }
}
