use std::time::Duration;

use thiserror::Error;

use crate::types::{Level, LineId};

/// Why an edge-timing capture lost synchronisation with the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DesyncReason {
    /// Two consecutive edges reported the same level, so a transition was dropped.
    #[error("repeated {level} level, a transition was dropped")]
    RepeatedLevel { level: Level },

    /// A data pulse matched neither the zero nor the one duration range.
    #[error("bit {bit_index}: pulse of {duration:?} matches neither bit range")]
    BitOutOfRange { bit_index: usize, duration: Duration },

    /// A separator pulse between data bits fell outside its allowed range.
    #[error("bit {bit_index}: separator of {duration:?} out of range")]
    SeparatorOutOfRange { bit_index: usize, duration: Duration },

    /// A sample did not match the expected preamble step (strict mode only).
    #[error("preamble step {step}: unexpected {level} pulse of {duration:?}")]
    PreambleMismatch {
        step: usize,
        level: Level,
        duration: Duration,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    // Pin ownership and lifecycle
    #[error("Line {0} is already claimed by another pin")]
    LineBusy(LineId),

    #[error("Backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Line {line}: {operation} not allowed in the current mode")]
    WrongMode { line: LineId, operation: String },

    #[error("Line {0}: PWM is not supported on an input pin")]
    UnsupportedOnInput(LineId),

    #[error("Line {0} is closed")]
    Closed(LineId),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    // Capture and decode
    #[error("Desync: {0}")]
    Desync(DesyncReason),

    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("A read is already in progress")]
    AlreadyInProgress,

    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    // Driver failures
    #[error("Backend error: {0}")]
    Backend(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new backend unavailable error.
    pub fn backend_unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a new wrong mode error for the named operation.
    pub fn wrong_mode(line: LineId, operation: impl Into<String>) -> Self {
        Self::WrongMode {
            line,
            operation: operation.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only checksum mismatches qualify; everything else is either a
    /// programming error or a lost frame that must be re-triggered explicitly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }
}

impl From<DesyncReason> for Error {
    fn from(reason: DesyncReason) -> Self {
        Self::Desync(reason)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
