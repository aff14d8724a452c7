//! Error types for the encode control plane.

use thiserror::Error;

use crate::encoder::pipeline::Stage;

/// Main error type for session operations.
///
/// Per-frame failures never surface here; they are reported on the
/// corresponding output frame as a [`TaskFailure`].
#[derive(Error, Debug)]
pub enum EncodeError {
    /// Configuration is inconsistent or unsupported.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input rejected by the session (after flush, bad reference control, etc.).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No free task is available to accept a new frame.
    #[error("Device busy: no free task for a new frame")]
    DeviceBusy,

    /// The session has been closed.
    #[error("Session closed")]
    SessionClosed,

    /// A collaborator refused an operation.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, EncodeError>;

/// Reason a single frame failed terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFailure {
    /// A stage reported an unrecoverable error, or retries were exhausted.
    Stage(Stage),
    /// A stage did not complete within the configured timeout.
    Hang(Stage),
    /// Recode attempts were exhausted on overflow or rate-control rejection.
    RecodeLimit,
    /// Submission to a stage kept failing.
    Submission(Stage),
}

impl TaskFailure {
    /// Whether this failure was caused by hang detection.
    pub fn is_hang(&self) -> bool {
        matches!(self, Self::Hang(_))
    }

    /// Stage in which the failure happened, if stage-specific.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage(stage) | Self::Hang(stage) | Self::Submission(stage) => Some(*stage),
            Self::RecodeLimit => None,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(stage) => write!(f, "stage {:?} failed", stage),
            Self::Hang(stage) => write!(f, "stage {:?} hung", stage),
            Self::RecodeLimit => write!(f, "recode limit exceeded"),
            Self::Submission(stage) => write!(f, "submission to {:?} failed", stage),
        }
    }
}
