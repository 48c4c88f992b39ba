//! Error types for DRBD state tracking.

use thiserror::Error;

/// Result type alias for DRBD state tracking operations.
pub type DrbdResult<T> = Result<T, DrbdError>;

/// Error variants for DRBD state tracking.
///
/// `NotReady` and `Absent` describe expected conditions that callers usually
/// map to a default value. `Fatal` is an implementation error and must be
/// surfaced, never skipped over.
#[derive(Debug, Error)]
pub enum DrbdError {
    /// The initial events2 replay has not completed yet.
    #[error("DRBD state tracking is not yet initialized")]
    NotReady,

    /// The requested object is not part of the state tree.
    #[error("{kind} '{name}' is not tracked")]
    Absent {
        /// Object kind, e.g. "resource".
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// The event source produced a line that cannot be interpreted.
    #[error("events source error: {0}")]
    EventsSource(String),

    /// The event stream contradicts the tracked state tree.
    #[error("implementation error: {0}")]
    Fatal(String),

    /// The event source service is not in a state that allows the operation.
    #[error("event service is {state}")]
    InvalidServiceState {
        /// Current service state.
        state: &'static str,
    },

    /// Wraps I/O errors from the event source process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DrbdError {
    /// Returns true for errors that indicate a defect rather than an
    /// expected runtime condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DrbdError::Fatal(_))
    }
}
