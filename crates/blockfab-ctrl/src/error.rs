//! Error types for the controller subsystem.

use blockfab_drbd::DrbdError;
use thiserror::Error;

/// Result type alias for controller operations.
pub type CtrlResult<T> = Result<T, CtrlError>;

/// Errors that can occur in the controller subsystem.
///
/// Expected distributed-system conditions (a node that has not reported yet,
/// a snapshot that is still settling) are not errors and never show up here.
#[derive(Debug, Error)]
pub enum CtrlError {
    /// A node, resource or snapshot name failed validation.
    #[error("invalid {kind} name '{name}': {reason}")]
    InvalidName {
        /// Kind of name, e.g. "resource".
        kind: &'static str,
        /// The rejected name.
        name: String,
        /// Why the name was rejected.
        reason: &'static str,
    },

    /// A referenced object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// Another snapshot of the resource has not finished yet.
    #[error("snapshot '{snapshot}' of resource '{resource}' is still in progress")]
    SnapshotInProgress {
        /// Resource name.
        resource: String,
        /// The in-progress snapshot.
        snapshot: String,
    },

    /// Snapshots cannot be taken from diskless resources.
    #[error("cannot create snapshot from diskless resource '{resource}' on node '{node}'")]
    DisklessResource {
        /// Node name.
        node: String,
        /// Resource name.
        resource: String,
    },

    /// The satellite has no active connection.
    #[error("no active connection to satellite '{node}'")]
    NodeNotConnected {
        /// Node name.
        node: String,
    },

    /// No resource qualified as a snapshot target.
    #[error("no resources found for snapshotting '{resource}'")]
    NoResources {
        /// Resource name.
        resource: String,
    },

    /// A property key or value was rejected.
    #[error("invalid property '{key}': {reason}")]
    InvalidProperty {
        /// Property key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The persistence collaborator failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A programming or invariant error.
    #[error("implementation error: {0}")]
    Implementation(String),

    /// Error from the DRBD state tracker.
    #[error(transparent)]
    Drbd(#[from] DrbdError),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl CtrlError {
    /// Returns true for errors that indicate a defect rather than a bad request.
    pub fn is_implementation_error(&self) -> bool {
        matches!(self, CtrlError::Implementation(_))
            || matches!(self, CtrlError::Drbd(err) if err.is_fatal())
    }
}
