//! Value types reported by DRBD in events2 lines.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Volume number within a DRBD resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeNumber(u32);

impl VolumeNumber {
    /// Highest volume number DRBD accepts.
    pub const MAX: u32 = 65535;

    /// Creates a volume number, rejecting values out of DRBD's range.
    pub fn new(value: u32) -> Option<Self> {
        if value <= Self::MAX {
            Some(VolumeNumber(value))
        } else {
            None
        }
    }

    /// Returns the raw value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource role.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Device is promoted.
    Primary,
    /// Device is not promoted.
    Secondary,
    /// Role not known (peer not connected, unparsable value).
    Unknown,
}

impl Role {
    /// Parses the events2 representation; unrecognized values map to `Unknown`.
    pub fn parse(text: &str) -> Self {
        match text {
            "Primary" => Role::Primary,
            "Secondary" => Role::Secondary,
            _ => Role::Unknown,
        }
    }

    /// Returns the events2 representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "Primary",
            Role::Secondary => "Secondary",
            Role::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disk state of a local or peer volume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskState {
    /// No backing disk attached.
    Diskless,
    /// Backing disk is being attached.
    Attaching,
    /// Backing disk is being detached.
    Detaching,
    /// Backing disk failed with an I/O error.
    Failed,
    /// Disk state is being negotiated with a peer.
    Negotiating,
    /// Data is known to be inconsistent.
    Inconsistent,
    /// Data is consistent but outdated.
    Outdated,
    /// Peer disk state is unknown.
    DUnknown,
    /// Data is consistent, currency not yet known.
    Consistent,
    /// Data is consistent and current.
    UpToDate,
    /// Unparsable state.
    Unknown,
}

impl DiskState {
    /// Parses the events2 representation; unrecognized values map to `Unknown`.
    pub fn parse(text: &str) -> Self {
        match text {
            "Diskless" => DiskState::Diskless,
            "Attaching" => DiskState::Attaching,
            "Detaching" => DiskState::Detaching,
            "Failed" => DiskState::Failed,
            "Negotiating" => DiskState::Negotiating,
            "Inconsistent" => DiskState::Inconsistent,
            "Outdated" => DiskState::Outdated,
            "DUnknown" => DiskState::DUnknown,
            "Consistent" => DiskState::Consistent,
            "UpToDate" => DiskState::UpToDate,
            _ => DiskState::Unknown,
        }
    }

    /// Returns the events2 representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskState::Diskless => "Diskless",
            DiskState::Attaching => "Attaching",
            DiskState::Detaching => "Detaching",
            DiskState::Failed => "Failed",
            DiskState::Negotiating => "Negotiating",
            DiskState::Inconsistent => "Inconsistent",
            DiskState::Outdated => "Outdated",
            DiskState::DUnknown => "DUnknown",
            DiskState::Consistent => "Consistent",
            DiskState::UpToDate => "UpToDate",
            DiskState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication state of a peer volume.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ReplState {
    Off,
    Established,
    StartingSyncS,
    StartingSyncT,
    WFBitMapS,
    WFBitMapT,
    WFSyncUUID,
    SyncSource,
    SyncTarget,
    PausedSyncS,
    PausedSyncT,
    VerifyS,
    VerifyT,
    Ahead,
    Behind,
    Unknown,
}

impl ReplState {
    /// Parses the events2 representation; unrecognized values map to `Unknown`.
    pub fn parse(text: &str) -> Self {
        match text {
            "Off" => ReplState::Off,
            "Established" => ReplState::Established,
            "StartingSyncS" => ReplState::StartingSyncS,
            "StartingSyncT" => ReplState::StartingSyncT,
            "WFBitMapS" => ReplState::WFBitMapS,
            "WFBitMapT" => ReplState::WFBitMapT,
            "WFSyncUUID" => ReplState::WFSyncUUID,
            "SyncSource" => ReplState::SyncSource,
            "SyncTarget" => ReplState::SyncTarget,
            "PausedSyncS" => ReplState::PausedSyncS,
            "PausedSyncT" => ReplState::PausedSyncT,
            "VerifyS" => ReplState::VerifyS,
            "VerifyT" => ReplState::VerifyT,
            "Ahead" => ReplState::Ahead,
            "Behind" => ReplState::Behind,
            _ => ReplState::Unknown,
        }
    }

    /// Returns true while a resynchronization is running or paused.
    pub fn is_syncing(&self) -> bool {
        matches!(
            self,
            ReplState::SyncSource
                | ReplState::SyncTarget
                | ReplState::PausedSyncS
                | ReplState::PausedSyncT
        )
    }
}

impl fmt::Display for ReplState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connection state towards a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ConnectionState {
    StandAlone,
    Disconnecting,
    Unconnected,
    Timeout,
    BrokenPipe,
    NetworkFailure,
    ProtocolError,
    TearDown,
    Connecting,
    Connected,
    Unknown,
}

impl ConnectionState {
    /// Parses the events2 representation; unrecognized values map to `Unknown`.
    pub fn parse(text: &str) -> Self {
        match text {
            "StandAlone" => ConnectionState::StandAlone,
            "Disconnecting" => ConnectionState::Disconnecting,
            "Unconnected" => ConnectionState::Unconnected,
            "Timeout" => ConnectionState::Timeout,
            "BrokenPipe" => ConnectionState::BrokenPipe,
            "NetworkFailure" => ConnectionState::NetworkFailure,
            "ProtocolError" => ConnectionState::ProtocolError,
            "TearDown" => ConnectionState::TearDown,
            "Connecting" => ConnectionState::Connecting,
            "Connected" => ConnectionState::Connected,
            _ => ConnectionState::Unknown,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Parses the events2 boolean representation (`yes`/`no`, `true`/`false`).
pub fn parse_flag(text: &str) -> Option<bool> {
    match text {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}
