//! State change notifications and observer registration masks.
//!
//! Notifications are values, not references into the state tree: they are
//! collected while the tree is locked and delivered after the lock is
//! released, so observers may freely query the tracker.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

use crate::types::{ConnectionState, DiskState, ReplState, Role, VolumeNumber};

/// Bit mask selecting which notifications an observer receives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventMask(u32);

impl EventMask {
    /// Resource creation.
    pub const RES_CREATED: EventMask = EventMask(0x1);
    /// Resource destruction.
    pub const RES_DESTROYED: EventMask = EventMask(0x2);
    /// Local role change.
    pub const ROLE: EventMask = EventMask(0x4);
    /// Peer role change.
    pub const PEER_ROLE: EventMask = EventMask(0x8);
    /// Volume creation.
    pub const VOL_CREATED: EventMask = EventMask(0x10);
    /// Volume destruction.
    pub const VOL_DESTROYED: EventMask = EventMask(0x20);
    /// Minor number change.
    pub const MINOR: EventMask = EventMask(0x40);
    /// Disk state change.
    pub const DISK: EventMask = EventMask(0x80);
    /// Replication state change.
    pub const REPL: EventMask = EventMask(0x100);
    /// Connection creation.
    pub const CONN_CREATED: EventMask = EventMask(0x200);
    /// Connection destruction.
    pub const CONN_DESTROYED: EventMask = EventMask(0x400);
    /// Connection state change.
    pub const CONN: EventMask = EventMask(0x800);
    /// Promotion score change.
    pub const PROMOTION_SCORE: EventMask = EventMask(0x1000);
    /// May-promote change.
    pub const MAY_PROMOTE: EventMask = EventMask(0x2000);
    /// Resync progress change.
    pub const DONE_PERCENTAGE: EventMask = EventMask(0x4000);
    /// Every notification.
    pub const ALL: EventMask = EventMask(0x7FFF);
    /// No notification.
    pub const NONE: EventMask = EventMask(0);

    /// Returns true if every bit of `other` is set in `self`.
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask((self.0 | rhs.0) & EventMask::ALL.0)
    }
}

/// A semantic transition detected in the state tree.
///
/// `peer` is `None` for local volumes (`device`) and `Some` for peer
/// volumes (`peer-device`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum StateChange {
    ResourceCreated {
        resource: String,
    },
    ResourceDestroyed {
        resource: String,
    },
    RoleChanged {
        resource: String,
        previous: Role,
        current: Role,
    },
    PeerRoleChanged {
        resource: String,
        peer: String,
        previous: Role,
        current: Role,
    },
    PromotionScoreChanged {
        resource: String,
        previous: Option<i32>,
        current: i32,
    },
    MayPromoteChanged {
        resource: String,
        previous: Option<bool>,
        current: bool,
    },
    ConnectionCreated {
        resource: String,
        peer: String,
    },
    ConnectionDestroyed {
        resource: String,
        peer: String,
    },
    ConnectionStateChanged {
        resource: String,
        peer: String,
        previous: ConnectionState,
        current: ConnectionState,
    },
    VolumeCreated {
        resource: String,
        peer: Option<String>,
        volume: VolumeNumber,
    },
    VolumeDestroyed {
        resource: String,
        peer: Option<String>,
        volume: VolumeNumber,
    },
    MinorChanged {
        resource: String,
        volume: VolumeNumber,
        previous: Option<u32>,
        current: u32,
    },
    DiskStateChanged {
        resource: String,
        peer: Option<String>,
        volume: VolumeNumber,
        previous: DiskState,
        current: DiskState,
    },
    ReplicationStateChanged {
        resource: String,
        peer: Option<String>,
        volume: VolumeNumber,
        previous: ReplState,
        current: ReplState,
    },
    DonePercentageChanged {
        resource: String,
        peer: Option<String>,
        volume: VolumeNumber,
        previous: Option<f32>,
        current: f32,
    },
}

impl StateChange {
    /// Mask bit this notification is filtered by.
    pub fn mask(&self) -> EventMask {
        match self {
            StateChange::ResourceCreated { .. } => EventMask::RES_CREATED,
            StateChange::ResourceDestroyed { .. } => EventMask::RES_DESTROYED,
            StateChange::RoleChanged { .. } => EventMask::ROLE,
            StateChange::PeerRoleChanged { .. } => EventMask::PEER_ROLE,
            StateChange::PromotionScoreChanged { .. } => EventMask::PROMOTION_SCORE,
            StateChange::MayPromoteChanged { .. } => EventMask::MAY_PROMOTE,
            StateChange::ConnectionCreated { .. } => EventMask::CONN_CREATED,
            StateChange::ConnectionDestroyed { .. } => EventMask::CONN_DESTROYED,
            StateChange::ConnectionStateChanged { .. } => EventMask::CONN,
            StateChange::VolumeCreated { .. } => EventMask::VOL_CREATED,
            StateChange::VolumeDestroyed { .. } => EventMask::VOL_DESTROYED,
            StateChange::MinorChanged { .. } => EventMask::MINOR,
            StateChange::DiskStateChanged { .. } => EventMask::DISK,
            StateChange::ReplicationStateChanged { .. } => EventMask::REPL,
            StateChange::DonePercentageChanged { .. } => EventMask::DONE_PERCENTAGE,
        }
    }

    /// Name of the resource the notification belongs to.
    pub fn resource(&self) -> &str {
        match self {
            StateChange::ResourceCreated { resource }
            | StateChange::ResourceDestroyed { resource }
            | StateChange::RoleChanged { resource, .. }
            | StateChange::PeerRoleChanged { resource, .. }
            | StateChange::PromotionScoreChanged { resource, .. }
            | StateChange::MayPromoteChanged { resource, .. }
            | StateChange::ConnectionCreated { resource, .. }
            | StateChange::ConnectionDestroyed { resource, .. }
            | StateChange::ConnectionStateChanged { resource, .. }
            | StateChange::VolumeCreated { resource, .. }
            | StateChange::VolumeDestroyed { resource, .. }
            | StateChange::MinorChanged { resource, .. }
            | StateChange::DiskStateChanged { resource, .. }
            | StateChange::ReplicationStateChanged { resource, .. }
            | StateChange::DonePercentageChanged { resource, .. } => resource,
        }
    }
}

/// Receives state tree notifications.
///
/// Observers are called from the tracker's single consumer task, in
/// registration order, after the tree lock has been released. They must not
/// block.
pub trait StateObserver: Send + Sync {
    /// A transition selected by the observer's mask happened.
    fn state_changed(&self, change: &StateChange);

    /// The initial replay completed; the tree is a trustworthy baseline.
    fn state_available(&self) {}

    /// The tree is about to be discarded and rebuilt from scratch.
    fn state_unavailable(&self) {}
}
