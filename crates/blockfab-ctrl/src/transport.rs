//! Outbound messages to satellites. The wire format belongs to the transport
//! layer; the controller only decides who is told what.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snapshot::{Snapshot, SnapshotDefinition};
use crate::types::{NodeName, ResourceName, SnapshotName};

/// Tells a satellite that its in-progress snapshot changed and should be fetched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNotification {
    /// Resource the snapshot belongs to.
    pub resource: ResourceName,
    /// Identity of the snapshot definition.
    pub snapshot_uuid: Uuid,
    /// Name of the snapshot definition.
    pub snapshot_name: SnapshotName,
}

impl SnapshotNotification {
    /// Notification about `dfn`.
    pub fn for_definition(dfn: &SnapshotDefinition) -> Self {
        Self {
            resource: dfn.resource.clone(),
            snapshot_uuid: dfn.uuid,
            snapshot_name: dfn.name.clone(),
        }
    }
}

/// Data a satellite receives for its snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressSnapshot {
    /// Identity of the snapshot definition.
    pub snapshot_uuid: Uuid,
    /// Resource the snapshot belongs to.
    pub resource: ResourceName,
    /// Name of the snapshot definition.
    pub snapshot_name: SnapshotName,
    /// Suspend I/O on the resource.
    pub suspend_resource: bool,
    /// Take the snapshot.
    pub take_snapshot: bool,
    /// Delete the snapshot.
    pub delete: bool,
}

impl InProgressSnapshot {
    /// Commands of `snapshot` within `dfn`.
    pub fn new(dfn: &SnapshotDefinition, snapshot: &Snapshot) -> Self {
        Self {
            snapshot_uuid: dfn.uuid,
            resource: dfn.resource.clone(),
            snapshot_name: dfn.name.clone(),
            suspend_resource: snapshot.suspend_resource,
            take_snapshot: snapshot.take_snapshot,
            delete: snapshot.delete,
        }
    }
}

/// Reply to a satellite asking for its in-progress snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InProgressSnapshotReply {
    /// The commands the satellite should apply.
    Data(InProgressSnapshot),
    /// The snapshot is gone or no longer in progress.
    Ended {
        /// Requested resource, as sent by the satellite.
        resource: String,
        /// Requested snapshot, as sent by the satellite.
        snapshot_name: String,
    },
}

/// One-way channel to satellites. Sends must not block.
pub trait SatelliteNotifier: Send + Sync {
    /// Queues `notification` for `node`. Undeliverable notifications are dropped.
    fn notify_snapshot(&self, node: &NodeName, notification: &SnapshotNotification);
}
