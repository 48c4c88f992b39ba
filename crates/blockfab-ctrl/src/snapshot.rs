//! Snapshot definitions and their per-node snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CtrlError, CtrlResult};
use crate::types::{NodeName, ResourceName, SnapshotName};

/// Flags of a [`SnapshotDefinition`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotDfnFlags(u32);

impl SnapshotDfnFlags {
    /// No flag set.
    pub const NONE: SnapshotDfnFlags = SnapshotDfnFlags(0);
    /// Deletion requested; waits for every node to confirm.
    pub const DELETE: SnapshotDfnFlags = SnapshotDfnFlags(0x01);
    /// Snapshot is being shipped to another node.
    pub const SHIPPING: SnapshotDfnFlags = SnapshotDfnFlags(0x02);
    /// Shipping finished and its resources are being released.
    pub const SHIPPING_CLEANUP: SnapshotDfnFlags = SnapshotDfnFlags(0x04);
    /// A node failed to apply the snapshot, or persisting it failed.
    pub const FAILED_DEPLOYMENT: SnapshotDfnFlags = SnapshotDfnFlags(0x08);
    /// A participating node disconnected.
    pub const FAILED_DISCONNECT: SnapshotDfnFlags = SnapshotDfnFlags(0x10);
    /// Every node took the snapshot and resumed I/O.
    pub const SUCCESSFUL: SnapshotDfnFlags = SnapshotDfnFlags(0x20);

    const NAMES: [(SnapshotDfnFlags, &'static str); 6] = [
        (Self::DELETE, "DELETE"),
        (Self::SHIPPING, "SHIPPING"),
        (Self::SHIPPING_CLEANUP, "SHIPPING_CLEANUP"),
        (Self::FAILED_DEPLOYMENT, "FAILED_DEPLOYMENT"),
        (Self::FAILED_DISCONNECT, "FAILED_DISCONNECT"),
        (Self::SUCCESSFUL, "SUCCESSFUL"),
    ];

    /// Flags that end the coordination protocol.
    pub fn terminal() -> SnapshotDfnFlags {
        Self::SUCCESSFUL | Self::FAILED_DEPLOYMENT | Self::FAILED_DISCONNECT
    }

    /// Returns true if any of `other`'s bits are set.
    pub fn is_set(self, other: SnapshotDfnFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Sets `other`'s bits.
    pub fn enable(&mut self, other: SnapshotDfnFlags) {
        self.0 |= other.0;
    }

    /// Names of the set flags, for listings.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.is_set(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for SnapshotDfnFlags {
    type Output = SnapshotDfnFlags;

    fn bitor(self, rhs: SnapshotDfnFlags) -> SnapshotDfnFlags {
        SnapshotDfnFlags(self.0 | rhs.0)
    }
}

/// Phase of the coordination protocol for one definition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotPhase {
    /// Created; nothing commanded yet.
    Requested,
    /// Suspend commanded.
    Suspending,
    /// Every node reported suspended I/O.
    Suspended,
    /// Take commanded.
    SnapshotRequested,
    /// Every node reported the snapshot taken.
    SnapshotTaken,
    /// Resume commanded.
    Resuming,
    /// Terminal: completed.
    Successful,
    /// Terminal: a node failed or persisting failed.
    FailedDeployment,
    /// Terminal: a node disconnected.
    FailedDisconnect,
    /// Waiting for nodes to confirm deletion.
    Deleting,
}

impl SnapshotPhase {
    /// Returns true for the phases that end the protocol.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SnapshotPhase::Successful | SnapshotPhase::FailedDeployment | SnapshotPhase::FailedDisconnect
        )
    }
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A snapshot of the resource on one node.
///
/// `suspend_resource` and `take_snapshot` are commands for the node; what the
/// node actually did is reported through its satellite state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Node the snapshot is taken on.
    pub node: NodeName,
    /// Command: delete the snapshot.
    pub delete: bool,
    /// Command: suspend I/O on the resource.
    pub suspend_resource: bool,
    /// Command: take the snapshot.
    pub take_snapshot: bool,
}

impl Snapshot {
    /// A snapshot with nothing commanded.
    pub fn new(node: NodeName) -> Self {
        Self {
            node,
            delete: false,
            suspend_resource: false,
            take_snapshot: false,
        }
    }
}

/// A cluster-wide snapshot of one resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDefinition {
    /// Identity sent to satellites.
    pub uuid: Uuid,
    /// Resource the snapshot belongs to.
    pub resource: ResourceName,
    /// Name, unique within the resource.
    pub name: SnapshotName,
    /// Deletion and outcome flags.
    pub flags: SnapshotDfnFlags,
    /// The coordination protocol is running.
    pub in_progress: bool,
    /// Per-resource creation order. Used instead of timestamps, which are not
    /// comparable across nodes.
    pub sequence_number: u64,
    /// Current protocol phase.
    pub phase: SnapshotPhase,
    snapshots: BTreeMap<NodeName, Snapshot>,
}

impl SnapshotDefinition {
    /// A definition in phase `Requested` with a fresh UUID and no nodes.
    pub fn new(resource: ResourceName, name: SnapshotName, sequence_number: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            resource,
            name,
            flags: SnapshotDfnFlags::NONE,
            in_progress: false,
            sequence_number,
            phase: SnapshotPhase::Requested,
            snapshots: BTreeMap::new(),
        }
    }

    /// Adds `node` as a participant.
    pub fn add_snapshot(&mut self, node: NodeName) -> CtrlResult<()> {
        if self.snapshots.contains_key(&node) {
            return Err(CtrlError::AlreadyExists {
                kind: "snapshot",
                name: format!("{}/{}@{}", self.resource, self.name, node),
            });
        }
        self.snapshots.insert(node.clone(), Snapshot::new(node));
        Ok(())
    }

    /// The snapshot on `node`.
    pub fn snapshot(&self, node: &NodeName) -> Option<&Snapshot> {
        self.snapshots.get(node)
    }

    /// Per-node snapshots, in node name order.
    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    /// Mutable per-node snapshots.
    pub fn snapshots_mut(&mut self) -> impl Iterator<Item = &mut Snapshot> {
        self.snapshots.values_mut()
    }

    /// Participating nodes.
    pub fn nodes(&self) -> Vec<NodeName> {
        self.snapshots.keys().cloned().collect()
    }

    /// Returns true while any node still has its snapshot.
    pub fn has_snapshots(&self) -> bool {
        !self.snapshots.is_empty()
    }

    /// Drops a participant.
    pub fn remove_snapshot(&mut self, node: &NodeName) -> Option<Snapshot> {
        self.snapshots.remove(node)
    }

    /// Returns true once deletion was requested.
    pub fn is_deleting(&self) -> bool {
        self.flags.is_set(SnapshotDfnFlags::DELETE)
    }

    /// Returns true once the protocol completed.
    pub fn is_successful(&self) -> bool {
        self.flags.is_set(SnapshotDfnFlags::SUCCESSFUL)
    }

    /// Flags the definition and every per-node snapshot for deletion.
    pub fn mark_deleted(&mut self) {
        self.flags.enable(SnapshotDfnFlags::DELETE);
        for snapshot in self.snapshots.values_mut() {
            snapshot.delete = true;
        }
        self.set_phase(SnapshotPhase::Deleting);
    }

    /// Ends the protocol with a terminal flag.
    pub fn mark_terminal(&mut self, flag: SnapshotDfnFlags) {
        self.flags.enable(flag);
        self.in_progress = false;
        let phase = if flag == SnapshotDfnFlags::SUCCESSFUL {
            SnapshotPhase::Successful
        } else if flag == SnapshotDfnFlags::FAILED_DISCONNECT {
            SnapshotPhase::FailedDisconnect
        } else {
            SnapshotPhase::FailedDeployment
        };
        self.set_phase(phase);
    }

    /// Moves to `phase`, logging the transition.
    pub fn set_phase(&mut self, phase: SnapshotPhase) {
        if self.phase != phase {
            debug!(
                resource = %self.resource,
                snapshot = %self.name,
                from = %self.phase,
                to = %phase,
                "snapshot phase transition"
            );
            self.phase = phase;
        }
    }

    /// Listing view of this definition.
    pub fn list_item(&self) -> SnapshotDfnListItem {
        SnapshotDfnListItem {
            uuid: self.uuid,
            resource: self.resource.clone(),
            name: self.name.clone(),
            flags: self.flags.names(),
            phase: self.phase,
            in_progress: self.in_progress,
            sequence_number: self.sequence_number,
            nodes: self.nodes(),
        }
    }
}

/// Listing view of a [`SnapshotDefinition`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SnapshotDfnListItem {
    /// Identity of the definition.
    pub uuid: Uuid,
    /// Owning resource.
    pub resource: ResourceName,
    /// Snapshot name.
    pub name: SnapshotName,
    /// Names of the set [`SnapshotDfnFlags`].
    pub flags: Vec<&'static str>,
    /// Current protocol phase.
    pub phase: SnapshotPhase,
    /// The protocol is still running.
    pub in_progress: bool,
    /// Creation order within the resource.
    pub sequence_number: u64,
    /// Participating nodes.
    pub nodes: Vec<NodeName>,
}
