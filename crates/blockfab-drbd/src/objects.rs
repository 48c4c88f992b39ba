//! The kernel-visible state tree: resources, connections and volumes.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::observer::StateChange;
use crate::types::{parse_flag, ConnectionState, DiskState, ReplState, Role, VolumeNumber};

const KEY_ROLE: &str = "role";
const KEY_SUSPENDED: &str = "suspended";
const KEY_PROMOTION_SCORE: &str = "promotion_score";
const KEY_MAY_PROMOTE: &str = "may_promote";
const KEY_CONNECTION: &str = "connection";
const KEY_PEER_NODE_ID: &str = "peer-node-id";
const KEY_MINOR: &str = "minor";
const KEY_DISK: &str = "disk";
const KEY_PEER_DISK: &str = "peer-disk";
const KEY_REPLICATION: &str = "replication";
const KEY_DONE: &str = "done";

/// A DRBD resource as seen by the local kernel.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DrbdResource {
    /// Resource name.
    pub name: String,
    /// Local role.
    pub role: Role,
    /// Whether I/O is suspended.
    pub suspended: bool,
    /// Promotion score, if reported.
    pub promotion_score: Option<i32>,
    /// Whether the resource may be promoted, if reported.
    pub may_promote: Option<bool>,
    /// Connections indexed by peer name.
    pub connections: BTreeMap<String, DrbdConnection>,
    /// Local volumes indexed by volume number.
    pub volumes: BTreeMap<VolumeNumber, DrbdVolume>,
}

impl DrbdResource {
    /// Creates an empty resource in role `Unknown`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Unknown,
            suspended: false,
            promotion_score: None,
            may_promote: None,
            connections: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }

    /// Applies the properties of a `resource` line.
    pub fn update(&mut self, props: &BTreeMap<String, String>, changes: &mut Vec<StateChange>) {
        if let Some(text) = props.get(KEY_ROLE) {
            let role = Role::parse(text);
            if role != self.role {
                changes.push(StateChange::RoleChanged {
                    resource: self.name.clone(),
                    previous: self.role,
                    current: role,
                });
                self.role = role;
            }
        }
        if let Some(suspended) = props.get(KEY_SUSPENDED).and_then(|s| parse_flag(s)) {
            self.suspended = suspended;
        }
        if let Some(score) = props
            .get(KEY_PROMOTION_SCORE)
            .and_then(|s| s.parse::<i32>().ok())
        {
            if self.promotion_score != Some(score) {
                changes.push(StateChange::PromotionScoreChanged {
                    resource: self.name.clone(),
                    previous: self.promotion_score,
                    current: score,
                });
                self.promotion_score = Some(score);
            }
        }
        if let Some(may) = props.get(KEY_MAY_PROMOTE).and_then(|s| parse_flag(s)) {
            if self.may_promote != Some(may) {
                changes.push(StateChange::MayPromoteChanged {
                    resource: self.name.clone(),
                    previous: self.may_promote,
                    current: may,
                });
                self.may_promote = Some(may);
            }
        }
    }

    /// Returns the local volume with the given number.
    pub fn volume(&self, number: VolumeNumber) -> Option<&DrbdVolume> {
        self.volumes.get(&number)
    }

    /// Returns the connection to the named peer.
    pub fn connection(&self, peer: &str) -> Option<&DrbdConnection> {
        self.connections.get(peer)
    }
}

/// Connection from the local resource to one peer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DrbdConnection {
    /// Peer (connection) name.
    pub peer_name: String,
    /// DRBD node id of the peer, if reported.
    pub peer_node_id: Option<u32>,
    /// Connection state.
    pub state: ConnectionState,
    /// Role of the peer resource.
    pub peer_role: Role,
    /// Peer volumes indexed by volume number.
    pub volumes: BTreeMap<VolumeNumber, DrbdVolume>,
}

impl DrbdConnection {
    /// Creates a connection in state `Unknown`.
    pub fn new(peer_name: impl Into<String>) -> Self {
        Self {
            peer_name: peer_name.into(),
            peer_node_id: None,
            state: ConnectionState::Unknown,
            peer_role: Role::Unknown,
            volumes: BTreeMap::new(),
        }
    }

    /// Applies the properties of a `connection` line.
    pub fn update(
        &mut self,
        resource: &str,
        props: &BTreeMap<String, String>,
        changes: &mut Vec<StateChange>,
    ) {
        if let Some(id) = props.get(KEY_PEER_NODE_ID).and_then(|s| s.parse::<u32>().ok()) {
            self.peer_node_id = Some(id);
        }
        if let Some(text) = props.get(KEY_CONNECTION) {
            let state = ConnectionState::parse(text);
            if state != self.state {
                changes.push(StateChange::ConnectionStateChanged {
                    resource: resource.to_string(),
                    peer: self.peer_name.clone(),
                    previous: self.state,
                    current: state,
                });
                self.state = state;
            }
        }
        if let Some(text) = props.get(KEY_ROLE) {
            let role = Role::parse(text);
            if role != self.peer_role {
                changes.push(StateChange::PeerRoleChanged {
                    resource: resource.to_string(),
                    peer: self.peer_name.clone(),
                    previous: self.peer_role,
                    current: role,
                });
                self.peer_role = role;
            }
        }
    }

    /// Returns the peer volume with the given number.
    pub fn volume(&self, number: VolumeNumber) -> Option<&DrbdVolume> {
        self.volumes.get(&number)
    }
}

/// A local (`device`) or peer (`peer-device`) volume.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DrbdVolume {
    /// Volume number.
    pub number: VolumeNumber,
    /// Minor number, local volumes only.
    pub minor: Option<u32>,
    /// Disk state (`disk` for local, `peer-disk` for peer volumes).
    pub disk_state: DiskState,
    /// Replication state, peer volumes only.
    pub repl_state: ReplState,
    /// Resync progress, if a resync is running.
    pub done_percentage: Option<f32>,
}

impl DrbdVolume {
    /// Creates a volume with unknown states.
    pub fn new(number: VolumeNumber) -> Self {
        Self {
            number,
            minor: None,
            disk_state: DiskState::Unknown,
            repl_state: ReplState::Unknown,
            done_percentage: None,
        }
    }

    /// Applies the properties of a `device` (peer `None`) or `peer-device` line.
    pub fn update(
        &mut self,
        resource: &str,
        peer: Option<&str>,
        props: &BTreeMap<String, String>,
        changes: &mut Vec<StateChange>,
    ) {
        if peer.is_none() {
            if let Some(minor) = props.get(KEY_MINOR).and_then(|s| s.parse::<u32>().ok()) {
                if self.minor != Some(minor) {
                    changes.push(StateChange::MinorChanged {
                        resource: resource.to_string(),
                        volume: self.number,
                        previous: self.minor,
                        current: minor,
                    });
                    self.minor = Some(minor);
                }
            }
        }

        let disk_key = if peer.is_none() { KEY_DISK } else { KEY_PEER_DISK };
        if let Some(text) = props.get(disk_key) {
            let disk = DiskState::parse(text);
            if disk != self.disk_state {
                changes.push(StateChange::DiskStateChanged {
                    resource: resource.to_string(),
                    peer: peer.map(str::to_string),
                    volume: self.number,
                    previous: self.disk_state,
                    current: disk,
                });
                self.disk_state = disk;
            }
        }

        if let Some(text) = props.get(KEY_REPLICATION) {
            let repl = ReplState::parse(text);
            if repl != self.repl_state {
                changes.push(StateChange::ReplicationStateChanged {
                    resource: resource.to_string(),
                    peer: peer.map(str::to_string),
                    volume: self.number,
                    previous: self.repl_state,
                    current: repl,
                });
                self.repl_state = repl;
            }
        }

        if let Some(done) = props.get(KEY_DONE).and_then(|s| s.parse::<f32>().ok()) {
            if self.done_percentage != Some(done) {
                changes.push(StateChange::DonePercentageChanged {
                    resource: resource.to_string(),
                    peer: peer.map(str::to_string),
                    volume: self.number,
                    previous: self.done_percentage,
                    current: done,
                });
                self.done_percentage = Some(done);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resource_role_change_emits_once() {
        let mut rsc = DrbdResource::new("r0");
        let mut changes = Vec::new();
        rsc.update(&props(&[("role", "Primary")]), &mut changes);
        rsc.update(&props(&[("role", "Primary")]), &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(rsc.role, Role::Primary);
    }

    #[test]
    fn test_resource_suspended_is_silent() {
        let mut rsc = DrbdResource::new("r0");
        let mut changes = Vec::new();
        rsc.update(&props(&[("suspended", "yes")]), &mut changes);
        assert!(rsc.suspended);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_local_volume_uses_disk_key() {
        let mut vol = DrbdVolume::new(VolumeNumber::new(0).unwrap());
        let mut changes = Vec::new();
        vol.update(
            "r0",
            None,
            &props(&[("disk", "UpToDate"), ("peer-disk", "Failed"), ("minor", "1000")]),
            &mut changes,
        );
        assert_eq!(vol.disk_state, DiskState::UpToDate);
        assert_eq!(vol.minor, Some(1000));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_peer_volume_uses_peer_disk_key() {
        let mut vol = DrbdVolume::new(VolumeNumber::new(0).unwrap());
        let mut changes = Vec::new();
        vol.update(
            "r0",
            Some("beta"),
            &props(&[("disk", "UpToDate"), ("peer-disk", "Outdated"), ("minor", "7")]),
            &mut changes,
        );
        assert_eq!(vol.disk_state, DiskState::Outdated);
        assert_eq!(vol.minor, None);
        assert!(matches!(
            &changes[0],
            StateChange::DiskStateChanged { peer: Some(p), .. } if p == "beta"
        ));
    }

    #[test]
    fn test_connection_state_and_peer_role() {
        let mut conn = DrbdConnection::new("beta");
        let mut changes = Vec::new();
        conn.update(
            "r0",
            &props(&[("connection", "Connected"), ("role", "Primary"), ("peer-node-id", "2")]),
            &mut changes,
        );
        assert_eq!(conn.state, ConnectionState::Connected);
        assert_eq!(conn.peer_role, Role::Primary);
        assert_eq!(conn.peer_node_id, Some(2));
        assert_eq!(changes.len(), 2);
    }
}
