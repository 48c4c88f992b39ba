//! Resource definitions, their per-node resources and the registry that
//! hands out one exclusive lock per resource definition.

use blockfab_drbd::VolumeNumber;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{CtrlError, CtrlResult};
use crate::snapshot::SnapshotDefinition;
use crate::types::{NodeName, ResourceName, SnapshotName};

/// Namespace for DRBD options on resources.
pub const NAMESPC_DRBD_OPTIONS: &str = "DrbdOptions";
/// Set when a volume went from Failed to Diskless; suppresses re-attaching.
pub const KEY_SKIP_DISK: &str = "DrbdOptions/SkipDisk";
/// Value used for boolean properties.
pub const VAL_TRUE: &str = "True";

const MAX_KEY_LEN: usize = 256;
const MAX_VALUE_LEN: usize = 4096;

/// Keys under [`NAMESPC_DRBD_OPTIONS`] that the controller accepts.
const DRBD_OPTION_KEYS: &[&str] = &[
    KEY_SKIP_DISK,
    "DrbdOptions/auto-quorum",
    "DrbdOptions/auto-diskful",
    "DrbdOptions/Net/allow-two-primaries",
    "DrbdOptions/Resource/quorum",
];

/// Hierarchical `a/b/c` string properties.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Props {
    map: BTreeMap<String, String>,
}

impl Props {
    /// No properties set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Sets a property and returns the previous value.
    pub fn set(&mut self, key: &str, value: &str) -> CtrlResult<Option<String>> {
        validate_key(key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(CtrlError::InvalidProperty {
                key: key.to_string(),
                reason: "value is too long",
            });
        }
        Ok(self.map.insert(key.to_string(), value.to_string()))
    }

    /// Removes `key` and returns its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    /// Number of set properties.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no property is set.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn validate_key(key: &str) -> CtrlResult<()> {
    let invalid = |reason| CtrlError::InvalidProperty {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(invalid("key length out of range"));
    }
    if key.split('/').any(str::is_empty) {
        return Err(invalid("key has an empty path segment"));
    }
    let in_drbd_namespace = key
        .strip_prefix(NAMESPC_DRBD_OPTIONS)
        .map_or(false, |rest| rest.starts_with('/'));
    if in_drbd_namespace && !DRBD_OPTION_KEYS.contains(&key) {
        return Err(invalid("unknown DRBD option"));
    }
    Ok(())
}

/// A resource definition deployed on one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Node the resource is deployed on.
    pub node: NodeName,
    /// The node has no local backing disk.
    pub diskless: bool,
    /// Per-node properties such as [`KEY_SKIP_DISK`].
    pub props: Props,
}

impl Resource {
    /// A resource with no properties.
    pub fn new(node: NodeName, diskless: bool) -> Self {
        Self {
            node,
            diskless,
            props: Props::new(),
        }
    }
}

/// Cluster-level definition of a replicated resource.
#[derive(Clone, Debug)]
pub struct ResourceDefinition {
    /// Cluster-wide resource name.
    pub name: ResourceName,
    /// Volume numbers defined for every node.
    pub volumes: BTreeSet<VolumeNumber>,
    resources: BTreeMap<NodeName, Resource>,
    snapshot_dfns: BTreeMap<SnapshotName, SnapshotDefinition>,
    next_sequence_number: u64,
}

impl ResourceDefinition {
    /// A definition with no deployments and no snapshots.
    pub fn new(name: ResourceName, volumes: impl IntoIterator<Item = VolumeNumber>) -> Self {
        Self {
            name,
            volumes: volumes.into_iter().collect(),
            resources: BTreeMap::new(),
            snapshot_dfns: BTreeMap::new(),
            next_sequence_number: 1,
        }
    }

    /// Deploys the resource on another node. Fails if it is already there.
    pub fn add_resource(&mut self, resource: Resource) -> CtrlResult<()> {
        if self.resources.contains_key(&resource.node) {
            return Err(CtrlError::AlreadyExists {
                kind: "resource",
                name: format!("{}@{}", self.name, resource.node),
            });
        }
        self.resources.insert(resource.node.clone(), resource);
        Ok(())
    }

    /// The resource deployed on `node`.
    pub fn resource(&self, node: &NodeName) -> Option<&Resource> {
        self.resources.get(node)
    }

    /// Mutable access to the resource deployed on `node`.
    pub fn resource_mut(&mut self, node: &NodeName) -> Option<&mut Resource> {
        self.resources.get_mut(node)
    }

    /// Every deployment, in node name order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Looks up a snapshot definition by name.
    pub fn snapshot_dfn(&self, name: &SnapshotName) -> Option<&SnapshotDefinition> {
        self.snapshot_dfns.get(name)
    }

    /// Mutable lookup of a snapshot definition.
    pub fn snapshot_dfn_mut(&mut self, name: &SnapshotName) -> Option<&mut SnapshotDefinition> {
        self.snapshot_dfns.get_mut(name)
    }

    /// Every snapshot definition, in name order.
    pub fn snapshot_dfns(&self) -> impl Iterator<Item = &SnapshotDefinition> {
        self.snapshot_dfns.values()
    }

    /// Names of every snapshot definition.
    pub fn snapshot_names(&self) -> Vec<SnapshotName> {
        self.snapshot_dfns.keys().cloned().collect()
    }

    /// Adds a snapshot definition. Fails if the name is taken.
    pub fn add_snapshot_dfn(&mut self, dfn: SnapshotDefinition) -> CtrlResult<()> {
        if self.snapshot_dfns.contains_key(&dfn.name) {
            return Err(CtrlError::AlreadyExists {
                kind: "snapshot definition",
                name: format!("{}/{}", self.name, dfn.name),
            });
        }
        self.snapshot_dfns.insert(dfn.name.clone(), dfn);
        Ok(())
    }

    /// Removes a snapshot definition and returns it.
    pub fn remove_snapshot_dfn(&mut self, name: &SnapshotName) -> Option<SnapshotDefinition> {
        self.snapshot_dfns.remove(name)
    }

    /// The snapshot definition currently in progress, if any.
    pub fn in_progress_snapshot(&self) -> Option<&SnapshotDefinition> {
        self.snapshot_dfns.values().find(|dfn| dfn.in_progress)
    }

    /// Hands out the next sequence number for a new snapshot definition.
    pub fn next_sequence_number(&mut self) -> u64 {
        let seq = self.next_sequence_number;
        self.next_sequence_number += 1;
        seq
    }
}

/// Registry of resource definitions.
///
/// Each definition sits behind its own mutex; holding it serializes every
/// coordination pass and API call for that resource.
#[derive(Default)]
pub struct ResourceDefinitionRegistry {
    dfns: RwLock<BTreeMap<ResourceName, Arc<Mutex<ResourceDefinition>>>>,
}

impl ResourceDefinitionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition. Fails if the name is taken.
    pub fn insert(&self, dfn: ResourceDefinition) -> CtrlResult<()> {
        let mut dfns = self.dfns.write();
        if dfns.contains_key(&dfn.name) {
            return Err(CtrlError::AlreadyExists {
                kind: "resource definition",
                name: dfn.name.to_string(),
            });
        }
        debug!(resource = %dfn.name, "resource definition registered");
        dfns.insert(dfn.name.clone(), Arc::new(Mutex::new(dfn)));
        Ok(())
    }

    /// Handle to a definition.
    pub fn get(&self, name: &ResourceName) -> Option<Arc<Mutex<ResourceDefinition>>> {
        self.dfns.read().get(name).cloned()
    }

    /// Like [`get`](Self::get), but a missing definition is [`CtrlError::NotFound`].
    pub fn require(&self, name: &ResourceName) -> CtrlResult<Arc<Mutex<ResourceDefinition>>> {
        self.get(name).ok_or_else(|| CtrlError::NotFound {
            kind: "resource definition",
            name: name.to_string(),
        })
    }

    /// Unregisters a definition. Returns false if it was unknown.
    pub fn remove(&self, name: &ResourceName) -> bool {
        self.dfns.write().remove(name).is_some()
    }

    /// Names of every registered definition.
    pub fn names(&self) -> Vec<ResourceName> {
        self.dfns.read().keys().cloned().collect()
    }
}
