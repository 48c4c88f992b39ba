//! Known satellite nodes and their connections.
//!
//! Two lock levels: a read-mostly registry lock guarding which nodes exist and
//! whether they are connected, and one mutex per connected node guarding its
//! [`SatelliteState`]. The registry lock is always released before a node lock
//! is taken, so a slow extraction for one node never blocks lookups or updates
//! for the others.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CtrlError, CtrlResult};
use crate::satellite_state::SatelliteState;
use crate::types::NodeName;

/// An active connection to a satellite.
pub struct Peer {
    node: NodeName,
    state: Mutex<SatelliteState>,
}

impl Peer {
    fn new(node: NodeName) -> Self {
        Self {
            node,
            state: Mutex::new(SatelliteState::new()),
        }
    }

    /// Node this peer belongs to.
    pub fn node(&self) -> &NodeName {
        &self.node
    }
}

/// Registry of nodes. A node without a peer is known but disconnected.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeName, Option<Arc<Peer>>>>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node. Returns false if it was already known.
    pub fn add_node(&self, node: NodeName) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node) {
            return false;
        }
        debug!(node = %node, "node registered");
        nodes.insert(node, None);
        true
    }

    /// Forgets a node entirely.
    pub fn remove_node(&self, node: &NodeName) -> bool {
        self.nodes.write().remove(node).is_some()
    }

    /// Returns true if the node is known, connected or not.
    pub fn contains(&self, node: &NodeName) -> bool {
        self.nodes.read().contains_key(node)
    }

    /// Attaches a fresh peer to a known node, replacing any previous
    /// connection together with its cached state.
    pub fn connect(&self, node: &NodeName) -> CtrlResult<Arc<Peer>> {
        let mut nodes = self.nodes.write();
        let slot = nodes.get_mut(node).ok_or_else(|| CtrlError::NotFound {
            kind: "node",
            name: node.to_string(),
        })?;
        let peer = Arc::new(Peer::new(node.clone()));
        let replaced = slot.replace(Arc::clone(&peer)).is_some();
        info!(node = %node, reconnect = replaced, "satellite connected");
        Ok(peer)
    }

    /// Drops the node's peer and its cached state. Returns false if the node
    /// was not connected.
    pub fn disconnect(&self, node: &NodeName) -> bool {
        let peer = self.nodes.write().get_mut(node).and_then(Option::take);
        if peer.is_some() {
            info!(node = %node, "satellite disconnected");
        }
        peer.is_some()
    }

    /// Returns true if the node has a live peer.
    pub fn is_connected(&self, node: &NodeName) -> bool {
        self.nodes.read().get(node).map_or(false, Option::is_some)
    }

    /// Nodes with a live peer, in name order.
    pub fn connected_nodes(&self) -> Vec<NodeName> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, peer)| peer.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn peer(&self, node: &NodeName) -> Option<Arc<Peer>> {
        self.nodes.read().get(node).and_then(|peer| peer.clone())
    }

    /// Runs `f` on the node's cached state under the node's lock.
    ///
    /// Returns `default` if the node is unknown or not connected; that is an
    /// expected condition, not an error.
    pub fn with_satellite_state<T>(
        &self,
        node: &NodeName,
        f: impl FnOnce(&SatelliteState) -> T,
        default: T,
    ) -> T {
        match self.peer(node) {
            Some(peer) => {
                let state = peer.state.lock();
                f(&state)
            }
            None => default,
        }
    }

    /// Mutating variant of [`NodeRegistry::with_satellite_state`].
    pub fn with_satellite_state_mut<T>(
        &self,
        node: &NodeName,
        f: impl FnOnce(&mut SatelliteState) -> T,
        default: T,
    ) -> T {
        match self.peer(node) {
            Some(peer) => {
                let mut state = peer.state.lock();
                f(&mut state)
            }
            None => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceName;
    use blockfab_drbd::VolumeNumber;
    use std::sync::Barrier;
    use std::thread;

    fn node(name: &str) -> NodeName {
        NodeName::new(name).unwrap()
    }

    fn rsc() -> ResourceName {
        ResourceName::new("r0").unwrap()
    }

    #[test]
    fn test_absent_node_returns_default() {
        let registry = NodeRegistry::new();
        assert_eq!(registry.with_satellite_state(&node("alpha"), |_| 1, 0), 0);

        registry.add_node(node("alpha"));
        assert_eq!(registry.with_satellite_state(&node("alpha"), |_| 1, 0), 0);
        assert!(!registry.is_connected(&node("alpha")));
    }

    #[test]
    fn test_connect_requires_known_node() {
        let registry = NodeRegistry::new();
        assert!(matches!(
            registry.connect(&node("alpha")),
            Err(CtrlError::NotFound { .. })
        ));
    }

    #[test]
    fn test_reconnect_replaces_state() {
        let registry = NodeRegistry::new();
        registry.add_node(node("alpha"));
        registry.connect(&node("alpha")).unwrap();
        registry.with_satellite_state_mut(
            &node("alpha"),
            |st| st.volume_mut(&rsc(), VolumeNumber::new(0).unwrap()).suspended = true,
            (),
        );
        assert_eq!(
            registry.with_satellite_state(&node("alpha"), |st| st.resources.len(), 0),
            1
        );

        registry.connect(&node("alpha")).unwrap();
        assert_eq!(
            registry.with_satellite_state(&node("alpha"), |st| st.resources.len(), 99),
            0
        );
    }

    #[test]
    fn test_disconnect_discards_state() {
        let registry = NodeRegistry::new();
        registry.add_node(node("alpha"));
        registry.connect(&node("alpha")).unwrap();
        assert_eq!(registry.connected_nodes(), vec![node("alpha")]);

        assert!(registry.disconnect(&node("alpha")));
        assert!(!registry.disconnect(&node("alpha")));
        assert!(registry.contains(&node("alpha")));
        assert!(registry.connected_nodes().is_empty());
    }

    #[test]
    fn test_other_nodes_not_blocked_by_node_lock() {
        let registry = Arc::new(NodeRegistry::new());
        for name in ["alpha", "beta"] {
            registry.add_node(node(name));
            registry.connect(&node(name)).unwrap();
        }

        let barrier = Arc::new(Barrier::new(2));
        let holder = {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                registry.with_satellite_state(
                    &node("alpha"),
                    |_| {
                        barrier.wait();
                        barrier.wait();
                    },
                    (),
                );
            })
        };

        barrier.wait();
        // alpha's lock is held; beta and registry lookups proceed.
        assert!(registry.is_connected(&node("alpha")));
        assert_eq!(registry.with_satellite_state(&node("beta"), |_| 7, 0), 7);
        barrier.wait();
        holder.join().unwrap();
    }
}
