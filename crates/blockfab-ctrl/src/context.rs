//! State shared by every controller component.

use std::sync::Arc;

use crate::event_broker::EventBroker;
use crate::node_registry::NodeRegistry;
use crate::persistence::SnapshotStore;
use crate::rsc_dfn::ResourceDefinitionRegistry;
use crate::transport::SatelliteNotifier;

/// Shared controller collaborators.
///
/// Lock order: a resource definition's mutex is taken before any node's
/// satellite-state mutex, never the other way round.
pub struct CtrlContext {
    /// Known nodes and their satellite state.
    pub nodes: Arc<NodeRegistry>,
    /// Resource definitions, each behind its own mutex.
    pub rsc_dfns: Arc<ResourceDefinitionRegistry>,
    /// Cluster event streams.
    pub broker: Arc<EventBroker>,
    /// Persistence for snapshot definitions.
    pub store: Arc<dyn SnapshotStore>,
    /// Outbound channel to satellites.
    pub notifier: Arc<dyn SatelliteNotifier>,
}

impl CtrlContext {
    /// Empty registries around the given collaborators.
    pub fn new(
        broker: Arc<EventBroker>,
        store: Arc<dyn SnapshotStore>,
        notifier: Arc<dyn SatelliteNotifier>,
    ) -> Self {
        Self {
            nodes: Arc::new(NodeRegistry::new()),
            rsc_dfns: Arc::new(ResourceDefinitionRegistry::new()),
            broker,
            store,
            notifier,
        }
    }
}
