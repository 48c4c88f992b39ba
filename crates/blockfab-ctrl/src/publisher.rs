//! Publishes local DRBD state changes as cluster event streams.
//!
//! Only objects the cluster already knows about are published; resources DRBD
//! reports that have no resource definition are ignored.

use blockfab_drbd::{
    DrbdStateTracker, EventMask, StateChange, StateObserver, VolumeNumber,
};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::event_broker::{EventBroker, EventIdentifier, EventName, StreamPayload};
use crate::rsc_dfn::ResourceDefinitionRegistry;
use crate::types::{NodeName, ResourceName};

/// Decides which locally tracked objects are visible to the cluster.
pub trait ClusterView: Send + Sync {
    fn knows_resource(&self, node: &NodeName, resource: &ResourceName) -> bool;
    fn knows_volume(&self, node: &NodeName, resource: &ResourceName, volume: VolumeNumber) -> bool;
}

impl ClusterView for ResourceDefinitionRegistry {
    fn knows_resource(&self, node: &NodeName, resource: &ResourceName) -> bool {
        self.get(resource)
            .map_or(false, |dfn| dfn.lock().resource(node).is_some())
    }

    fn knows_volume(&self, node: &NodeName, resource: &ResourceName, volume: VolumeNumber) -> bool {
        self.get(resource).map_or(false, |dfn| {
            let dfn = dfn.lock();
            dfn.resource(node).is_some() && dfn.volumes.contains(&volume)
        })
    }
}

/// Treats every locally tracked object as known. For running a node without
/// a controller.
pub struct LocalView;

impl ClusterView for LocalView {
    fn knows_resource(&self, _node: &NodeName, _resource: &ResourceName) -> bool {
        true
    }

    fn knows_volume(&self, _node: &NodeName, _resource: &ResourceName, _volume: VolumeNumber) -> bool {
        true
    }
}

/// Turns local DRBD state changes into cluster event streams.
///
/// Streams are only opened for objects the [`ClusterView`] knows about.
pub struct StatePublisher {
    node: NodeName,
    broker: Arc<EventBroker>,
    cluster: Arc<dyn ClusterView>,
    tracker: Weak<DrbdStateTracker>,
}

impl StatePublisher {
    /// Changes the publisher reacts to.
    pub fn mask() -> EventMask {
        EventMask::RES_CREATED
            | EventMask::RES_DESTROYED
            | EventMask::ROLE
            | EventMask::VOL_CREATED
            | EventMask::VOL_DESTROYED
            | EventMask::DISK
            | EventMask::REPL
    }

    /// Creates a publisher and registers it with `tracker`.
    pub fn register(
        node: NodeName,
        broker: Arc<EventBroker>,
        cluster: Arc<dyn ClusterView>,
        tracker: &Arc<DrbdStateTracker>,
    ) -> Arc<StatePublisher> {
        let publisher = Arc::new(StatePublisher {
            node,
            broker,
            cluster,
            tracker: Arc::downgrade(tracker),
        });
        tracker.add_observer(publisher.clone(), Self::mask());
        publisher
    }

    fn known_resource(&self, name: &str) -> Option<ResourceName> {
        ResourceName::new(name)
            .ok()
            .filter(|rsc| self.cluster.knows_resource(&self.node, rsc))
    }

    fn known_volume(&self, name: &str, volume: VolumeNumber) -> Option<ResourceName> {
        ResourceName::new(name)
            .ok()
            .filter(|rsc| self.cluster.knows_volume(&self.node, rsc, volume))
    }

    fn trigger_resource(&self, name: &str) {
        if let Some(rsc) = self.known_resource(name) {
            self.broker
                .trigger(&EventIdentifier::resource_state(&self.node, &rsc));
        }
    }
}

impl StateObserver for StatePublisher {
    fn state_changed(&self, change: &StateChange) {
        match change {
            StateChange::ResourceCreated { resource } => {
                if let Some(rsc) = self.known_resource(resource) {
                    self.broker
                        .open_stream(EventIdentifier::resource_state(&self.node, &rsc));
                }
            }
            StateChange::ResourceDestroyed { resource } => {
                if let Ok(rsc) = ResourceName::new(resource.as_str()) {
                    self.broker.close_stream(
                        &EventIdentifier::resource_state(&self.node, &rsc),
                        StreamPayload::Plain,
                    );
                    self.broker.close_all_streams(
                        &EventIdentifier::partial(EventName::VolumeDiskState)
                            .with_node(&self.node)
                            .with_resource(&rsc),
                    );
                }
            }
            StateChange::VolumeCreated {
                resource,
                peer: None,
                volume,
            } => {
                if let Some(rsc) = self.known_volume(resource, *volume) {
                    self.broker.open_stream(EventIdentifier::volume_disk_state(
                        &self.node, &rsc, *volume,
                    ));
                }
            }
            StateChange::VolumeDestroyed {
                resource,
                peer: None,
                volume,
            } => {
                if let Ok(rsc) = ResourceName::new(resource.as_str()) {
                    self.broker.close_stream(
                        &EventIdentifier::volume_disk_state(&self.node, &rsc, *volume),
                        StreamPayload::Plain,
                    );
                }
            }
            StateChange::RoleChanged { resource, .. }
            | StateChange::ReplicationStateChanged { resource, .. } => {
                self.trigger_resource(resource);
            }
            StateChange::DiskStateChanged {
                resource,
                peer,
                volume,
                ..
            } => {
                self.trigger_resource(resource);
                if peer.is_none() {
                    if let Some(rsc) = self.known_volume(resource, *volume) {
                        self.broker.trigger(&EventIdentifier::volume_disk_state(
                            &self.node, &rsc, *volume,
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    fn state_available(&self) {
        let tracker = match self.tracker.upgrade() {
            Some(tracker) => tracker,
            None => return,
        };
        let resources = match tracker.all_resources() {
            Ok(resources) => resources,
            Err(err) => {
                warn!(error = %err, "DRBD state reported available but not readable");
                return;
            }
        };
        let mut opened = 0;
        for resource in &resources {
            if let Some(rsc) = self.known_resource(&resource.name) {
                opened += usize::from(
                    self.broker
                        .open_stream(EventIdentifier::resource_state(&self.node, &rsc)),
                );
                for volume in resource.volumes.keys() {
                    if self.cluster.knows_volume(&self.node, &rsc, *volume) {
                        opened += usize::from(self.broker.open_stream(
                            EventIdentifier::volume_disk_state(&self.node, &rsc, *volume),
                        ));
                    }
                }
            }
        }
        debug!(node = %self.node, opened, "DRBD state available, streams opened");
    }

    fn state_unavailable(&self) {
        let closed = self
            .broker
            .close_all_streams(&EventIdentifier::partial(EventName::VolumeDiskState));
        debug!(node = %self.node, closed, "DRBD state unavailable, volume disk state streams closed");
    }
}
