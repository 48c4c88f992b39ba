//! Snapshot API: create, delete, satellite fetch, listing.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::CtrlContext;
use crate::error::{CtrlError, CtrlResult};
use crate::event_broker::{EventIdentifier, StreamPayload};
use crate::rsc_dfn::ResourceDefinition;
use crate::snapshot::{SnapshotDefinition, SnapshotDfnListItem};
use crate::transport::{InProgressSnapshot, InProgressSnapshotReply, SnapshotNotification};
use crate::types::{NodeName, ResourceName, SnapshotName};

/// Snapshot operations exposed to clients and satellites.
///
/// Every call holds the resource definition's lock for its whole duration.
pub struct SnapshotApi {
    ctx: Arc<CtrlContext>,
}

impl SnapshotApi {
    /// Operations over the registries in `ctx`.
    pub fn new(ctx: Arc<CtrlContext>) -> Self {
        Self { ctx }
    }

    /// Creates a snapshot of `resource` on `node_names`, or on every diskful
    /// resource when `node_names` is empty, and starts coordinating it.
    ///
    /// Returns the UUID of the new snapshot definition.
    pub fn create_snapshot(
        &self,
        node_names: &[&str],
        resource: &str,
        snapshot: &str,
    ) -> CtrlResult<Uuid> {
        let resource = ResourceName::new(resource)?;
        let snapshot = SnapshotName::new(snapshot)?;
        let nodes = node_names
            .iter()
            .map(|name| NodeName::new(*name))
            .collect::<CtrlResult<Vec<_>>>()?;

        let rsc_dfn = self.ctx.rsc_dfns.require(&resource)?;
        let mut rsc_dfn = rsc_dfn.lock();

        if rsc_dfn.snapshot_dfn(&snapshot).is_some() {
            return Err(CtrlError::AlreadyExists {
                kind: "snapshot definition",
                name: format!("{}/{}", resource, snapshot),
            });
        }
        if let Some(in_progress) = rsc_dfn.in_progress_snapshot() {
            return Err(CtrlError::SnapshotInProgress {
                resource: resource.to_string(),
                snapshot: in_progress.name.to_string(),
            });
        }

        let targets = self.select_targets(&rsc_dfn, &nodes)?;

        let mut dfn = SnapshotDefinition::new(
            resource.clone(),
            snapshot.clone(),
            rsc_dfn.next_sequence_number(),
        );
        dfn.in_progress = true;
        for node in targets {
            dfn.add_snapshot(node)?;
        }
        self.ctx.store.persist_definition(&dfn)?;

        let uuid = dfn.uuid;
        let notification = SnapshotNotification::for_definition(&dfn);
        let participants = dfn.nodes();
        let sequence_number = dfn.sequence_number;
        rsc_dfn.add_snapshot_dfn(dfn)?;
        for node in &participants {
            self.ctx.nodes.with_satellite_state_mut(
                node,
                |state| state.clear_snapshot_taken(&resource),
                (),
            );
        }
        self.ctx
            .broker
            .open_stream(EventIdentifier::snapshot_deployment(&resource, &snapshot));
        drop(rsc_dfn);

        info!(
            resource = %resource,
            snapshot = %snapshot,
            sequence_number,
            nodes = participants.len(),
            "snapshot created"
        );
        for node in &participants {
            self.ctx.notifier.notify_snapshot(node, &notification);
        }
        Ok(uuid)
    }

    fn select_targets(
        &self,
        rsc_dfn: &ResourceDefinition,
        nodes: &[NodeName],
    ) -> CtrlResult<Vec<NodeName>> {
        let targets: Vec<NodeName> = if nodes.is_empty() {
            rsc_dfn
                .resources()
                .filter(|rsc| !rsc.diskless)
                .map(|rsc| rsc.node.clone())
                .collect()
        } else {
            let mut targets = Vec::with_capacity(nodes.len());
            for node in nodes {
                let rsc = rsc_dfn.resource(node).ok_or_else(|| CtrlError::NotFound {
                    kind: "resource",
                    name: format!("{}@{}", rsc_dfn.name, node),
                })?;
                if rsc.diskless {
                    return Err(CtrlError::DisklessResource {
                        node: node.to_string(),
                        resource: rsc_dfn.name.to_string(),
                    });
                }
                if !targets.contains(node) {
                    targets.push(node.clone());
                }
            }
            targets
        };

        if let Some(node) = targets.iter().find(|node| !self.ctx.nodes.is_connected(node)) {
            return Err(CtrlError::NodeNotConnected {
                node: node.to_string(),
            });
        }
        if targets.is_empty() {
            return Err(CtrlError::NoResources {
                resource: rsc_dfn.name.to_string(),
            });
        }
        Ok(targets)
    }

    /// Deletes a snapshot definition. Definitions with per-node snapshots are
    /// only flagged; the coordination pass removes them as nodes confirm.
    ///
    /// Returns the UUID of the deleted definition.
    pub fn delete_snapshot(&self, resource: &str, snapshot: &str) -> CtrlResult<Uuid> {
        let resource = ResourceName::new(resource)?;
        let snapshot = SnapshotName::new(snapshot)?;

        let rsc_dfn = self.ctx.rsc_dfns.require(&resource)?;
        let mut rsc_dfn = rsc_dfn.lock();
        let dfn = rsc_dfn
            .snapshot_dfn(&snapshot)
            .ok_or_else(|| CtrlError::NotFound {
                kind: "snapshot definition",
                name: format!("{}/{}", resource, snapshot),
            })?;
        let uuid = dfn.uuid;
        let stream = EventIdentifier::snapshot_deployment(&resource, &snapshot);
        let abort = || {
            StreamPayload::Aborted(format!(
                "Snapshot '{}' of resource '{}' was deleted",
                snapshot, resource
            ))
        };

        if !dfn.has_snapshots() {
            self.ctx.store.delete_definition(&resource, &snapshot)?;
            rsc_dfn.remove_snapshot_dfn(&snapshot);
            self.ctx.broker.close_stream(&stream, abort());
            info!(resource = %resource, snapshot = %snapshot, "snapshot definition deleted");
            return Ok(uuid);
        }

        let mut next = dfn.clone();
        next.mark_deleted();
        self.ctx.store.persist_definition(&next)?;
        let notification = SnapshotNotification::for_definition(&next);
        let participants = next.nodes();
        if let Some(dfn) = rsc_dfn.snapshot_dfn_mut(&snapshot) {
            *dfn = next;
        }
        for node in &participants {
            self.ctx.nodes.with_satellite_state_mut(
                node,
                |state| state.clear_snapshot_deleted(&resource),
                (),
            );
        }
        self.ctx.broker.close_stream(&stream, abort());
        drop(rsc_dfn);

        info!(resource = %resource, snapshot = %snapshot, nodes = participants.len(), "snapshot marked for deletion");
        for node in &participants {
            self.ctx.notifier.notify_snapshot(node, &notification);
        }
        Ok(uuid)
    }

    /// Answers a satellite asking for its part of a snapshot.
    pub fn respond_snapshot(
        &self,
        node: &NodeName,
        resource: &str,
        snapshot: &str,
    ) -> CtrlResult<InProgressSnapshotReply> {
        let ended = || InProgressSnapshotReply::Ended {
            resource: resource.to_string(),
            snapshot_name: snapshot.to_string(),
        };
        let resource_name = ResourceName::new(resource).map_err(|err| {
            CtrlError::Implementation(format!("satellite requested data for invalid name: {}", err))
        })?;
        let snapshot_name = SnapshotName::new(snapshot).map_err(|err| {
            CtrlError::Implementation(format!("satellite requested data for invalid name: {}", err))
        })?;

        let rsc_dfn = match self.ctx.rsc_dfns.get(&resource_name) {
            Some(rsc_dfn) => rsc_dfn,
            None => return Ok(ended()),
        };
        let rsc_dfn = rsc_dfn.lock();
        let reply = rsc_dfn
            .snapshot_dfn(&snapshot_name)
            .filter(|dfn| dfn.in_progress || dfn.is_deleting())
            .and_then(|dfn| {
                dfn.snapshot(node)
                    .map(|snap| InProgressSnapshotReply::Data(InProgressSnapshot::new(dfn, snap)))
            })
            .unwrap_or_else(ended);
        debug!(node = %node, resource, snapshot, ?reply, "in-progress snapshot requested");
        Ok(reply)
    }

    /// Lists every snapshot definition, ordered by resource and name.
    pub fn list_snapshot_definitions(&self) -> Vec<SnapshotDfnListItem> {
        let mut items = Vec::new();
        for name in self.ctx.rsc_dfns.names() {
            if let Some(rsc_dfn) = self.ctx.rsc_dfns.get(&name) {
                let rsc_dfn = rsc_dfn.lock();
                items.extend(rsc_dfn.snapshot_dfns().map(SnapshotDefinition::list_item));
            }
        }
        items
    }

    /// The successful snapshot with the highest sequence number.
    pub fn latest_successful_snapshot(&self, resource: &str) -> CtrlResult<Option<SnapshotDfnListItem>> {
        let resource = ResourceName::new(resource)?;
        let rsc_dfn = self.ctx.rsc_dfns.require(&resource)?;
        let rsc_dfn = rsc_dfn.lock();
        Ok(rsc_dfn
            .snapshot_dfns()
            .filter(|dfn| dfn.is_successful() && !dfn.is_deleting())
            .max_by_key(|dfn| dfn.sequence_number)
            .map(SnapshotDefinition::list_item))
    }
}
