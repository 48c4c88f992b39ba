//! Common fixtures for controller integration tests.

#![allow(dead_code)]

use blockfab_ctrl::{
    Controller, CtrlContext, EventBroker, MemoryStore, NodeName, Resource, ResourceDefinition,
    ResourceName, ResourceReport, SatelliteNotifier, SnapshotDefinition, SnapshotName,
    SnapshotNotification, VolumeReport,
};
use blockfab_drbd::VolumeNumber;
use parking_lot::Mutex;
use std::sync::Arc;

pub const RESOURCE: &str = "data";
pub const SNAPSHOT: &str = "nightly";

/// Notifier that remembers every notification it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NodeName, SnapshotNotification)>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn nodes(&self) -> Vec<NodeName> {
        self.sent.lock().iter().map(|(node, _)| node.clone()).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl SatelliteNotifier for RecordingNotifier {
    fn notify_snapshot(&self, node: &NodeName, notification: &SnapshotNotification) {
        self.sent.lock().push((node.clone(), notification.clone()));
    }
}

/// A controller with one resource definition deployed on `n` connected nodes.
pub struct Cluster {
    pub controller: Controller,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub nodes: Vec<NodeName>,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = Arc::new(CtrlContext::new(
            Arc::new(EventBroker::new(64)),
            store.clone(),
            notifier.clone(),
        ));

        let nodes: Vec<NodeName> = (0..n)
            .map(|i| NodeName::new(format!("node-{}", i)).unwrap())
            .collect();
        let mut rsc_dfn = ResourceDefinition::new(resource(), [volume()]);
        for node in &nodes {
            ctx.nodes.add_node(node.clone());
            rsc_dfn.add_resource(Resource::new(node.clone(), false)).unwrap();
        }
        ctx.rsc_dfns.insert(rsc_dfn).unwrap();

        let controller = Controller::new(ctx);
        for node in &nodes {
            controller.node_connected(node).unwrap();
        }
        Self {
            controller,
            store,
            notifier,
            nodes,
        }
    }

    pub fn ctx(&self) -> &Arc<CtrlContext> {
        self.controller.context()
    }

    /// Every node reports the same snapshot-related volume state.
    pub fn report_all(&self, suspended: bool, taken: bool) -> usize {
        let mut notifications = 0;
        for node in &self.nodes {
            let outcome = self
                .controller
                .state_report(node, &[snapshot_report(suspended, taken)])
                .unwrap();
            notifications += outcome.notifications;
        }
        notifications
    }

    pub fn with_snapshot<T>(&self, f: impl FnOnce(&SnapshotDefinition) -> T) -> T {
        self.with_named_snapshot(SNAPSHOT, f)
    }

    pub fn with_named_snapshot<T>(&self, name: &str, f: impl FnOnce(&SnapshotDefinition) -> T) -> T {
        let rsc_dfn = self.ctx().rsc_dfns.get(&resource()).unwrap();
        let guard = rsc_dfn.lock();
        f(guard.snapshot_dfn(&SnapshotName::new(name).unwrap()).unwrap())
    }

    /// Commands of the named snapshot as (suspend_resource, take_snapshot),
    /// if every node carries the same pair.
    pub fn commands(&self, name: &str) -> Option<(bool, bool)> {
        self.with_named_snapshot(name, |dfn| {
            let pairs: Vec<(bool, bool)> = dfn
                .snapshots()
                .map(|s| (s.suspend_resource, s.take_snapshot))
                .collect();
            pairs
                .first()
                .copied()
                .filter(|first| pairs.iter().all(|pair| pair == first))
        })
    }

    /// Nodes send `report` in `order`. Returns the commands seen after every
    /// pass that notified the nodes.
    pub fn report_in_order(&self, name: &str, order: &[usize], report: &ResourceReport) -> Vec<Option<(bool, bool)>> {
        let mut seen = Vec::new();
        for &idx in order {
            let outcome = self.controller.state_report(&self.nodes[idx], &[report.clone()]).unwrap();
            if outcome.notifications > 0 {
                seen.push(self.commands(name));
            }
        }
        seen
    }

    /// Creates the named snapshot and walks it to SUCCESSFUL the way
    /// satellites do: each node reports only what changed. Returns the
    /// commands the nodes were notified of, in order.
    pub fn run_snapshot(&self, name: &str, order: &[usize]) -> Vec<Option<(bool, bool)>> {
        self.controller.snapshots().create_snapshot(&[], RESOURCE, name).unwrap();
        let mut seen = vec![self.commands(name)];
        seen.extend(self.report_in_order(name, order, &progress_report(Some(false), None)));
        seen.extend(self.report_in_order(name, order, &progress_report(Some(true), None)));
        seen.extend(self.report_in_order(name, order, &progress_report(None, Some(true))));
        seen.extend(self.report_in_order(name, order, &progress_report(Some(false), None)));
        seen
    }

    /// Deletes the named snapshot and has the nodes confirm in `order`.
    /// Returns, per confirmation, whether the definition still existed
    /// after it.
    pub fn delete_snapshot(&self, name: &str, order: &[usize]) -> Vec<bool> {
        self.controller.snapshots().delete_snapshot(RESOURCE, name).unwrap();
        let mut report = progress_report(None, None);
        report.volumes[0].snapshot_deleted = Some(true);
        order
            .iter()
            .map(|&idx| {
                self.controller.state_report(&self.nodes[idx], &[report.clone()]).unwrap();
                self.exists(name)
            })
            .collect()
    }

    pub fn exists(&self, name: &str) -> bool {
        let rsc_dfn = self.ctx().rsc_dfns.get(&resource()).unwrap();
        let exists = rsc_dfn.lock().snapshot_dfn(&SnapshotName::new(name).unwrap()).is_some();
        exists
    }
}

/// The commands a successful snapshot goes through: created, suspend,
/// take while suspended, resume.
pub const PROTOCOL: [Option<(bool, bool)>; 4] = [
    Some((false, false)),
    Some((true, false)),
    Some((true, true)),
    Some((false, true)),
];

pub fn resource() -> ResourceName {
    ResourceName::new(RESOURCE).unwrap()
}

pub fn snapshot() -> SnapshotName {
    SnapshotName::new(SNAPSHOT).unwrap()
}

pub fn volume() -> VolumeNumber {
    VolumeNumber::new(0).unwrap()
}

pub fn snapshot_report(suspended: bool, taken: bool) -> ResourceReport {
    let mut vlm = VolumeReport::new(volume());
    vlm.suspended = Some(suspended);
    vlm.snapshot_taken = Some(taken);
    ResourceReport {
        resource: resource(),
        in_use: None,
        volumes: vec![vlm],
    }
}

pub fn progress_report(suspended: Option<bool>, taken: Option<bool>) -> ResourceReport {
    let mut vlm = VolumeReport::new(volume());
    vlm.suspended = suspended;
    vlm.snapshot_taken = taken;
    ResourceReport {
        resource: resource(),
        in_use: None,
        volumes: vec![vlm],
    }
}

pub fn disk_report(disk_state: &str) -> ResourceReport {
    let mut vlm = VolumeReport::new(volume());
    vlm.disk_state = Some(disk_state.to_string());
    ResourceReport {
        resource: resource(),
        in_use: None,
        volumes: vec![vlm],
    }
}
