//! Drives in-progress snapshot definitions through
//! suspend → snapshot → resume using only what the satellites report.
//!
//! A pass is level-triggered: it recomputes the aggregate over every
//! participating node each time it runs, so running it redundantly or after a
//! missed report is harmless. All passes for one resource are serialized by
//! the resource definition's mutex, which is held for the whole pass.
//! Outbound notifications are collected during the pass and sent after the
//! lock is released.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::context::CtrlContext;
use crate::event_broker::{EventIdentifier, StreamPayload};
use crate::rsc_dfn::ResourceDefinition;
use crate::satellite_state::SatelliteResourceState;
use crate::snapshot::{SnapshotDefinition, SnapshotDfnFlags, SnapshotPhase};
use crate::transport::SnapshotNotification;
use crate::types::{NodeName, ResourceName, SnapshotName};

/// An externally detected reason to abandon in-progress snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Abort {
    /// The satellite lost its connection.
    Disconnect {
        /// Node that disconnected.
        node: NodeName,
    },
    /// The satellite failed to apply the snapshot.
    Deployment {
        /// Node that reported the failure.
        node: NodeName,
        /// Snapshot the node failed to apply.
        snapshot: SnapshotName,
        /// Failure text, passed on to the deployment stream.
        message: String,
    },
}

impl Abort {
    fn applies_to(&self, dfn: &SnapshotDefinition) -> bool {
        match self {
            Abort::Disconnect { node } => dfn.snapshot(node).is_some(),
            Abort::Deployment { node, snapshot, .. } => {
                &dfn.name == snapshot && dfn.snapshot(node).is_some()
            }
        }
    }

    fn flag(&self) -> SnapshotDfnFlags {
        match self {
            Abort::Disconnect { .. } => SnapshotDfnFlags::FAILED_DISCONNECT,
            Abort::Deployment { .. } => SnapshotDfnFlags::FAILED_DEPLOYMENT,
        }
    }

    fn message(&self, dfn: &SnapshotDefinition) -> String {
        match self {
            Abort::Disconnect { node } => format!(
                "Snapshot '{}' of resource '{}' failed: satellite '{}' disconnected",
                dfn.name, dfn.resource, node
            ),
            Abort::Deployment { message, .. } => message.clone(),
        }
    }
}

/// What one pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Number of satellite notifications sent.
    pub notifications: usize,
    /// Definitions that reached SUCCESSFUL.
    pub completed: Vec<SnapshotName>,
    /// Definitions that reached FAILED_DEPLOYMENT or FAILED_DISCONNECT.
    pub failed: Vec<SnapshotName>,
    /// Definitions removed after every node deleted its snapshot.
    pub deleted: Vec<SnapshotName>,
}

impl PassOutcome {
    /// Adds the results of another pass.
    pub fn merge(&mut self, other: PassOutcome) {
        self.notifications += other.notifications;
        self.completed.extend(other.completed);
        self.failed.extend(other.failed);
        self.deleted.extend(other.deleted);
    }
}

/// One node's self-report, condensed.
#[derive(Copy, Clone, Debug, Default)]
struct NodeReport {
    received: bool,
    suspended_all: bool,
    suspended_any: bool,
    taken_all: bool,
    deleted_all: bool,
}

impl NodeReport {
    fn from_resource(state: &SatelliteResourceState) -> Self {
        Self {
            received: !state.volumes.is_empty(),
            suspended_all: state.all_volumes(|v| v.suspended),
            suspended_any: state.any_volume(|v| v.suspended),
            taken_all: state.all_volumes(|v| v.snapshot_taken),
            deleted_all: state.all_volumes(|v| v.snapshot_deleted),
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Aggregate {
    all_received: bool,
    all_suspended: bool,
    none_suspended: bool,
    all_taken: bool,
    all_suspend_set: bool,
    all_take_set: bool,
}

enum Step {
    /// Commands changed; the aggregate may allow another step.
    Commanded,
    /// The definition reached SUCCESSFUL.
    Completed,
    /// Waiting for more reports.
    Wait,
}

/// Applies at most one transition for the given aggregate.
fn advance(dfn: &mut SnapshotDefinition, agg: Aggregate) -> Step {
    if agg.all_take_set {
        if agg.none_suspended {
            dfn.mark_terminal(SnapshotDfnFlags::SUCCESSFUL);
            Step::Completed
        } else if agg.all_taken && agg.all_suspend_set {
            dfn.set_phase(SnapshotPhase::SnapshotTaken);
            for snapshot in dfn.snapshots_mut() {
                snapshot.suspend_resource = false;
            }
            dfn.set_phase(SnapshotPhase::Resuming);
            Step::Commanded
        } else {
            Step::Wait
        }
    } else if !agg.all_suspend_set {
        // take is only ever commanded together with suspend
        for snapshot in dfn.snapshots_mut() {
            snapshot.suspend_resource = true;
        }
        dfn.set_phase(SnapshotPhase::Suspending);
        Step::Commanded
    } else if agg.all_suspended {
        dfn.set_phase(SnapshotPhase::Suspended);
        for snapshot in dfn.snapshots_mut() {
            snapshot.take_snapshot = true;
        }
        dfn.set_phase(SnapshotPhase::SnapshotRequested);
        Step::Commanded
    } else {
        Step::Wait
    }
}

/// Drives in-progress snapshot definitions through the coordination
/// protocol, one resource at a time.
pub struct SnapshotStateMachine {
    ctx: Arc<CtrlContext>,
}

impl SnapshotStateMachine {
    /// A state machine over the registries in `ctx`.
    pub fn new(ctx: Arc<CtrlContext>) -> Self {
        Self { ctx }
    }

    /// Runs one coordination pass over every snapshot definition of `resource`.
    pub fn run(&self, resource: &ResourceName, abort: Option<&Abort>) -> PassOutcome {
        let mut outcome = PassOutcome::default();
        let rsc_dfn = match self.ctx.rsc_dfns.get(resource) {
            Some(rsc_dfn) => rsc_dfn,
            None => {
                debug!(resource = %resource, "coordination pass for unknown resource");
                return outcome;
            }
        };

        let mut outbound = Vec::new();
        {
            let mut rsc_dfn = rsc_dfn.lock();
            for name in rsc_dfn.snapshot_names() {
                self.drive(&mut rsc_dfn, &name, abort, &mut outbound, &mut outcome);
            }
        }

        for (node, notification) in &outbound {
            self.ctx.notifier.notify_snapshot(node, notification);
        }
        outcome.notifications = outbound.len();
        outcome
    }

    fn drive(
        &self,
        rsc_dfn: &mut ResourceDefinition,
        name: &SnapshotName,
        abort: Option<&Abort>,
        outbound: &mut Vec<(NodeName, SnapshotNotification)>,
        outcome: &mut PassOutcome,
    ) {
        let resource = rsc_dfn.name.clone();
        let dfn = match rsc_dfn.snapshot_dfn_mut(name) {
            Some(dfn) => dfn,
            None => return,
        };

        if self.complete_deletions(dfn) {
            match self.ctx.store.delete_definition(&resource, name) {
                Ok(()) => {
                    rsc_dfn.remove_snapshot_dfn(name);
                    info!(resource = %resource, snapshot = %name, "snapshot definition deleted");
                    outcome.deleted.push(name.clone());
                }
                Err(err) => {
                    error!(resource = %resource, snapshot = %name, error = %err, "failed to delete snapshot definition");
                }
            }
            return;
        }

        if dfn.is_deleting() {
            let closed = self.ctx.broker.close_stream(
                &EventIdentifier::snapshot_deployment(&resource, name),
                StreamPayload::Aborted(format!(
                    "Snapshot '{}' of resource '{}' is being deleted",
                    name, resource
                )),
            );
            if closed {
                debug!(resource = %resource, snapshot = %name, "deployment stream closed for deleted snapshot");
            }
            return;
        }

        if !dfn.in_progress || !dfn.has_snapshots() {
            return;
        }

        if let Some(abort) = abort.filter(|abort| abort.applies_to(dfn)) {
            let message = abort.message(dfn);
            self.fail(dfn, abort.flag(), message);
            outcome.failed.push(name.clone());
            return;
        }

        let mut next = dfn.clone();
        let mut commands_changed = false;
        let mut take_commanded = false;
        loop {
            let mut agg = self.aggregate(&next);
            if !agg.all_received {
                break;
            }
            if take_commanded {
                // taken reports predate the command
                agg.all_taken = false;
            }
            let take_before = agg.all_take_set;
            match advance(&mut next, agg) {
                Step::Commanded => {
                    commands_changed = true;
                    take_commanded |= !take_before && next.snapshots().all(|s| s.take_snapshot);
                }
                Step::Completed | Step::Wait => break,
            }
        }
        if next == *dfn {
            return;
        }

        if let Err(err) = self.ctx.store.persist_definition(&next) {
            warn!(resource = %resource, snapshot = %name, error = %err, "persisting snapshot state failed");
            self.fail(dfn, SnapshotDfnFlags::FAILED_DEPLOYMENT, err.to_string());
            outcome.failed.push(name.clone());
            return;
        }
        *dfn = next;

        if take_commanded {
            for node in dfn.nodes() {
                self.ctx.nodes.with_satellite_state_mut(
                    &node,
                    |state| state.clear_snapshot_taken(&resource),
                    (),
                );
            }
        }

        if dfn.is_successful() {
            info!(resource = %resource, snapshot = %name, "snapshot successfully taken");
            self.ctx.broker.close_stream(
                &EventIdentifier::snapshot_deployment(&resource, name),
                StreamPayload::Success(format!(
                    "Snapshot '{}' of resource '{}' successfully taken.",
                    name, resource
                )),
            );
            outcome.completed.push(name.clone());
        }

        if commands_changed {
            let notification = SnapshotNotification::for_definition(dfn);
            for node in dfn.nodes() {
                outbound.push((node, notification.clone()));
            }
        }
    }

    /// Removes per-node snapshots whose deletion the node confirmed. Returns
    /// true if the definition itself is flagged DELETE and now empty.
    fn complete_deletions(&self, dfn: &mut SnapshotDefinition) -> bool {
        let confirmed: Vec<NodeName> = dfn
            .snapshots()
            .filter(|snapshot| snapshot.delete)
            .filter(|snapshot| self.node_report(&snapshot.node, &dfn.resource).deleted_all)
            .map(|snapshot| snapshot.node.clone())
            .collect();

        for node in confirmed {
            match self.ctx.store.delete_snapshot(&dfn.resource, &dfn.name, &node) {
                Ok(()) => {
                    dfn.remove_snapshot(&node);
                    debug!(resource = %dfn.resource, snapshot = %dfn.name, node = %node, "snapshot deleted on node");
                }
                Err(err) => {
                    error!(resource = %dfn.resource, snapshot = %dfn.name, node = %node, error = %err, "failed to delete snapshot");
                }
            }
        }
        dfn.is_deleting() && !dfn.has_snapshots()
    }

    fn fail(&self, dfn: &mut SnapshotDefinition, flag: SnapshotDfnFlags, message: String) {
        dfn.mark_terminal(flag);
        if let Err(err) = self.ctx.store.persist_definition(dfn) {
            error!(resource = %dfn.resource, snapshot = %dfn.name, error = %err, "failed to persist aborted snapshot");
        }
        info!(resource = %dfn.resource, snapshot = %dfn.name, phase = %dfn.phase, %message, "snapshot aborted");
        self.ctx.broker.close_stream(
            &EventIdentifier::snapshot_deployment(&dfn.resource, &dfn.name),
            StreamPayload::Aborted(message),
        );
    }

    fn node_report(&self, node: &NodeName, resource: &ResourceName) -> NodeReport {
        self.ctx.nodes.with_satellite_state(
            node,
            |state| {
                state
                    .from_resource(resource, NodeReport::from_resource)
                    .unwrap_or_default()
            },
            NodeReport::default(),
        )
    }

    fn aggregate(&self, dfn: &SnapshotDefinition) -> Aggregate {
        let mut agg = Aggregate {
            all_received: true,
            all_suspended: true,
            none_suspended: true,
            all_taken: true,
            all_suspend_set: true,
            all_take_set: true,
        };
        for snapshot in dfn.snapshots() {
            let report = self.node_report(&snapshot.node, &dfn.resource);
            agg.all_received &= report.received;
            agg.all_suspended &= report.suspended_all;
            agg.none_suspended &= !report.suspended_any;
            agg.all_taken &= report.taken_all;
            agg.all_suspend_set &= snapshot.suspend_resource;
            agg.all_take_set &= snapshot.take_snapshot;
        }
        agg
    }
}
