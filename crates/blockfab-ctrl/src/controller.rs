//! Inbound handling: satellite connects, disconnects, state reports and
//! deployment failures.

use blockfab_drbd::VolumeNumber;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::context::CtrlContext;
use crate::error::CtrlResult;
use crate::satellite_state::SatelliteState;
use crate::snapshot_api::SnapshotApi;
use crate::snapshot_state_machine::{Abort, PassOutcome, SnapshotStateMachine};
use crate::state_sequence::StateSequenceDetector;
use crate::types::{NodeName, ResourceName, SnapshotName};

/// State of one volume as reported by a satellite. Unset fields keep their
/// previously reported value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReport {
    /// Volume the report is about.
    pub volume: VolumeNumber,
    /// Local disk state as printed by DRBD, e.g. `UpToDate`.
    pub disk_state: Option<String>,
    /// I/O on the volume is suspended.
    pub suspended: Option<bool>,
    /// The commanded snapshot exists on the node.
    pub snapshot_taken: Option<bool>,
    /// The node removed its snapshot.
    pub snapshot_deleted: Option<bool>,
}

impl VolumeReport {
    /// A report that changes nothing.
    pub fn new(volume: VolumeNumber) -> Self {
        Self {
            volume,
            disk_state: None,
            suspended: None,
            snapshot_taken: None,
            snapshot_deleted: None,
        }
    }
}

/// State of one resource as reported by a satellite.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    /// Resource the report is about.
    pub resource: ResourceName,
    /// The resource is primary on the node.
    pub in_use: Option<bool>,
    /// Per-volume state; volumes not listed are left as they were.
    pub volumes: Vec<VolumeReport>,
}

fn record(state: &mut SatelliteState, report: &ResourceReport) {
    if let Some(in_use) = report.in_use {
        state.set_in_use(&report.resource, in_use);
    }
    for vlm in &report.volumes {
        let volume = state.volume_mut(&report.resource, vlm.volume);
        if let Some(disk_state) = &vlm.disk_state {
            volume.disk_state = Some(disk_state.clone());
        }
        if let Some(suspended) = vlm.suspended {
            volume.suspended = suspended;
        }
        if let Some(taken) = vlm.snapshot_taken {
            volume.snapshot_taken = taken;
        }
        if let Some(deleted) = vlm.snapshot_deleted {
            volume.snapshot_deleted = deleted;
        }
    }
}

/// Entry point for everything satellites send to the controller.
///
/// Each inbound call records what it learned and then runs the snapshot
/// coordination pass for the resources it touched.
pub struct Controller {
    ctx: Arc<CtrlContext>,
    snapshots: SnapshotApi,
    machine: SnapshotStateMachine,
    detector: StateSequenceDetector,
}

impl Controller {
    /// A controller over `ctx`. Nothing is connected yet.
    pub fn new(ctx: Arc<CtrlContext>) -> Self {
        Self {
            snapshots: SnapshotApi::new(Arc::clone(&ctx)),
            machine: SnapshotStateMachine::new(Arc::clone(&ctx)),
            detector: StateSequenceDetector::new(Arc::clone(&ctx.rsc_dfns)),
            ctx,
        }
    }

    /// Shared state, for callers that need the registries directly.
    pub fn context(&self) -> &Arc<CtrlContext> {
        &self.ctx
    }

    /// Snapshot operations sharing this controller's context.
    pub fn snapshots(&self) -> &SnapshotApi {
        &self.snapshots
    }

    /// A satellite connected. Any previously cached state is discarded.
    pub fn node_connected(&self, node: &NodeName) -> CtrlResult<()> {
        self.ctx.nodes.connect(node)?;
        Ok(())
    }

    /// A satellite disconnected. Every in-progress snapshot it takes part in
    /// fails with FAILED_DISCONNECT.
    pub fn node_disconnected(&self, node: &NodeName) -> PassOutcome {
        let mut outcome = PassOutcome::default();
        if !self.ctx.nodes.disconnect(node) {
            debug!(node = %node, "disconnect of node without connection");
            return outcome;
        }
        let abort = Abort::Disconnect { node: node.clone() };
        for resource in self.ctx.rsc_dfns.names() {
            outcome.merge(self.machine.run(&resource, Some(&abort)));
        }
        outcome
    }

    /// Records a satellite's state report and runs one coordination pass per
    /// reported resource.
    ///
    /// Each resource report is checked by the state sequence detector and
    /// recorded under one lock scope (resource definition, then node). If
    /// the detector fails, the reports recorded so far still get their
    /// passes before the error is returned.
    pub fn state_report(&self, node: &NodeName, reports: &[ResourceReport]) -> CtrlResult<PassOutcome> {
        if !self.ctx.nodes.is_connected(node) {
            warn!(node = %node, "state report from node without connection ignored");
            return Ok(PassOutcome::default());
        }

        let mut resources = BTreeSet::new();
        let mut failure = None;
        for report in reports {
            trace!(node = %node, ?report, "satellite state report");
            if let Err(err) = self.detect_and_record(node, report) {
                failure = Some(err);
                break;
            }
            resources.insert(report.resource.clone());
        }

        let mut outcome = PassOutcome::default();
        for resource in &resources {
            outcome.merge(self.machine.run(resource, None));
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    fn detect_and_record(&self, node: &NodeName, report: &ResourceReport) -> CtrlResult<()> {
        let rsc_dfn = self.ctx.rsc_dfns.get(&report.resource);
        let mut rsc_dfn = rsc_dfn.as_ref().map(|rsc_dfn| rsc_dfn.lock());
        self.ctx.nodes.with_satellite_state_mut(
            node,
            |state| -> CtrlResult<()> {
                for vlm in &report.volumes {
                    if let Some(current) = &vlm.disk_state {
                        let previous = state
                            .volume(&report.resource, vlm.volume)
                            .and_then(|v| v.disk_state.as_deref());
                        self.detector.check(
                            rsc_dfn.as_deref_mut(),
                            node,
                            &report.resource,
                            vlm.volume,
                            previous,
                            current,
                        )?;
                    }
                }
                record(state, report);
                Ok(())
            },
            Ok(()),
        )
    }

    /// A satellite failed to apply a snapshot. The snapshot fails with
    /// FAILED_DEPLOYMENT and `message` is passed on to waiting callers.
    pub fn deployment_failed(
        &self,
        node: &NodeName,
        resource: &ResourceName,
        snapshot: &SnapshotName,
        message: &str,
    ) -> PassOutcome {
        warn!(node = %node, resource = %resource, snapshot = %snapshot, message, "snapshot deployment failed");
        let abort = Abort::Deployment {
            node: node.clone(),
            snapshot: snapshot.clone(),
            message: message.to_string(),
        };
        self.machine.run(resource, Some(&abort))
    }

    /// Runs a pass without new input.
    pub fn reconcile(&self, resource: &ResourceName) -> PassOutcome {
        self.machine.run(resource, None)
    }
}
