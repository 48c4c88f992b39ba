//! End-to-end snapshot coordination through the controller's inbound API.

mod common;

use blockfab_ctrl::rsc_dfn::{KEY_SKIP_DISK, VAL_TRUE};
use blockfab_ctrl::{
    EventIdentifier, InProgressSnapshotReply, SnapshotDfnFlags, SnapshotPhase, StreamEvent,
    StreamPayload,
};
use common::*;

#[test]
fn test_three_node_snapshot_succeeds() {
    let cluster = Cluster::new(3);
    let api = cluster.controller.snapshots();

    api.create_snapshot(&[], RESOURCE, SNAPSHOT).unwrap();
    assert_eq!(cluster.notifier.count(), 3);
    let mut rx = cluster
        .ctx()
        .broker
        .subscribe(&EventIdentifier::snapshot_deployment(&resource(), &snapshot()))
        .unwrap();

    // running, unsuspended: suspend is commanded once all three have reported
    assert_eq!(cluster.report_all(false, false), 3);
    cluster.with_snapshot(|dfn| {
        assert_eq!(dfn.phase, SnapshotPhase::Suspending);
        assert!(dfn.snapshots().all(|s| s.suspend_resource && !s.take_snapshot));
    });

    assert_eq!(cluster.report_all(true, false), 3);
    cluster.with_snapshot(|dfn| {
        assert_eq!(dfn.phase, SnapshotPhase::SnapshotRequested);
        assert!(dfn.snapshots().all(|s| s.take_snapshot));
    });

    assert_eq!(cluster.report_all(true, true), 3);
    cluster.with_snapshot(|dfn| {
        assert_eq!(dfn.phase, SnapshotPhase::Resuming);
        assert!(dfn.snapshots().all(|s| !s.suspend_resource && s.take_snapshot));
    });

    assert_eq!(cluster.report_all(false, true), 0);
    cluster.with_snapshot(|dfn| {
        assert!(dfn.is_successful());
        assert!(!dfn.in_progress);
        assert_eq!(dfn.phase, SnapshotPhase::Successful);
    });
    assert!(cluster
        .store
        .get(&resource(), &snapshot())
        .unwrap()
        .is_successful());

    match rx.try_recv().unwrap() {
        StreamEvent::Closed(StreamPayload::Success(message)) => {
            assert!(message.contains(SNAPSHOT));
            assert!(message.contains(RESOURCE));
        }
        other => panic!("unexpected stream event {:?}", other),
    }

    let latest = api.latest_successful_snapshot(RESOURCE).unwrap().unwrap();
    assert_eq!(latest.name, snapshot());
}

#[test]
fn test_disconnect_fails_snapshot() {
    let cluster = Cluster::new(3);
    let api = cluster.controller.snapshots();
    api.create_snapshot(&[], RESOURCE, SNAPSHOT).unwrap();
    let mut rx = cluster
        .ctx()
        .broker
        .subscribe(&EventIdentifier::snapshot_deployment(&resource(), &snapshot()))
        .unwrap();
    assert_eq!(cluster.report_all(false, false), 3);
    cluster.notifier.clear();

    let lost = cluster.nodes[1].clone();
    let outcome = cluster.controller.node_disconnected(&lost);
    assert_eq!(outcome.failed, vec![snapshot()]);
    assert_eq!(outcome.notifications, 0);

    cluster.with_snapshot(|dfn| {
        assert!(dfn.flags.is_set(SnapshotDfnFlags::FAILED_DISCONNECT));
        assert!(!dfn.in_progress);
    });
    match rx.try_recv().unwrap() {
        StreamEvent::Closed(StreamPayload::Aborted(message)) => {
            assert!(message.contains(lost.as_str()));
        }
        other => panic!("unexpected stream event {:?}", other),
    }

    // the remaining nodes keep reporting; nothing more is commanded
    assert_eq!(cluster.report_all(true, false), 0);
    assert_eq!(cluster.notifier.count(), 0);

    let reply = api
        .respond_snapshot(&cluster.nodes[0], RESOURCE, SNAPSHOT)
        .unwrap();
    assert!(matches!(reply, InProgressSnapshotReply::Ended { .. }));
}

#[test]
fn test_deployment_failure_is_reported_to_waiters() {
    let cluster = Cluster::new(2);
    cluster
        .controller
        .snapshots()
        .create_snapshot(&[], RESOURCE, SNAPSHOT)
        .unwrap();
    let mut rx = cluster
        .ctx()
        .broker
        .subscribe(&EventIdentifier::snapshot_deployment(&resource(), &snapshot()))
        .unwrap();

    let outcome = cluster.controller.deployment_failed(
        &cluster.nodes[0],
        &resource(),
        &snapshot(),
        "thin pool full",
    );
    assert_eq!(outcome.failed, vec![snapshot()]);
    assert_eq!(
        rx.try_recv().unwrap(),
        StreamEvent::Closed(StreamPayload::Aborted("thin pool full".to_string()))
    );
    cluster.with_snapshot(|dfn| assert!(dfn.flags.is_set(SnapshotDfnFlags::FAILED_DEPLOYMENT)));
}

#[test]
fn test_delete_after_success_removes_definition() {
    let cluster = Cluster::new(2);
    let api = cluster.controller.snapshots();
    api.create_snapshot(&[], RESOURCE, SNAPSHOT).unwrap();
    cluster.report_all(false, false);
    cluster.report_all(true, false);
    cluster.report_all(true, true);
    cluster.report_all(false, true);
    cluster.with_snapshot(|dfn| assert!(dfn.is_successful()));

    cluster.notifier.clear();
    api.delete_snapshot(RESOURCE, SNAPSHOT).unwrap();
    assert_eq!(cluster.notifier.count(), 2);

    let reply = api
        .respond_snapshot(&cluster.nodes[0], RESOURCE, SNAPSHOT)
        .unwrap();
    match reply {
        InProgressSnapshotReply::Data(data) => assert!(data.delete),
        other => panic!("unexpected reply {:?}", other),
    }

    for node in &cluster.nodes {
        let mut report = snapshot_report(false, true);
        report.volumes[0].snapshot_deleted = Some(true);
        cluster.controller.state_report(node, &[report]).unwrap();
    }
    assert!(api.list_snapshot_definitions().is_empty());
    assert!(cluster.store.is_empty());
    assert!(api.latest_successful_snapshot(RESOURCE).unwrap().is_none());
}

#[test]
fn test_failed_to_diskless_sets_skip_disk_once() {
    let cluster = Cluster::new(2);
    let node = cluster.nodes[0].clone();
    let skip_disk = |cluster: &Cluster| {
        let rsc_dfn = cluster.ctx().rsc_dfns.get(&resource()).unwrap();
        let guard = rsc_dfn.lock();
        guard
            .resource(&node)
            .unwrap()
            .props
            .get(KEY_SKIP_DISK)
            .map(str::to_string)
    };

    for state in ["UpToDate", "Failed", "Diskless"] {
        cluster
            .controller
            .state_report(&node, &[disk_report(state)])
            .unwrap();
    }
    assert_eq!(skip_disk(&cluster).as_deref(), Some(VAL_TRUE));

    // a second Failed -> Diskless sequence leaves the property as it is
    for state in ["Failed", "Diskless"] {
        cluster
            .controller
            .state_report(&node, &[disk_report(state)])
            .unwrap();
    }
    assert_eq!(skip_disk(&cluster).as_deref(), Some(VAL_TRUE));

    // other nodes are unaffected
    let other = cluster.nodes[1].clone();
    let rsc_dfn = cluster.ctx().rsc_dfns.get(&resource()).unwrap();
    assert!(rsc_dfn
        .lock()
        .resource(&other)
        .unwrap()
        .props
        .get(KEY_SKIP_DISK)
        .is_none());
}

#[test]
fn test_failed_to_attaching_or_attached_does_not_set_skip_disk() {
    let cluster = Cluster::new(1);
    let node = cluster.nodes[0].clone();
    for state in ["Failed", "Attaching", "Diskless", "Failed", "Attached", "Diskless"] {
        cluster
            .controller
            .state_report(&node, &[disk_report(state)])
            .unwrap();
    }
    let rsc_dfn = cluster.ctx().rsc_dfns.get(&resource()).unwrap();
    assert!(rsc_dfn
        .lock()
        .resource(&node)
        .unwrap()
        .props
        .get(KEY_SKIP_DISK)
        .is_none());
}

#[test]
fn test_reports_from_unconnected_node_are_ignored() {
    let cluster = Cluster::new(2);
    cluster
        .controller
        .snapshots()
        .create_snapshot(&[], RESOURCE, SNAPSHOT)
        .unwrap();
    cluster.controller.node_disconnected(&cluster.nodes[0]);

    let outcome = cluster
        .controller
        .state_report(&cluster.nodes[0], &[snapshot_report(true, true)])
        .unwrap();
    assert_eq!(outcome.notifications, 0);
    let recorded = cluster.ctx().nodes.with_satellite_state(
        &cluster.nodes[0],
        |state| state.volume(&resource(), volume()).is_some(),
        false,
    );
    assert!(!recorded);
}

#[test]
fn test_back_to_back_snapshots_repeat_the_protocol() {
    let cluster = Cluster::new(2);
    assert_eq!(cluster.run_snapshot("first", &[0, 1]), PROTOCOL.to_vec());
    cluster.with_named_snapshot("first", |dfn| assert!(dfn.is_successful()));

    // both nodes still have snapshot_taken cached from "first"
    cluster
        .controller
        .snapshots()
        .create_snapshot(&[], RESOURCE, SNAPSHOT)
        .unwrap();
    cluster.report_in_order(SNAPSHOT, &[0, 1], &progress_report(Some(false), None));
    let seen = cluster.report_in_order(SNAPSHOT, &[0, 1], &progress_report(Some(true), None));
    assert_eq!(seen, vec![Some((true, true))]);
    cluster.with_snapshot(|dfn| assert_eq!(dfn.phase, SnapshotPhase::SnapshotRequested));

    // only a taken report made after the take command moves it on
    assert_eq!(cluster.controller.reconcile(&resource()).notifications, 0);
    let seen = cluster.report_in_order(SNAPSHOT, &[1, 0], &progress_report(None, Some(true)));
    assert_eq!(seen, vec![Some((false, true))]);
    cluster.report_in_order(SNAPSHOT, &[1, 0], &progress_report(Some(false), None));
    cluster.with_snapshot(|dfn| assert!(dfn.is_successful()));

    let latest = cluster
        .controller
        .snapshots()
        .latest_successful_snapshot(RESOURCE)
        .unwrap()
        .unwrap();
    assert_eq!(latest.name, snapshot());
}

#[test]
fn test_sequential_deletions_wait_for_confirmation() {
    let cluster = Cluster::new(2);
    cluster.run_snapshot("old", &[0, 1]);
    assert_eq!(cluster.delete_snapshot("old", &[0, 1]), vec![true, false]);

    assert_eq!(cluster.run_snapshot(SNAPSHOT, &[1, 0]), PROTOCOL.to_vec());
    cluster
        .controller
        .snapshots()
        .delete_snapshot(RESOURCE, SNAPSHOT)
        .unwrap();

    // snapshot_deleted is still cached from "old"
    let outcome = cluster.controller.reconcile(&resource());
    assert!(outcome.deleted.is_empty());
    cluster.with_snapshot(|dfn| assert_eq!(dfn.nodes(), cluster.nodes));

    let mut confirm = progress_report(None, None);
    confirm.volumes[0].snapshot_deleted = Some(true);
    cluster
        .controller
        .state_report(&cluster.nodes[1], &[confirm.clone()])
        .unwrap();
    cluster.with_snapshot(|dfn| assert_eq!(dfn.nodes(), vec![cluster.nodes[0].clone()]));

    let outcome = cluster
        .controller
        .state_report(&cluster.nodes[0], &[confirm])
        .unwrap();
    assert_eq!(outcome.deleted, vec![snapshot()]);
    assert!(!cluster.exists(SNAPSHOT));
    assert!(cluster.store.is_empty());
}

#[test]
fn test_report_batch_is_applied_in_order() {
    let cluster = Cluster::new(1);
    let node = cluster.nodes[0].clone();
    cluster
        .controller
        .state_report(&node, &[disk_report("Failed"), disk_report("Diskless")])
        .unwrap();

    let rsc_dfn = cluster.ctx().rsc_dfns.get(&resource()).unwrap();
    assert_eq!(
        rsc_dfn.lock().resource(&node).unwrap().props.get(KEY_SKIP_DISK),
        Some(VAL_TRUE)
    );
    let recorded = cluster.ctx().nodes.with_satellite_state(
        &node,
        |state| {
            state
                .volume(&resource(), volume())
                .and_then(|v| v.disk_state.clone())
        },
        None,
    );
    assert_eq!(recorded.as_deref(), Some("Diskless"));
}
