//! Shared DRBD state tree and observer multiplexer.
//!
//! The tree is mutated only by the events monitor, which collects
//! notifications while it holds the write lock and dispatches them once the
//! lock has been released.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{DrbdError, DrbdResult};
use crate::objects::DrbdResource;
use crate::observer::{EventMask, StateChange, StateObserver};

struct Registration {
    mask: EventMask,
    observer: Arc<dyn StateObserver>,
}

/// Tracks the state of all local DRBD resources.
pub struct DrbdStateTracker {
    resources: RwLock<BTreeMap<String, DrbdResource>>,
    observers: RwLock<Vec<Registration>>,
    state_available: AtomicBool,
}

impl Default for DrbdStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DrbdStateTracker {
    /// Creates an empty tracker. State is unavailable until the first replay completes.
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(BTreeMap::new()),
            observers: RwLock::new(Vec::new()),
            state_available: AtomicBool::new(false),
        }
    }

    /// Registers an observer for the notifications selected by `mask`.
    ///
    /// Availability notifications are always delivered.
    pub fn add_observer(&self, observer: Arc<dyn StateObserver>, mask: EventMask) {
        self.observers.write().push(Registration { mask, observer });
    }

    /// Unregisters an observer. Returns true if it was registered.
    pub fn remove_observer(&self, observer: &Arc<dyn StateObserver>) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|reg| !Arc::ptr_eq(&reg.observer, observer));
        observers.len() != before
    }

    /// Returns whether the initial replay has completed since the last (re)start.
    pub fn is_state_available(&self) -> bool {
        self.state_available.load(Ordering::Acquire)
    }

    /// Returns a copy of the named resource.
    pub fn resource(&self, name: &str) -> DrbdResult<DrbdResource> {
        self.require_available()?;
        self.resources
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DrbdError::Absent {
                kind: "resource",
                name: name.to_string(),
            })
    }

    /// Returns a copy of every tracked resource, ordered by name.
    pub fn all_resources(&self) -> DrbdResult<Vec<DrbdResource>> {
        self.require_available()?;
        Ok(self.resources.read().values().cloned().collect())
    }

    fn require_available(&self) -> DrbdResult<()> {
        if self.is_state_available() {
            Ok(())
        } else {
            Err(DrbdError::NotReady)
        }
    }

    pub(crate) fn with_tree_mut<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, DrbdResource>) -> R,
    ) -> R {
        let mut resources = self.resources.write();
        f(&mut resources)
    }

    fn snapshot_observers(&self) -> Vec<(EventMask, Arc<dyn StateObserver>)> {
        self.observers
            .read()
            .iter()
            .map(|reg| (reg.mask, Arc::clone(&reg.observer)))
            .collect()
    }

    pub(crate) fn dispatch(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        let observers = self.snapshot_observers();
        for change in changes {
            debug!(?change, "DRBD state change");
            let bit = change.mask();
            for (mask, observer) in &observers {
                if mask.contains(bit) {
                    observer.state_changed(change);
                }
            }
        }
    }

    pub(crate) fn set_available(&self) {
        self.state_available.store(true, Ordering::Release);
        for (_, observer) in self.snapshot_observers() {
            observer.state_available();
        }
    }

    /// Marks the state unavailable, notifies observers and discards the tree.
    pub(crate) fn reinitializing(&self) {
        self.state_available.store(false, Ordering::Release);
        for (_, observer) in self.snapshot_observers() {
            observer.state_unavailable();
        }
        self.resources.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<StateChange>>,
        available: Mutex<u32>,
        unavailable: Mutex<u32>,
    }

    impl StateObserver for Recorder {
        fn state_changed(&self, change: &StateChange) {
            self.changes.lock().push(change.clone());
        }

        fn state_available(&self) {
            *self.available.lock() += 1;
        }

        fn state_unavailable(&self) {
            *self.unavailable.lock() += 1;
        }
    }

    fn created(name: &str) -> StateChange {
        StateChange::ResourceCreated {
            resource: name.to_string(),
        }
    }

    #[test]
    fn test_queries_fail_until_available() {
        let tracker = DrbdStateTracker::new();
        assert!(matches!(tracker.resource("r0"), Err(DrbdError::NotReady)));
        assert!(matches!(tracker.all_resources(), Err(DrbdError::NotReady)));

        tracker.set_available();
        assert!(matches!(
            tracker.resource("r0"),
            Err(DrbdError::Absent { .. })
        ));
        assert!(tracker.all_resources().unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_respects_mask() {
        let tracker = DrbdStateTracker::new();
        let rec = Arc::new(Recorder::default());
        tracker.add_observer(rec.clone(), EventMask::RES_DESTROYED);

        tracker.dispatch(&[created("r0")]);
        assert!(rec.changes.lock().is_empty());

        tracker.dispatch(&[StateChange::ResourceDestroyed {
            resource: "r0".to_string(),
        }]);
        assert_eq!(rec.changes.lock().len(), 1);
    }

    #[test]
    fn test_remove_observer() {
        let tracker = DrbdStateTracker::new();
        let rec = Arc::new(Recorder::default());
        let obs: Arc<dyn StateObserver> = rec.clone();
        tracker.add_observer(obs.clone(), EventMask::ALL);
        assert!(tracker.remove_observer(&obs));
        assert!(!tracker.remove_observer(&obs));

        tracker.dispatch(&[created("r0")]);
        assert!(rec.changes.lock().is_empty());
    }

    #[test]
    fn test_reinitializing_clears_tree_and_notifies() {
        let tracker = DrbdStateTracker::new();
        let rec = Arc::new(Recorder::default());
        tracker.add_observer(rec.clone(), EventMask::NONE);

        tracker.with_tree_mut(|tree| {
            tree.insert("r0".to_string(), DrbdResource::new("r0"));
        });
        tracker.set_available();
        assert_eq!(tracker.all_resources().unwrap().len(), 1);

        tracker.reinitializing();
        assert!(!tracker.is_state_available());
        assert_eq!(*rec.available.lock(), 1);
        assert_eq!(*rec.unavailable.lock(), 1);

        tracker.set_available();
        assert!(tracker.all_resources().unwrap().is_empty());
    }
}
