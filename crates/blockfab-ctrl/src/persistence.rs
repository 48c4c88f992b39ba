//! Persistence collaborator for snapshot objects.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::error::{CtrlError, CtrlResult};
use crate::snapshot::SnapshotDefinition;
use crate::types::{NodeName, ResourceName, SnapshotName};

/// Stores snapshot definitions. Calls are made while the resource lock is held.
pub trait SnapshotStore: Send + Sync {
    /// Inserts or replaces a definition together with its per-node snapshots.
    fn persist_definition(&self, dfn: &SnapshotDefinition) -> CtrlResult<()>;

    /// Removes one node's snapshot.
    fn delete_snapshot(
        &self,
        resource: &ResourceName,
        snapshot: &SnapshotName,
        node: &NodeName,
    ) -> CtrlResult<()>;

    /// Removes a definition.
    fn delete_definition(&self, resource: &ResourceName, snapshot: &SnapshotName) -> CtrlResult<()>;
}

/// In-memory [`SnapshotStore`]. Can be told to fail for testing abort paths.
#[derive(Default)]
pub struct MemoryStore {
    dfns: Mutex<BTreeMap<(ResourceName, SnapshotName), SnapshotDefinition>>,
    fail_with: Mutex<Option<String>>,
}

impl MemoryStore {
    /// An empty store that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail with `message`, or succeed again with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.fail_with.lock() = message.map(str::to_string);
    }

    /// Last persisted copy of a definition.
    pub fn get(&self, resource: &ResourceName, snapshot: &SnapshotName) -> Option<SnapshotDefinition> {
        self.dfns
            .lock()
            .get(&(resource.clone(), snapshot.clone()))
            .cloned()
    }

    /// Number of persisted definitions.
    pub fn len(&self) -> usize {
        self.dfns.lock().len()
    }

    /// Returns true if nothing is persisted.
    pub fn is_empty(&self) -> bool {
        self.dfns.lock().is_empty()
    }

    fn check(&self) -> CtrlResult<()> {
        match &*self.fail_with.lock() {
            Some(message) => Err(CtrlError::Persistence(message.clone())),
            None => Ok(()),
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn persist_definition(&self, dfn: &SnapshotDefinition) -> CtrlResult<()> {
        self.check()?;
        self.dfns
            .lock()
            .insert((dfn.resource.clone(), dfn.name.clone()), dfn.clone());
        Ok(())
    }

    fn delete_snapshot(
        &self,
        resource: &ResourceName,
        snapshot: &SnapshotName,
        node: &NodeName,
    ) -> CtrlResult<()> {
        self.check()?;
        if let Some(dfn) = self.dfns.lock().get_mut(&(resource.clone(), snapshot.clone())) {
            dfn.remove_snapshot(node);
        }
        Ok(())
    }

    fn delete_definition(&self, resource: &ResourceName, snapshot: &SnapshotName) -> CtrlResult<()> {
        self.check()?;
        self.dfns.lock().remove(&(resource.clone(), snapshot.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_and_delete() {
        let store = MemoryStore::new();
        let rsc = ResourceName::new("r0").unwrap();
        let name = SnapshotName::new("s1").unwrap();
        let node = NodeName::new("alpha").unwrap();
        let mut dfn = SnapshotDefinition::new(rsc.clone(), name.clone(), 1);
        dfn.add_snapshot(node.clone()).unwrap();

        store.persist_definition(&dfn).unwrap();
        assert_eq!(store.len(), 1);

        store.delete_snapshot(&rsc, &name, &node).unwrap();
        assert!(!store.get(&rsc, &name).unwrap().has_snapshots());

        store.delete_definition(&rsc, &name).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_injected_failure() {
        let store = MemoryStore::new();
        let dfn = SnapshotDefinition::new(
            ResourceName::new("r0").unwrap(),
            SnapshotName::new("s1").unwrap(),
            1,
        );
        store.set_failure(Some("disk full"));
        match store.persist_definition(&dfn) {
            Err(CtrlError::Persistence(msg)) => assert_eq!(msg, "disk full"),
            other => panic!("unexpected {:?}", other),
        }
        store.set_failure(None);
        assert!(store.persist_definition(&dfn).is_ok());
    }
}
