//! Watches reported disk-state sequences for transitions that need special
//! handling before the new state is recorded.

use blockfab_drbd::{DiskState, VolumeNumber};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{CtrlError, CtrlResult};
use crate::rsc_dfn::{ResourceDefinition, ResourceDefinitionRegistry, KEY_SKIP_DISK, VAL_TRUE};
use crate::types::{NodeName, ResourceName};

fn is_disk_state(reported: &str, state: DiskState) -> bool {
    reported.eq_ignore_ascii_case(state.as_str())
}

/// A volume that went Failed → Diskless was detached by DRBD after an I/O
/// error. Re-attaching it automatically would hit the same error, so the
/// resource is marked to skip the disk.
pub struct StateSequenceDetector {
    rsc_dfns: Arc<ResourceDefinitionRegistry>,
}

impl StateSequenceDetector {
    /// Creates a detector that looks resources up in `rsc_dfns`.
    pub fn new(rsc_dfns: Arc<ResourceDefinitionRegistry>) -> Self {
        Self { rsc_dfns }
    }

    /// Inspects one disk-state transition, locking the resource definition
    /// itself. Returns true if the skip-disk property was set by this call.
    pub fn disk_state_changed(
        &self,
        node: &NodeName,
        resource: &ResourceName,
        volume: VolumeNumber,
        previous: Option<&str>,
        current: &str,
    ) -> CtrlResult<bool> {
        if !is_failed_to_diskless(previous, current) {
            return Ok(false);
        }
        let rsc_dfn = self.rsc_dfns.get(resource);
        let mut guard = rsc_dfn.as_ref().map(|rsc_dfn| rsc_dfn.lock());
        self.check(guard.as_deref_mut(), node, resource, volume, previous, current)
    }

    /// Same as [`disk_state_changed`](Self::disk_state_changed) for a caller
    /// that already holds the resource definition's lock. `None` means the
    /// definition does not exist.
    pub fn check(
        &self,
        rsc_dfn: Option<&mut ResourceDefinition>,
        node: &NodeName,
        resource: &ResourceName,
        volume: VolumeNumber,
        previous: Option<&str>,
        current: &str,
    ) -> CtrlResult<bool> {
        if !is_failed_to_diskless(previous, current) {
            return Ok(false);
        }

        let rsc_dfn = match rsc_dfn {
            Some(rsc_dfn) => rsc_dfn,
            None => {
                warn!(node = %node, resource = %resource, volume = %volume, "Failed to Diskless on unknown resource definition");
                return Ok(false);
            }
        };
        let rsc = match rsc_dfn.resource_mut(node) {
            Some(rsc) => rsc,
            None => {
                warn!(node = %node, resource = %resource, volume = %volume, "Failed to Diskless on resource that no longer exists");
                return Ok(false);
            }
        };

        if rsc.props.get(KEY_SKIP_DISK) == Some(VAL_TRUE) {
            return Ok(false);
        }
        match rsc.props.set(KEY_SKIP_DISK, VAL_TRUE) {
            Ok(_) => {
                info!(node = %node, resource = %resource, volume = %volume, "disk went Failed to Diskless, skipping disk from now on");
                Ok(true)
            }
            Err(err) => {
                let err = CtrlError::Implementation(format!(
                    "internally managed property {} rejected: {}",
                    KEY_SKIP_DISK, err
                ));
                error!(node = %node, resource = %resource, error = %err, "setting skip-disk property failed");
                Err(err)
            }
        }
    }
}

fn is_failed_to_diskless(previous: Option<&str>, current: &str) -> bool {
    previous.map_or(false, |prev| is_disk_state(prev, DiskState::Failed))
        && is_disk_state(current, DiskState::Diskless)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsc_dfn::Resource;

    fn setup() -> (StateSequenceDetector, Arc<ResourceDefinitionRegistry>) {
        let registry = Arc::new(ResourceDefinitionRegistry::new());
        let mut dfn = ResourceDefinition::new(ResourceName::new("r0").unwrap(), [VolumeNumber::new(0).unwrap()]);
        dfn.add_resource(Resource::new(NodeName::new("alpha").unwrap(), false))
            .unwrap();
        registry.insert(dfn).unwrap();
        (StateSequenceDetector::new(Arc::clone(&registry)), registry)
    }

    fn skip_disk(registry: &ResourceDefinitionRegistry) -> Option<String> {
        let dfn = registry.get(&ResourceName::new("r0").unwrap()).unwrap();
        let dfn = dfn.lock();
        dfn.resource(&NodeName::new("alpha").unwrap())
            .and_then(|r| r.props.get(KEY_SKIP_DISK).map(str::to_string))
    }

    #[test]
    fn test_failed_to_diskless_sets_skip_disk_once() {
        let (detector, registry) = setup();
        let node = NodeName::new("alpha").unwrap();
        let rsc = ResourceName::new("r0").unwrap();
        let vol = VolumeNumber::new(0).unwrap();

        assert!(detector
            .disk_state_changed(&node, &rsc, vol, Some("FAILED"), "DISKLESS")
            .unwrap());
        assert_eq!(skip_disk(&registry).as_deref(), Some("True"));

        assert!(!detector
            .disk_state_changed(&node, &rsc, vol, Some("Failed"), "Diskless")
            .unwrap());
    }

    #[test]
    fn test_other_transitions_pass_through() {
        let (detector, registry) = setup();
        let node = NodeName::new("alpha").unwrap();
        let rsc = ResourceName::new("r0").unwrap();
        let vol = VolumeNumber::new(0).unwrap();

        for (prev, cur) in [
            (Some("Failed"), "Attaching"),
            (Some("Failed"), "Attached"),
            (Some("FAILED"), "UpToDate"),
            (Some("UpToDate"), "Diskless"),
            (None, "Diskless"),
            (Some("Diskless"), "Diskless"),
        ] {
            assert!(!detector.disk_state_changed(&node, &rsc, vol, prev, cur).unwrap());
        }
        assert_eq!(skip_disk(&registry), None);
    }

    #[test]
    fn test_absent_resource_is_not_an_error() {
        let (detector, _) = setup();
        let vol = VolumeNumber::new(0).unwrap();
        assert!(!detector
            .disk_state_changed(
                &NodeName::new("alpha").unwrap(),
                &ResourceName::new("gone").unwrap(),
                vol,
                Some("Failed"),
                "Diskless",
            )
            .unwrap());
        assert!(!detector
            .disk_state_changed(
                &NodeName::new("beta").unwrap(),
                &ResourceName::new("r0").unwrap(),
                vol,
                Some("Failed"),
                "Diskless",
            )
            .unwrap());
    }

    #[test]
    fn test_check_with_held_lock() {
        let (detector, registry) = setup();
        let node = NodeName::new("alpha").unwrap();
        let rsc = ResourceName::new("r0").unwrap();
        let vol = VolumeNumber::new(0).unwrap();

        {
            let dfn = registry.get(&rsc).unwrap();
            let mut guard = dfn.lock();
            assert!(!detector
                .check(Some(&mut *guard), &node, &rsc, vol, Some("Failed"), "Attached")
                .unwrap());
            assert!(detector
                .check(Some(&mut *guard), &node, &rsc, vol, Some("Failed"), "Diskless")
                .unwrap());
        }
        assert_eq!(skip_disk(&registry).as_deref(), Some(VAL_TRUE));
        assert!(!detector
            .check(None, &node, &rsc, vol, Some("Failed"), "Diskless")
            .unwrap());
    }
}
