//! Controller-side cache of what each satellite last reported.

use blockfab_drbd::VolumeNumber;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::ResourceName;

/// Reported state of one volume.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteVolumeState {
    /// Last reported disk state, as the satellite spelled it.
    pub disk_state: Option<String>,
    /// I/O on the volume is suspended for a snapshot.
    pub suspended: bool,
    /// The snapshot of the volume has been taken.
    pub snapshot_taken: bool,
    /// The snapshot of the volume has been removed.
    pub snapshot_deleted: bool,
}

/// Reported state of one resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteResourceState {
    /// Whether the resource is in use (primary) on the satellite.
    pub in_use: Option<bool>,
    /// Per-volume state.
    pub volumes: BTreeMap<VolumeNumber, SatelliteVolumeState>,
}

impl SatelliteResourceState {
    /// True if at least one volume has reported and every volume satisfies `f`.
    pub fn all_volumes(&self, f: impl Fn(&SatelliteVolumeState) -> bool) -> bool {
        !self.volumes.is_empty() && self.volumes.values().all(f)
    }

    /// True if any volume satisfies `f`.
    pub fn any_volume(&self, f: impl Fn(&SatelliteVolumeState) -> bool) -> bool {
        self.volumes.values().any(f)
    }
}

/// Everything one satellite has reported, keyed by resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteState {
    /// Per-resource state.
    pub resources: BTreeMap<ResourceName, SatelliteResourceState>,
}

impl SatelliteState {
    /// Creates an empty state, as held for a freshly connected satellite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resource state if the satellite reported the resource.
    pub fn resource(&self, name: &ResourceName) -> Option<&SatelliteResourceState> {
        self.resources.get(name)
    }

    /// Applies `f` to the resource state if the satellite reported the resource.
    pub fn from_resource<T>(
        &self,
        name: &ResourceName,
        f: impl FnOnce(&SatelliteResourceState) -> T,
    ) -> Option<T> {
        self.resources.get(name).map(f)
    }

    /// Returns the volume state if the satellite reported the volume.
    pub fn volume(&self, name: &ResourceName, volume: VolumeNumber) -> Option<&SatelliteVolumeState> {
        self.resources.get(name).and_then(|r| r.volumes.get(&volume))
    }

    /// Returns the volume state, creating it if the satellite never reported it.
    pub fn volume_mut(&mut self, name: &ResourceName, volume: VolumeNumber) -> &mut SatelliteVolumeState {
        self.resources
            .entry(name.clone())
            .or_default()
            .volumes
            .entry(volume)
            .or_default()
    }

    /// Records whether the resource is in use on the satellite.
    pub fn set_in_use(&mut self, name: &ResourceName, in_use: bool) {
        self.resources.entry(name.clone()).or_default().in_use = Some(in_use);
    }

    /// Forgets everything reported about the resource.
    pub fn remove_resource(&mut self, name: &ResourceName) -> Option<SatelliteResourceState> {
        self.resources.remove(name)
    }

    /// Forgets everything reported.
    pub fn clear(&mut self) {
        self.resources.clear();
    }

    /// Forgets `snapshot_taken` on every volume of the resource. A taken flag
    /// only counts once it was reported after the take was commanded.
    pub fn clear_snapshot_taken(&mut self, name: &ResourceName) {
        if let Some(resource) = self.resources.get_mut(name) {
            for volume in resource.volumes.values_mut() {
                volume.snapshot_taken = false;
            }
        }
    }

    /// Forgets `snapshot_deleted` on every volume of the resource. A deleted
    /// flag only counts once it was reported after the deletion was requested.
    pub fn clear_snapshot_deleted(&mut self, name: &ResourceName) {
        if let Some(resource) = self.resources.get_mut(name) {
            for volume in resource.volumes.values_mut() {
                volume.snapshot_deleted = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsc(name: &str) -> ResourceName {
        ResourceName::new(name).unwrap()
    }

    fn vol(nr: u32) -> VolumeNumber {
        VolumeNumber::new(nr).unwrap()
    }

    #[test]
    fn test_volume_mut_creates_entries() {
        let mut state = SatelliteState::new();
        assert!(state.resource(&rsc("r0")).is_none());

        state.volume_mut(&rsc("r0"), vol(1)).suspended = true;
        assert!(state.volume(&rsc("r0"), vol(1)).unwrap().suspended);
        assert!(state.volume(&rsc("r0"), vol(0)).is_none());
    }

    #[test]
    fn test_all_volumes_requires_a_report() {
        let mut state = SatelliteState::new();
        state.set_in_use(&rsc("r0"), false);
        let r0 = state.resource(&rsc("r0")).unwrap();
        assert!(!r0.all_volumes(|v| !v.suspended));
        assert!(!r0.any_volume(|v| v.suspended));

        state.volume_mut(&rsc("r0"), vol(0)).suspended = true;
        state.volume_mut(&rsc("r0"), vol(1));
        let r0 = state.resource(&rsc("r0")).unwrap();
        assert!(!r0.all_volumes(|v| v.suspended));
        assert!(r0.any_volume(|v| v.suspended));
    }

    #[test]
    fn test_from_resource() {
        let mut state = SatelliteState::new();
        assert_eq!(state.from_resource(&rsc("r0"), |r| r.volumes.len()), None);
        state.volume_mut(&rsc("r0"), vol(0));
        assert_eq!(state.from_resource(&rsc("r0"), |r| r.volumes.len()), Some(1));
        state.remove_resource(&rsc("r0"));
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_clear_snapshot_flags_is_per_resource() {
        let mut state = SatelliteState::new();
        for name in ["r0", "r1"] {
            let v = state.volume_mut(&rsc(name), vol(0));
            v.suspended = true;
            v.snapshot_taken = true;
            v.snapshot_deleted = true;
        }

        state.clear_snapshot_taken(&rsc("r0"));
        let v = state.volume(&rsc("r0"), vol(0)).unwrap();
        assert!(!v.snapshot_taken);
        assert!(v.snapshot_deleted);
        assert!(v.suspended);

        state.clear_snapshot_deleted(&rsc("r0"));
        assert!(!state.volume(&rsc("r0"), vol(0)).unwrap().snapshot_deleted);

        let other = state.volume(&rsc("r1"), vol(0)).unwrap();
        assert!(other.snapshot_taken && other.snapshot_deleted);

        // unknown resource is a no-op
        state.clear_snapshot_taken(&rsc("r9"));
        assert!(state.resource(&rsc("r9")).is_none());
    }
}
