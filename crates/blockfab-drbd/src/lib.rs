#![warn(missing_docs)]

//! blockfab DRBD subsystem: events2 tracking, kernel resource state tree, state change observers
//!
//! This crate turns the continuous output of `drbdsetup events2 all` into a
//! typed tree of resources, connections and volumes, and notifies registered
//! observers about role, disk, replication and lifecycle transitions.

pub mod error;
pub mod events;
pub mod monitor;
pub mod objects;
pub mod observer;
pub mod service;
pub mod tracker;
pub mod types;

pub use error::{DrbdError, DrbdResult};
pub use events::{EventAction, EventLine, EventObject};
pub use monitor::EventsMonitor;
pub use objects::{DrbdConnection, DrbdResource, DrbdVolume};
pub use observer::{EventMask, StateChange, StateObserver};
pub use service::{DrbdEventService, EventSourceConfig, ServiceState, TrackerStats};
pub use tracker::DrbdStateTracker;
pub use types::{ConnectionState, DiskState, ReplState, Role, VolumeNumber};
