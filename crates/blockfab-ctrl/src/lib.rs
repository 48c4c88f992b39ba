#![warn(missing_docs)]

//! blockfab controller subsystem: satellite state cache, snapshot coordination, cluster event streams

pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod event_broker;
pub mod node_registry;
pub mod persistence;
pub mod publisher;
pub mod rsc_dfn;
pub mod satellite_state;
pub mod snapshot;
pub mod snapshot_api;
pub mod snapshot_state_machine;
pub mod state_sequence;
pub mod transport;
pub mod types;

pub use config::CtrlConfig;
pub use context::CtrlContext;
pub use controller::{Controller, ResourceReport, VolumeReport};
pub use error::{CtrlError, CtrlResult};
pub use event_broker::{EventBroker, EventIdentifier, EventName, StreamEvent, StreamPayload};
pub use node_registry::NodeRegistry;
pub use persistence::{MemoryStore, SnapshotStore};
pub use publisher::{ClusterView, LocalView, StatePublisher};
pub use rsc_dfn::{Resource, ResourceDefinition, ResourceDefinitionRegistry};
pub use snapshot::{Snapshot, SnapshotDefinition, SnapshotDfnFlags, SnapshotPhase};
pub use snapshot_api::SnapshotApi;
pub use snapshot_state_machine::{Abort, PassOutcome, SnapshotStateMachine};
pub use state_sequence::StateSequenceDetector;
pub use transport::{InProgressSnapshotReply, SatelliteNotifier, SnapshotNotification};
pub use types::{NodeName, ResourceName, SnapshotName};
