//! Cluster-visible event streams scoped by [`EventIdentifier`].
//!
//! A stream is opened once, triggered any number of times and closed with a
//! final payload. Callers waiting for the outcome of an asynchronous operation
//! subscribe to the stream and read until they see [`StreamEvent::Closed`].

use blockfab_drbd::VolumeNumber;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{NodeName, ResourceName, SnapshotName};

/// Names of the event streams the controller publishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    /// Role, disk or replication state of a resource on a node.
    ResourceState,
    /// Local disk state of one volume on a node.
    VolumeDiskState,
    /// Outcome of a coordinated snapshot.
    SnapshotDeployment,
}

impl EventName {
    /// Wire name of the stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::ResourceState => "ResourceState",
            EventName::VolumeDiskState => "VolumeDiskState",
            EventName::SnapshotDeployment => "SnapshotDeployment",
        }
    }
}

/// Scopes an event stream. Unset fields act as wildcards when the identifier
/// is used as a filter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventIdentifier {
    /// Kind of stream.
    pub event_name: EventName,
    /// Node the stream is about, if any.
    pub node: Option<NodeName>,
    /// Resource the stream is about, if any.
    pub resource: Option<ResourceName>,
    /// Volume the stream is about, if any.
    pub volume: Option<VolumeNumber>,
    /// Snapshot the stream is about, if any.
    pub snapshot: Option<SnapshotName>,
}

impl EventIdentifier {
    /// An identifier with only the event name set.
    pub fn partial(event_name: EventName) -> Self {
        Self {
            event_name,
            node: None,
            resource: None,
            volume: None,
            snapshot: None,
        }
    }

    /// Stream of a resource's state on one node.
    pub fn resource_state(node: &NodeName, resource: &ResourceName) -> Self {
        Self::partial(EventName::ResourceState)
            .with_node(node)
            .with_resource(resource)
    }

    /// Stream of one volume's disk state on one node.
    pub fn volume_disk_state(node: &NodeName, resource: &ResourceName, volume: VolumeNumber) -> Self {
        let mut id = Self::partial(EventName::VolumeDiskState)
            .with_node(node)
            .with_resource(resource);
        id.volume = Some(volume);
        id
    }

    /// Stream carrying the outcome of a snapshot.
    pub fn snapshot_deployment(resource: &ResourceName, snapshot: &SnapshotName) -> Self {
        let mut id = Self::partial(EventName::SnapshotDeployment).with_resource(resource);
        id.snapshot = Some(snapshot.clone());
        id
    }

    /// Narrows the identifier to one node.
    pub fn with_node(mut self, node: &NodeName) -> Self {
        self.node = Some(node.clone());
        self
    }

    /// Narrows the identifier to one resource.
    pub fn with_resource(mut self, resource: &ResourceName) -> Self {
        self.resource = Some(resource.clone());
        self
    }

    /// Returns true if `self` is covered by the `partial` filter.
    pub fn matches(&self, partial: &EventIdentifier) -> bool {
        fn field<T: PartialEq>(value: &Option<T>, filter: &Option<T>) -> bool {
            filter.as_ref().map_or(true, |f| value.as_ref() == Some(f))
        }
        self.event_name == partial.event_name
            && field(&self.node, &partial.node)
            && field(&self.resource, &partial.resource)
            && field(&self.volume, &partial.volume)
            && field(&self.snapshot, &partial.snapshot)
    }
}

impl fmt::Display for EventIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event_name.as_str())?;
        if let Some(node) = &self.node {
            write!(f, " node={}", node)?;
        }
        if let Some(resource) = &self.resource {
            write!(f, " resource={}", resource)?;
        }
        if let Some(volume) = &self.volume {
            write!(f, " volume={}", volume)?;
        }
        if let Some(snapshot) = &self.snapshot {
            write!(f, " snapshot={}", snapshot)?;
        }
        Ok(())
    }
}

/// Final payload of a closed stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamPayload {
    /// Closed without an outcome, e.g. the object went away.
    Plain,
    /// The operation completed.
    Success(String),
    /// The operation was aborted; the message is shown to the caller verbatim.
    Aborted(String),
}

/// An item delivered to stream subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// The state behind the stream changed.
    Triggered,
    /// The stream was closed and will not deliver anything else.
    Closed(StreamPayload),
}

/// Registry of open event streams.
pub struct EventBroker {
    streams: RwLock<HashMap<EventIdentifier, broadcast::Sender<StreamEvent>>>,
    capacity: usize,
}

impl EventBroker {
    /// `capacity` bounds each stream; lagging subscribers lose the oldest events.
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Opens a stream. Opening an already open stream is a no-op and returns false.
    pub fn open_stream(&self, id: EventIdentifier) -> bool {
        let mut streams = self.streams.write();
        if streams.contains_key(&id) {
            return false;
        }
        debug!(stream = %id, "open event stream");
        let (sender, _) = broadcast::channel(self.capacity);
        streams.insert(id, sender);
        true
    }

    /// Returns true while the stream is open.
    pub fn is_open(&self, id: &EventIdentifier) -> bool {
        self.streams.read().contains_key(id)
    }

    /// Subscribes to an open stream.
    pub fn subscribe(&self, id: &EventIdentifier) -> Option<broadcast::Receiver<StreamEvent>> {
        self.streams.read().get(id).map(|sender| sender.subscribe())
    }

    /// Notifies subscribers that the state behind the stream changed.
    /// Returns false if the stream is not open.
    pub fn trigger(&self, id: &EventIdentifier) -> bool {
        match self.streams.read().get(id) {
            Some(sender) => {
                // No subscribers is fine.
                let _ = sender.send(StreamEvent::Triggered);
                true
            }
            None => false,
        }
    }

    /// Closes a stream with a final payload. Returns false if it was not open.
    pub fn close_stream(&self, id: &EventIdentifier, payload: StreamPayload) -> bool {
        let sender = self.streams.write().remove(id);
        match sender {
            Some(sender) => {
                debug!(stream = %id, ?payload, "close event stream");
                let _ = sender.send(StreamEvent::Closed(payload));
                true
            }
            None => false,
        }
    }

    /// Closes every stream matched by `partial`. Returns the number closed.
    pub fn close_all_streams(&self, partial: &EventIdentifier) -> usize {
        let closed: Vec<(EventIdentifier, broadcast::Sender<StreamEvent>)> = {
            let mut streams = self.streams.write();
            let ids: Vec<EventIdentifier> = streams
                .keys()
                .filter(|id| id.matches(partial))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| streams.remove(&id).map(|sender| (id, sender)))
                .collect()
        };
        for (id, sender) in &closed {
            debug!(stream = %id, "close event stream");
            let _ = sender.send(StreamEvent::Closed(StreamPayload::Plain));
        }
        closed.len()
    }

    /// Identifiers of all open streams.
    pub fn open_streams(&self) -> Vec<EventIdentifier> {
        self.streams.read().keys().cloned().collect()
    }
}
