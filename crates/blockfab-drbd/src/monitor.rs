//! Interprets `drbdsetup events2 all` lines and updates the state tracker.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, trace};

use crate::error::{DrbdError, DrbdResult};
use crate::events::{EventAction, EventLine, EventObject};
use crate::objects::{DrbdConnection, DrbdResource, DrbdVolume};
use crate::observer::StateChange;
use crate::tracker::DrbdStateTracker;
use crate::types::VolumeNumber;

/// Applies events2 lines to a [`DrbdStateTracker`].
///
/// `exists` lines build a silent baseline. Other lines received before the
/// `exists -` marker are queued and applied right after the baseline.
pub struct EventsMonitor {
    tracker: Arc<DrbdStateTracker>,
    exists_finished: bool,
    queued: VecDeque<EventLine>,
}

impl EventsMonitor {
    /// Creates a monitor feeding the given tracker.
    pub fn new(tracker: Arc<DrbdStateTracker>) -> Self {
        Self {
            tracker,
            exists_finished: false,
            queued: VecDeque::new(),
        }
    }

    /// Returns the tracker this monitor feeds.
    pub fn tracker(&self) -> &Arc<DrbdStateTracker> {
        &self.tracker
    }

    /// Returns whether the initial replay has completed.
    pub fn is_state_available(&self) -> bool {
        self.tracker.is_state_available()
    }

    /// Processes one line of event source output.
    pub fn receive_event(&mut self, line: &str) -> DrbdResult<()> {
        trace!(line, "DRBD 'events2'");
        let event = match EventLine::parse(line)? {
            Some(event) => event,
            None => return Ok(()),
        };

        if !self.exists_finished && event.action != EventAction::Exists {
            self.queued.push_back(event);
            return Ok(());
        }
        self.execute(event)
    }

    /// Notifies observers that the tree is going away and resets the monitor
    /// so the next replay is treated as a baseline again.
    pub fn reinitializing(&mut self) {
        self.exists_finished = false;
        self.queued.clear();
        self.tracker.reinitializing();
    }

    fn execute(&mut self, event: EventLine) -> DrbdResult<()> {
        let baseline = event.action == EventAction::Exists;
        match (&event.action, &event.object) {
            (EventAction::Exists | EventAction::Create, EventObject::EndOfInit) => {
                self.end_of_init()
            }
            (EventAction::Other(_), _) | (_, EventObject::Other(_)) => Ok(()),
            (_, EventObject::EndOfInit) => Ok(()),
            _ => {
                let mut changes = Vec::new();
                let result = self
                    .tracker
                    .with_tree_mut(|tree| apply(tree, &event, &mut changes));
                if let Err(err) = &result {
                    if err.is_fatal() {
                        error!(error = %err, "DRBD events2 line contradicts tracked state");
                    }
                }
                if !baseline {
                    self.tracker.dispatch(&changes);
                }
                result
            }
        }
    }

    fn end_of_init(&mut self) -> DrbdResult<()> {
        if self.exists_finished {
            return Ok(());
        }
        self.exists_finished = true;
        debug!(queued = self.queued.len(), "DRBD initial state replay complete");
        self.tracker.set_available();

        let mut first_err = None;
        while let Some(event) = self.queued.pop_front() {
            if let Err(err) = self.execute(event) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

type Tree = std::collections::BTreeMap<String, DrbdResource>;

fn apply(tree: &mut Tree, event: &EventLine, changes: &mut Vec<StateChange>) -> DrbdResult<()> {
    match event.action {
        EventAction::Exists | EventAction::Create => create(tree, event, changes),
        EventAction::Change => change(tree, event, changes),
        EventAction::Destroy => destroy(tree, event, changes),
        EventAction::Other(_) => Ok(()),
    }
}

fn create(tree: &mut Tree, event: &EventLine, changes: &mut Vec<StateChange>) -> DrbdResult<()> {
    match event.object {
        EventObject::Resource => {
            let name = event.resource_name()?;
            let resource = tree.entry(name.to_string()).or_insert_with(|| {
                changes.push(StateChange::ResourceCreated {
                    resource: name.to_string(),
                });
                DrbdResource::new(name)
            });
            resource.update(&event.props, changes);
        }
        EventObject::Connection => {
            let resource = get_resource(tree, event)?;
            let peer = event.connection_name()?;
            let rsc_name = resource.name.clone();
            let connection = resource
                .connections
                .entry(peer.to_string())
                .or_insert_with(|| {
                    changes.push(StateChange::ConnectionCreated {
                        resource: rsc_name.clone(),
                        peer: peer.to_string(),
                    });
                    DrbdConnection::new(peer)
                });
            connection.update(&rsc_name, &event.props, changes);
        }
        EventObject::Device => {
            let resource = get_resource(tree, event)?;
            let number = event.volume_number()?;
            let rsc_name = resource.name.clone();
            let volume = resource.volumes.entry(number).or_insert_with(|| {
                changes.push(StateChange::VolumeCreated {
                    resource: rsc_name.clone(),
                    peer: None,
                    volume: number,
                });
                DrbdVolume::new(number)
            });
            volume.update(&rsc_name, None, &event.props, changes);
        }
        EventObject::PeerDevice => {
            let resource = get_resource(tree, event)?;
            let number = event.volume_number()?;
            let rsc_name = resource.name.clone();
            let connection = get_connection(resource, event)?;
            let peer = connection.peer_name.clone();
            let volume = connection.volumes.entry(number).or_insert_with(|| {
                changes.push(StateChange::VolumeCreated {
                    resource: rsc_name.clone(),
                    peer: Some(peer.clone()),
                    volume: number,
                });
                DrbdVolume::new(number)
            });
            volume.update(&rsc_name, Some(&peer), &event.props, changes);
        }
        EventObject::EndOfInit | EventObject::Other(_) => {}
    }
    Ok(())
}

fn change(tree: &mut Tree, event: &EventLine, changes: &mut Vec<StateChange>) -> DrbdResult<()> {
    match event.object {
        EventObject::Resource => {
            get_resource(tree, event)?.update(&event.props, changes);
        }
        EventObject::Connection => {
            let resource = get_resource(tree, event)?;
            let rsc_name = resource.name.clone();
            get_connection(resource, event)?.update(&rsc_name, &event.props, changes);
        }
        EventObject::Device => {
            let resource = get_resource(tree, event)?;
            let number = event.volume_number()?;
            let rsc_name = resource.name.clone();
            let volume = resource
                .volumes
                .get_mut(&number)
                .ok_or_else(|| non_existent_volume(event, &rsc_name, None, number))?;
            volume.update(&rsc_name, None, &event.props, changes);
        }
        EventObject::PeerDevice => {
            let resource = get_resource(tree, event)?;
            let number = event.volume_number()?;
            let rsc_name = resource.name.clone();
            let connection = get_connection(resource, event)?;
            let peer = connection.peer_name.clone();
            let volume = connection
                .volumes
                .get_mut(&number)
                .ok_or_else(|| non_existent_volume(event, &rsc_name, Some(&peer), number))?;
            volume.update(&rsc_name, Some(&peer), &event.props, changes);
        }
        EventObject::EndOfInit | EventObject::Other(_) => {}
    }
    Ok(())
}

fn destroy(tree: &mut Tree, event: &EventLine, changes: &mut Vec<StateChange>) -> DrbdResult<()> {
    match event.object {
        EventObject::Resource => {
            let name = event.resource_name()?;
            if tree.remove(name).is_none() {
                return Err(non_existent_resource(event, name));
            }
            changes.push(StateChange::ResourceDestroyed {
                resource: name.to_string(),
            });
        }
        EventObject::Connection => {
            let resource = get_resource(tree, event)?;
            let peer = event.connection_name()?;
            if resource.connections.remove(peer).is_none() {
                return Err(non_existent_connection(event, &resource.name, peer));
            }
            changes.push(StateChange::ConnectionDestroyed {
                resource: resource.name.clone(),
                peer: peer.to_string(),
            });
        }
        EventObject::Device => {
            let resource = get_resource(tree, event)?;
            let number = event.volume_number()?;
            if resource.volumes.remove(&number).is_none() {
                return Err(non_existent_volume(event, &resource.name, None, number));
            }
            changes.push(StateChange::VolumeDestroyed {
                resource: resource.name.clone(),
                peer: None,
                volume: number,
            });
        }
        EventObject::PeerDevice => {
            let resource = get_resource(tree, event)?;
            let number = event.volume_number()?;
            let rsc_name = resource.name.clone();
            let connection = get_connection(resource, event)?;
            if connection.volumes.remove(&number).is_none() {
                return Err(non_existent_volume(
                    event,
                    &rsc_name,
                    Some(&connection.peer_name),
                    number,
                ));
            }
            changes.push(StateChange::VolumeDestroyed {
                resource: rsc_name,
                peer: Some(connection.peer_name.clone()),
                volume: number,
            });
        }
        EventObject::EndOfInit | EventObject::Other(_) => {}
    }
    Ok(())
}

fn get_resource<'a>(tree: &'a mut Tree, event: &EventLine) -> DrbdResult<&'a mut DrbdResource> {
    let name = event.resource_name()?;
    tree.get_mut(name)
        .ok_or_else(|| non_existent_resource(event, name))
}

fn get_connection<'a>(
    resource: &'a mut DrbdResource,
    event: &EventLine,
) -> DrbdResult<&'a mut DrbdConnection> {
    let peer = event.connection_name()?;
    let rsc_name = &resource.name;
    match resource.connections.get_mut(peer) {
        Some(connection) => Ok(connection),
        None => Err(non_existent_connection(event, rsc_name, peer)),
    }
}

fn non_existent_resource(event: &EventLine, name: &str) -> DrbdError {
    DrbdError::Fatal(format!(
        "event line for operation '{} {}' references non-existent resource '{}'",
        event.action.as_str(),
        event.object.as_str(),
        name
    ))
}

fn non_existent_connection(event: &EventLine, resource: &str, peer: &str) -> DrbdError {
    DrbdError::Fatal(format!(
        "event line for operation '{} {}' references non-existent connection '{}' of resource '{}'",
        event.action.as_str(),
        event.object.as_str(),
        peer,
        resource
    ))
}

fn non_existent_volume(
    event: &EventLine,
    resource: &str,
    peer: Option<&str>,
    number: VolumeNumber,
) -> DrbdError {
    match peer {
        None => DrbdError::Fatal(format!(
            "event line for operation '{} {}' references non-existent volume {} of resource '{}'",
            event.action.as_str(),
            event.object.as_str(),
            number,
            resource
        )),
        Some(peer) => DrbdError::Fatal(format!(
            "event line for operation '{} {}' references non-existent peer-volume {} of connection '{}' of resource '{}'",
            event.action.as_str(),
            event.object.as_str(),
            number,
            peer,
            resource
        )),
    }
}
