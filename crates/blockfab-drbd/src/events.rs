//! Parser for `drbdsetup events2` lines.
//!
//! A line has the form `<action> <object> key:value key:value ...`. Tokens
//! after the object type without a `:` separator are ignored.

use std::collections::BTreeMap;

use crate::error::{DrbdError, DrbdResult};
use crate::types::VolumeNumber;

/// Property key of the resource name.
pub const KEY_RES_NAME: &str = "name";
/// Property key of the connection (peer) name.
pub const KEY_CONN_NAME: &str = "conn-name";
/// Property key of the volume number.
pub const KEY_VOL_NR: &str = "volume";

/// Action column of an events2 line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventAction {
    /// Object existed when the event stream was opened.
    Exists,
    /// Object was created.
    Create,
    /// Object changed.
    Change,
    /// Object was destroyed.
    Destroy,
    /// Untracked action, such as a helper `call` or `response`.
    Other(String),
}

impl EventAction {
    fn parse(token: &str) -> Self {
        match token {
            "exists" => EventAction::Exists,
            "create" => EventAction::Create,
            "change" => EventAction::Change,
            "destroy" => EventAction::Destroy,
            other => EventAction::Other(other.to_string()),
        }
    }

    /// Returns the events2 keyword.
    pub fn as_str(&self) -> &str {
        match self {
            EventAction::Exists => "exists",
            EventAction::Create => "create",
            EventAction::Change => "change",
            EventAction::Destroy => "destroy",
            EventAction::Other(s) => s,
        }
    }
}

/// Object column of an events2 line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventObject {
    /// A DRBD resource.
    Resource,
    /// A connection to a peer.
    Connection,
    /// A local volume.
    Device,
    /// A peer volume, scoped by connection.
    PeerDevice,
    /// `-`: end of the initial `exists` replay.
    EndOfInit,
    /// Untracked object, such as a connection `path`.
    Other(String),
}

impl EventObject {
    fn parse(token: &str) -> Self {
        match token {
            "resource" => EventObject::Resource,
            "connection" => EventObject::Connection,
            "device" => EventObject::Device,
            "peer-device" => EventObject::PeerDevice,
            "-" => EventObject::EndOfInit,
            other => EventObject::Other(other.to_string()),
        }
    }

    /// Returns the events2 keyword.
    pub fn as_str(&self) -> &str {
        match self {
            EventObject::Resource => "resource",
            EventObject::Connection => "connection",
            EventObject::Device => "device",
            EventObject::PeerDevice => "peer-device",
            EventObject::EndOfInit => "-",
            EventObject::Other(s) => s,
        }
    }
}

/// One parsed events2 line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventLine {
    /// What happened.
    pub action: EventAction,
    /// To which kind of object.
    pub object: EventObject,
    /// Flat key/value properties.
    pub props: BTreeMap<String, String>,
}

impl EventLine {
    /// Parses a line. Returns `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> DrbdResult<Option<Self>> {
        let mut tokens = line.split_whitespace();
        let action = match tokens.next() {
            Some(token) => EventAction::parse(token),
            None => return Ok(None),
        };
        let object = match tokens.next() {
            Some(token) => EventObject::parse(token),
            None => {
                return Err(DrbdError::EventsSource(format!(
                    "received an event line without an object type: '{}'",
                    line.trim()
                )))
            }
        };

        let mut props = BTreeMap::new();
        for token in tokens {
            if let Some((key, value)) = token.split_once(':') {
                props.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Some(EventLine {
            action,
            object,
            props,
        }))
    }

    /// Returns a mandatory property or an `EventsSource` error naming the operation.
    pub fn prop(&self, key: &str) -> DrbdResult<&str> {
        self.props.get(key).map(String::as_str).ok_or_else(|| {
            DrbdError::EventsSource(format!(
                "event line for operation '{} {}' does not contain the '{}' argument",
                self.action.as_str(),
                self.object.as_str(),
                key
            ))
        })
    }

    /// Returns the resource name.
    pub fn resource_name(&self) -> DrbdResult<&str> {
        self.prop(KEY_RES_NAME)
    }

    /// Returns the connection name.
    pub fn connection_name(&self) -> DrbdResult<&str> {
        self.prop(KEY_CONN_NAME)
    }

    /// Returns the volume number.
    pub fn volume_number(&self) -> DrbdResult<VolumeNumber> {
        let text = self.prop(KEY_VOL_NR)?;
        text.parse::<u32>()
            .ok()
            .and_then(VolumeNumber::new)
            .ok_or_else(|| {
                DrbdError::EventsSource(format!(
                    "event line for operation '{} {}' contains an invalid volume number '{}'",
                    self.action.as_str(),
                    self.object.as_str(),
                    text
                ))
            })
    }
}
