//! Node agent configuration.

use blockfab_drbd::EventSourceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node agent configuration. Missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CtrlConfig {
    /// Name this node publishes its events under.
    pub node_name: String,
    /// Program that prints the DRBD event stream.
    pub events_program: String,
    /// Arguments passed to `events_program`.
    pub events_args: Vec<String>,
    /// Lines buffered between the reader and the tracker.
    pub event_queue_capacity: usize,
    /// Pause before restarting the event source after it failed.
    pub restart_delay_ms: u64,
    /// Capacity of each cluster event stream.
    pub event_channel_capacity: usize,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            node_name: String::from("localhost"),
            events_program: String::from("drbdsetup"),
            events_args: vec![String::from("events2"), String::from("all")],
            event_queue_capacity: 1024,
            restart_delay_ms: 500,
            event_channel_capacity: 64,
        }
    }
}

impl CtrlConfig {
    /// Loads a `.toml` or `.json` file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: CtrlConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: CtrlConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Settings for the local events2 source process.
    pub fn event_source(&self) -> EventSourceConfig {
        EventSourceConfig {
            program: self.events_program.clone(),
            args: self.events_args.clone(),
            queue_capacity: self.event_queue_capacity,
            restart_delay_ms: self.restart_delay_ms,
        }
    }
}
