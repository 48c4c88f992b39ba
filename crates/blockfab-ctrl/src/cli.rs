//! `bfab` command line.

use crate::config::CtrlConfig;
use crate::event_broker::EventBroker;
use crate::publisher::{LocalView, StatePublisher};
use crate::types::NodeName;
use anyhow::Result;
use blockfab_drbd::{
    DrbdEventService, DrbdStateTracker, EventMask, ServiceState, StateChange, StateObserver,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Command line of the `bfab` node agent.
#[derive(Parser)]
#[command(name = "bfab")]
#[command(about = "blockfab node agent", long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// `bfab` subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Track local DRBD state and publish changes until interrupted
    Watch {
        /// Path to a `.toml` or `.json` config file.
        #[arg(short, long, default_value = "/etc/blockfab/bfab.toml")]
        config: PathBuf,
    },
    /// Print the effective configuration as JSON
    ShowConfig {
        /// Path to a `.toml` or `.json` config file.
        #[arg(short, long, default_value = "/etc/blockfab/bfab.toml")]
        config: PathBuf,
    },
}

impl Cli {
    /// Runs the selected subcommand to completion.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Watch { config } => watch(CtrlConfig::from_file(&config)?).await,
            Command::ShowConfig { config } => {
                let config = CtrlConfig::from_file(&config)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }
}

struct ChangeLogger;

impl StateObserver for ChangeLogger {
    fn state_changed(&self, change: &StateChange) {
        info!(resource = change.resource(), ?change, "DRBD state changed");
    }

    fn state_available(&self) {
        info!("DRBD state available");
    }

    fn state_unavailable(&self) {
        info!("DRBD state unavailable, reinitializing");
    }
}

async fn watch(config: CtrlConfig) -> Result<()> {
    let node = NodeName::new(config.node_name.as_str())?;
    let tracker = Arc::new(DrbdStateTracker::new());
    let broker = Arc::new(EventBroker::new(config.event_channel_capacity));
    let _publisher = StatePublisher::register(
        node.clone(),
        Arc::clone(&broker),
        Arc::new(LocalView),
        &tracker,
    );
    tracker.add_observer(Arc::new(ChangeLogger), EventMask::ALL);

    let service = DrbdEventService::new(config.event_source(), tracker);
    service.start()?;
    info!(node = %node, "watching DRBD events");

    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = poll.tick() => {
                if service.state() == ServiceState::Stopped {
                    info!("DRBD event source exited");
                    break;
                }
            }
        }
    }

    service.shutdown().await;
    let stats = service.stats();
    info!(
        lines = stats.lines_processed,
        rejected = stats.lines_rejected,
        fatal = stats.fatal_errors,
        restarts = stats.restarts,
        open_streams = broker.open_streams().len(),
        "watch finished"
    );
    Ok(())
}
