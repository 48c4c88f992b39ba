//! Subprocess-backed events2 source.
//!
//! The service owns a `drbdsetup events2 all` child process. Two reader tasks
//! forward its stdout and stderr into a bounded queue; a single consumer task
//! drains the queue and feeds the [`EventsMonitor`]. Output on stderr means
//! the source lost sync with the kernel: the consumer notifies observers,
//! kills the child and starts a fresh one whose replay becomes the new
//! baseline. Shutdown enqueues a sentinel so the consumer stops at a message
//! boundary.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{DrbdError, DrbdResult};
use crate::monitor::EventsMonitor;
use crate::tracker::DrbdStateTracker;

/// Configuration of the events2 source process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourceConfig {
    /// Program to run.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Capacity of the line queue between readers and consumer.
    pub queue_capacity: usize,
    /// Delay before a new child is spawned after a desync.
    pub restart_delay_ms: u64,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            program: "drbdsetup".to_string(),
            args: vec!["events2".to_string(), "all".to_string()],
            queue_capacity: 1024,
            restart_delay_ms: 500,
        }
    }
}

/// Lifecycle state of the event service.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// No child process, no consumer.
    Stopped,
    /// Child process running, consumer draining its output.
    Running,
    /// Desync detected; the child is being replaced.
    Restarting,
}

impl ServiceState {
    fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Running => "running",
            ServiceState::Restarting => "restarting",
        }
    }
}

/// Counters published by the consumer task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Lines applied to the state tree without error.
    pub lines_processed: u64,
    /// Lines that could not be interpreted.
    pub lines_rejected: u64,
    /// Lines that contradicted the tracked state.
    pub fatal_errors: u64,
    /// Child restarts after a desync.
    pub restarts: u64,
}

#[derive(Debug)]
enum SourceMessage {
    Line { generation: u64, line: String },
    Desync { generation: u64, line: String },
    Exited { generation: u64 },
    Shutdown,
}

/// Runs the events2 source and keeps a [`DrbdStateTracker`] up to date.
pub struct DrbdEventService {
    config: EventSourceConfig,
    tracker: Arc<DrbdStateTracker>,
    state: Arc<Mutex<ServiceState>>,
    stats_tx: Arc<watch::Sender<TrackerStats>>,
    sender: Mutex<Option<mpsc::Sender<SourceMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DrbdEventService {
    /// Creates a stopped service feeding `tracker`.
    pub fn new(config: EventSourceConfig, tracker: Arc<DrbdStateTracker>) -> Self {
        let (stats_tx, _) = watch::channel(TrackerStats::default());
        Self {
            config,
            tracker,
            state: Arc::new(Mutex::new(ServiceState::Stopped)),
            stats_tx: Arc::new(stats_tx),
            sender: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Returns the tracker fed by this service.
    pub fn tracker(&self) -> &Arc<DrbdStateTracker> {
        &self.tracker
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Returns the latest counters.
    pub fn stats(&self) -> TrackerStats {
        self.stats_tx.borrow().clone()
    }

    /// Subscribes to counter updates.
    pub fn subscribe_stats(&self) -> watch::Receiver<TrackerStats> {
        self.stats_tx.subscribe()
    }

    /// Launches the child process and the consumer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> DrbdResult<()> {
        {
            let mut state = self.state.lock();
            if *state != ServiceState::Stopped {
                return Err(DrbdError::InvalidServiceState {
                    state: state.as_str(),
                });
            }
            *state = ServiceState::Running;
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let child = match spawn_source(&self.config, 0, &tx) {
            Ok(child) => child,
            Err(err) => {
                *self.state.lock() = ServiceState::Stopped;
                return Err(err);
            }
        };
        info!(program = %self.config.program, "DRBD event service started");

        let consumer = Consumer {
            config: self.config.clone(),
            monitor: EventsMonitor::new(Arc::clone(&self.tracker)),
            state: Arc::clone(&self.state),
            stats_tx: Arc::clone(&self.stats_tx),
            tx: tx.clone(),
            child,
            generation: 0,
        };
        let handle = tokio::spawn(consumer.run(rx));

        *self.sender.lock() = Some(tx);
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stops the consumer and the child process. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if let Some(sender) = sender {
            if sender.send(SourceMessage::Shutdown).await.is_err() {
                debug!("DRBD event consumer already gone");
            }
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "DRBD event consumer task failed");
            }
        }
        *self.state.lock() = ServiceState::Stopped;
    }
}

fn spawn_source(
    config: &EventSourceConfig,
    generation: u64,
    tx: &mpsc::Sender<SourceMessage>,
) -> DrbdResult<Child> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DrbdError::Fatal("events source stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DrbdError::Fatal("events source stderr not captured".to_string()))?;

    let out_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if out_tx
                        .send(SourceMessage::Line { generation, line })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "reading events source stdout failed");
                    break;
                }
            }
        }
        let _ = out_tx.send(SourceMessage::Exited { generation }).await;
    });

    let err_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if err_tx
                .send(SourceMessage::Desync { generation, line })
                .await
                .is_err()
            {
                return;
            }
        }
    });

    Ok(child)
}

struct Consumer {
    config: EventSourceConfig,
    monitor: EventsMonitor,
    state: Arc<Mutex<ServiceState>>,
    stats_tx: Arc<watch::Sender<TrackerStats>>,
    tx: mpsc::Sender<SourceMessage>,
    child: Child,
    generation: u64,
}

impl Consumer {
    async fn run(mut self, mut rx: mpsc::Receiver<SourceMessage>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                SourceMessage::Shutdown => {
                    debug!("DRBD event consumer received shutdown marker");
                    break;
                }
                SourceMessage::Line { generation, line } if generation == self.generation => {
                    self.process_line(&line);
                }
                SourceMessage::Desync { generation, line } if generation == self.generation => {
                    warn!(stderr = %line, "DRBD events source desynchronized, restarting");
                    if !self.restart().await {
                        break;
                    }
                }
                SourceMessage::Exited { generation } if generation == self.generation => {
                    info!("DRBD events source exited");
                    break;
                }
                stale => trace!(?stale, "discarding output of a replaced events source"),
            }
        }

        self.kill_child().await;
        self.monitor.reinitializing();
        *self.state.lock() = ServiceState::Stopped;
        info!("DRBD event service stopped");
    }

    fn process_line(&mut self, line: &str) {
        match self.monitor.receive_event(line) {
            Ok(()) => self.stats_tx.send_modify(|s| s.lines_processed += 1),
            Err(err) if err.is_fatal() => {
                self.stats_tx.send_modify(|s| s.fatal_errors += 1);
            }
            Err(err) => {
                warn!(error = %err, line, "rejected DRBD events2 line");
                self.stats_tx.send_modify(|s| s.lines_rejected += 1);
            }
        }
    }

    async fn restart(&mut self) -> bool {
        *self.state.lock() = ServiceState::Restarting;
        self.monitor.reinitializing();
        self.kill_child().await;

        tokio::time::sleep(Duration::from_millis(self.config.restart_delay_ms)).await;

        self.generation += 1;
        match spawn_source(&self.config, self.generation, &self.tx) {
            Ok(child) => {
                self.child = child;
                self.stats_tx.send_modify(|s| s.restarts += 1);
                *self.state.lock() = ServiceState::Running;
                true
            }
            Err(err) => {
                error!(error = %err, "unable to restart DRBD events source");
                false
            }
        }
    }

    async fn kill_child(&mut self) {
        if let Err(err) = self.child.start_kill() {
            trace!(error = %err, "events source already terminated");
        }
        if let Err(err) = self.child.wait().await {
            warn!(error = %err, "waiting for events source failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(body: &str) -> EventSourceConfig {
        EventSourceConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), body.to_string()],
            queue_capacity: 16,
            restart_delay_ms: 10,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_builds_state_and_shutdown_is_idempotent() {
        let tracker = Arc::new(DrbdStateTracker::new());
        let service = DrbdEventService::new(
            script("echo 'exists resource name:r0 role:Primary'; echo 'exists -'; sleep 30"),
            Arc::clone(&tracker),
        );
        service.start().unwrap();
        assert!(wait_for(|| tracker.is_state_available()).await);
        assert_eq!(service.state(), ServiceState::Running);
        assert!(tracker.resource("r0").is_ok());

        service.shutdown().await;
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!tracker.is_state_available());
        service.shutdown().await;
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let tracker = Arc::new(DrbdStateTracker::new());
        let service = DrbdEventService::new(script("sleep 30"), tracker);
        service.start().unwrap();
        assert!(matches!(
            service.start(),
            Err(DrbdError::InvalidServiceState { state: "running" })
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_program_leaves_service_stopped() {
        let tracker = Arc::new(DrbdStateTracker::new());
        let config = EventSourceConfig {
            program: "/nonexistent/drbdsetup".to_string(),
            ..EventSourceConfig::default()
        };
        let service = DrbdEventService::new(config, tracker);
        assert!(matches!(service.start(), Err(DrbdError::Io(_))));
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_process_exit_stops_service() {
        let tracker = Arc::new(DrbdStateTracker::new());
        let service = DrbdEventService::new(script("echo 'exists -'"), Arc::clone(&tracker));
        service.start().unwrap();
        assert!(wait_for(|| service.state() == ServiceState::Stopped).await);
        assert!(!tracker.is_state_available());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_stderr_triggers_restart() {
        let tracker = Arc::new(DrbdStateTracker::new());
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("desync").display().to_string();
        let body = format!(
            "if [ -e {m} ]; then echo 'exists resource name:r1'; echo 'exists -'; sleep 30; \
             else touch {m}; echo 'exists resource name:r0'; echo 'exists -'; sleep 0.2; echo desync >&2; sleep 30; fi",
            m = marker
        );
        let service = DrbdEventService::new(script(&body), Arc::clone(&tracker));
        service.start().unwrap();

        assert!(wait_for(|| service.stats().restarts == 1).await);
        assert!(wait_for(|| tracker.resource("r1").is_ok()).await);
        assert!(tracker.resource("r0").is_err());

        service.shutdown().await;
    }
}
