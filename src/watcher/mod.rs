//! Change Watcher
//!
//! Keeps the cache coherent with the remote file system. Per-path events
//! are debounced into batches and applied as one invalidation per distinct
//! path; version control and package manager operations with an unbounded
//! blast radius clear the cache outright. A gap in the change stream also
//! clears the cache once the stream reconnects.
//!
//! All work happens on a single worker task fed through [`WatcherHandle`].

pub mod batch;
pub mod events;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::config::duration_ms;
use crate::cache::CacheEngine;

pub use batch::{Batch, Invalidation};
pub use events::{ChangeEvent, ChangeKind, GitOperation, RemoteEvent};

/// Watcher tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatcherConfig {
    /// Quiet period after the last event before a batch is applied
    #[serde(with = "duration_ms")]
    pub debounce: Duration,
    /// Pending distinct paths that force an early flush
    pub max_batch: usize,
    /// Clear on every reconnect, not only after a detected interruption
    pub clear_on_reconnect_always: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            max_batch: 1_000,
            clear_on_reconnect_always: false,
        }
    }
}

/// Messages from handles to the worker
#[derive(Debug)]
enum Command {
    Change(ChangeEvent),
    Git(GitOperation),
    Package(String),
    Interrupted,
    Reconnected,
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Worker state
pub struct ChangeWatcher {
    engine: Arc<CacheEngine>,
    config: WatcherConfig,
    batch: Batch,
    /// Set when the stream may have dropped events
    interrupted: bool,
}

impl ChangeWatcher {
    /// Start a watcher for `engine` on the current runtime
    pub fn spawn(engine: Arc<CacheEngine>, config: WatcherConfig) -> WatcherHandle {
        let (commands, rx) = mpsc::unbounded_channel();

        info!(
            debounce_ms = config.debounce.as_millis() as u64,
            max_batch = config.max_batch,
            "Change watcher started"
        );

        let watcher = Self {
            engine,
            config,
            batch: Batch::default(),
            interrupted: false,
        };
        let worker = tokio::spawn(watcher.run(rx));

        WatcherHandle {
            commands,
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut deadline: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        self.flush().await;
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            let Some(command) = command else {
                break;
            };

            // Link state is tracked even while invalidation is off
            match &command {
                Command::Interrupted => self.engine.set_offline(true),
                Command::Reconnected => self.engine.set_offline(false),
                _ => {}
            }

            match command {
                Command::Flush(ack) => {
                    deadline = None;
                    self.flush().await;
                    let _ = ack.send(());
                }
                Command::Shutdown => break,
                command if !self.enabled() => {
                    debug!(command = ?command, "Watcher invalidation disabled, ignoring event");
                }
                Command::Change(event) => {
                    trace!(path = %event.path, kind = ?event.kind, "Change event");
                    self.batch.add_event(&event);
                    deadline = self.schedule().await;
                }
                Command::Git(operation) => {
                    if operation.requires_clear() {
                        info!(op = %operation.op, "Git operation with unbounded scope, clearing cache");
                        deadline = None;
                        self.clear().await;
                    } else {
                        let paths = operation.paths.unwrap_or_default();
                        debug!(op = %operation.op, paths = paths.len(), "Git operation");
                        for path in &paths {
                            self.batch.add_hierarchy(path);
                        }
                        deadline = self.schedule().await;
                    }
                }
                Command::Package(op) => {
                    info!(op = %op, "Package operation, clearing cache");
                    deadline = None;
                    self.clear().await;
                }
                Command::Interrupted => {
                    warn!("Change stream interrupted, cache will be cleared on reconnect");
                    self.interrupted = true;
                }
                Command::Reconnected => {
                    if self.interrupted || self.config.clear_on_reconnect_always {
                        info!("Change stream reconnected, clearing cache");
                        self.interrupted = false;
                        deadline = None;
                        self.clear().await;
                    } else {
                        debug!("Change stream reconnected");
                    }
                }
            }
        }

        // Invalidations already received are still applied
        self.flush().await;
        info!("Change watcher stopped");
    }

    fn enabled(&self) -> bool {
        self.engine.config().enable_watcher_invalidation
    }

    /// Restart the debounce window, or flush now if the batch is full
    async fn schedule(&mut self) -> Option<Instant> {
        if self.batch.len() >= self.config.max_batch {
            debug!(pending = self.batch.len(), "Batch full, flushing early");
            self.flush().await;
            return None;
        }
        Some(Instant::now() + self.config.debounce)
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let events = self.batch.event_count();
        let plan = self.batch.drain();

        debug!(events = events, operations = plan.len(), "Applying invalidation batch");

        for op in plan {
            match op {
                Invalidation::Exact(path) => self.engine.invalidate(&path).await,
                Invalidation::Hierarchy(path) => self.engine.invalidate_hierarchy(&path).await,
            }
        }
    }

    async fn clear(&mut self) {
        self.batch.discard();
        self.engine.clear().await;
    }
}

/// Entry point for change notifications
///
/// Every method is non-blocking; the worker applies events in order.
pub struct WatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherHandle {
    fn send(&self, command: Command) {
        send(&self.commands, command);
    }

    pub fn on_change(&self, event: ChangeEvent) {
        self.send(Command::Change(event));
    }

    pub fn on_git_operation(&self, op: &str, paths: Option<Vec<String>>) {
        self.send(Command::Git(GitOperation::new(op, paths)));
    }

    pub fn on_package_operation(&self, op: &str) {
        self.send(Command::Package(op.to_string()));
    }

    pub fn on_stream_interrupted(&self) {
        self.send(Command::Interrupted);
    }

    pub fn on_reconnect(&self) {
        self.send(Command::Reconnected);
    }

    /// Apply everything queued so far, including the pending batch
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Flush(ack));
        let _ = done.await;
    }

    /// Stop the worker and wait for it to finish
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Change watcher task failed");
            }
        }
    }

    /// Feed the watcher from a remote event stream
    ///
    /// The stream closing counts as an interruption.
    pub fn spawn_stream_listener(&self, mut events: mpsc::Receiver<RemoteEvent>) -> JoinHandle<()> {
        let commands = self.commands.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let command = match event {
                    RemoteEvent::Change(event) => Command::Change(event),
                    RemoteEvent::GitOperation { op, paths } => {
                        Command::Git(GitOperation::new(op, paths))
                    }
                    RemoteEvent::PackageOperation { op } => Command::Package(op),
                    RemoteEvent::StreamInterrupted => Command::Interrupted,
                    RemoteEvent::Reconnected => Command::Reconnected,
                };
                send(&commands, command);
            }
            send(&commands, Command::Interrupted);
            debug!("Remote event stream closed");
        })
    }
}

fn send(commands: &mpsc::UnboundedSender<Command>, command: Command) {
    if commands.send(command).is_err() {
        trace!("Change watcher stopped, dropping event");
    }
}
