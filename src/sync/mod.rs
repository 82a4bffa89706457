//! Cross-context invalidation
//!
//! Sibling cache engines of the same client (several windows, several
//! processes) replicate invalidation commands through a [`Broadcaster`].
//! Payloads are never broadcast, and delivery is best effort: a missed
//! message is repaired by TTL expiry or the next explicit refresh.

pub mod protocol;
#[cfg(unix)]
pub mod socket;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{CacheError, Result};

pub use protocol::{SyncMessage, SyncOp};
#[cfg(unix)]
pub use socket::{BroadcastHub, SocketBroadcaster};

/// Capacity of in-process fan-out channels
pub(crate) const CHANNEL_CAPACITY: usize = 1024;

/// Publish/subscribe channel for invalidation commands
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Send a message to every other context (fire-and-forget)
    async fn publish(&self, message: SyncMessage) -> Result<()>;

    /// Receive messages from other contexts, `None` if nothing is ever received
    fn subscribe(&self) -> Option<broadcast::Receiver<SyncMessage>>;
}

/// Broadcaster for single-process deployments
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBroadcaster;

#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn publish(&self, message: SyncMessage) -> Result<()> {
        trace!(op = ?message.op, "Dropping broadcast (no sibling contexts)");
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<SyncMessage>> {
        None
    }
}

/// In-process fan-out between engines sharing one process
///
/// Clones share the same channel. Every subscriber sees every message,
/// including its own; receivers filter by `origin`.
#[derive(Debug, Clone)]
pub struct LocalBroadcaster {
    sender: broadcast::Sender<SyncMessage>,
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl Default for LocalBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn publish(&self, message: SyncMessage) -> Result<()> {
        // No receivers is not an error: there may simply be no siblings yet
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|e| CacheError::Broadcast(e.to_string()))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<SyncMessage>> {
        Some(self.sender.subscribe())
    }
}
