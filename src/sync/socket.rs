//! Multi-process broadcaster over a Unix domain socket
//!
//! One process runs a [`BroadcastHub`]; every cache context connects a
//! [`SocketBroadcaster`] to it. The hub relays each newline-delimited JSON
//! message to every peer except the sender.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{parse_message, serialize_message, SyncMessage};
use super::{Broadcaster, CHANNEL_CAPACITY};
use crate::error::CacheError;

/// Outgoing queues of connected peers, by peer id
type PeerMap = Arc<RwLock<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Relay that fans messages out between connected cache contexts
pub struct BroadcastHub {
    /// Socket file the hub listens on
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Connected peers
    peers: PeerMap,
    /// Next peer id
    next_peer: Arc<AtomicU64>,
}

impl BroadcastHub {
    /// Create a hub for `socket_path` (not yet listening)
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            listener: None,
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_peer: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Bind the socket
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket: {:?}", self.socket_path))?;

        info!(socket_path = %self.socket_path.display(), "Broadcast hub started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the accept loop
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Hub not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let peers = Arc::clone(&self.peers);
                    let peer_id = self.next_peer.fetch_add(1, Ordering::Relaxed);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_id, peers).await {
                            error!(peer = peer_id, error = %e, "Broadcast peer error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Remove the socket file
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("Broadcast hub stopped");
        Ok(())
    }

    /// Number of connected peers
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Relay messages from one peer to all others
async fn handle_connection(stream: UnixStream, peer_id: u64, peers: PeerMap) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    {
        let mut peers = peers.write().await;
        peers.insert(peer_id, tx);
        debug!(peer = peer_id, count = peers.len(), "Peer connected");
    }

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                warn!(peer = peer_id, error = %e, "Failed to forward message");
                break;
            }
        }
    });

    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(peer = peer_id, "Connection closed by peer");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                // Re-serialize so only well-formed messages are relayed
                let bytes = match parse_message(trimmed.as_bytes()).and_then(|m| serialize_message(&m)) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(peer = peer_id, error = %e, "Dropping malformed message");
                        continue;
                    }
                };

                let peers = peers.read().await;
                for (id, queue) in peers.iter() {
                    if *id != peer_id {
                        let _ = queue.send(bytes.clone());
                    }
                }
            }
            Err(e) => {
                error!(peer = peer_id, error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut peers = peers.write().await;
        peers.remove(&peer_id);
        debug!(peer = peer_id, count = peers.len(), "Peer disconnected");
    }
    writer_task.abort();

    Ok(())
}

/// Origin of the clear injected when the hub connection is lost
const HUB_ORIGIN: &str = "broadcast-hub";

/// Broadcaster connected to a [`BroadcastHub`]
pub struct SocketBroadcaster {
    writer: Mutex<OwnedWriteHalf>,
    sender: broadcast::Sender<SyncMessage>,
    reader_task: JoinHandle<()>,
}

impl SocketBroadcaster {
    /// Connect to the hub listening on `socket_path`
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to broadcast hub: {:?}", socket_path))?;
        let (reader, writer) = stream.into_split();
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        let inbound = sender.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_message(line.trim().as_bytes()) {
                        Ok(message) => {
                            let _ = inbound.send(message);
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed broadcast"),
                    },
                    Ok(None) => {
                        warn!("Broadcast hub closed the connection, clearing");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Broadcast hub read failed, clearing");
                        break;
                    }
                }
            }
            // Invalidations sent from now on are lost to this subscriber
            let _ = inbound.send(SyncMessage::clear(HUB_ORIGIN));
        });

        info!(socket_path = %socket_path.display(), "Connected to broadcast hub");

        Ok(Self {
            writer: Mutex::new(writer),
            sender,
            reader_task,
        })
    }
}

#[async_trait]
impl Broadcaster for SocketBroadcaster {
    async fn publish(&self, message: SyncMessage) -> crate::error::Result<()> {
        let bytes = serialize_message(&message)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| CacheError::Broadcast(e.to_string()))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<SyncMessage>> {
        Some(self.sender.subscribe())
    }
}

impl Drop for SocketBroadcaster {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
