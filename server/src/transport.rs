//! Delivery of serialized events to individual players
//!
//! The lobby engine calls [`Transport::send`] while holding its own lock, so
//! implementations must never block and never call back into a lobby. Both
//! implementations here only push into a queue.

use crate::error::TransportError;
use log::debug;
use parking_lot::Mutex;
use shared::{PlayerId, ServerEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

pub trait Transport: Send + Sync {
    /// Queues an already serialized message for one player.
    fn send(&self, player: PlayerId, message: Arc<str>) -> Result<(), TransportError>;

    /// Drops the player's live connection, if any.
    fn close(&self, player: PlayerId);
}

/// Records everything that was sent. Used to observe lobbies in tests.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(PlayerId, Arc<str>)>>,
    closed: Mutex<Vec<PlayerId>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_for(&self, player: PlayerId) -> Vec<Arc<str>> {
        self.sent
            .lock()
            .iter()
            .filter(|(recipient, _)| *recipient == player)
            .map(|(_, message)| Arc::clone(message))
            .collect()
    }

    /// Messages for `player`, parsed back into events. Unparseable messages
    /// are skipped.
    pub fn events_for(&self, player: PlayerId) -> Vec<ServerEvent> {
        self.messages_for(player)
            .iter()
            .filter_map(|message| serde_json::from_str(message).ok())
            .collect()
    }

    pub fn total_sent(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn closed(&self) -> Vec<PlayerId> {
        self.closed.lock().clone()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, player: PlayerId, message: Arc<str>) -> Result<(), TransportError> {
        self.sent.lock().push((player, message));
        Ok(())
    }

    fn close(&self, player: PlayerId) {
        self.closed.lock().push(player);
    }
}

struct ConnectionHandle {
    id: u64,
    sender: mpsc::UnboundedSender<Arc<str>>,
    closed: Arc<Notify>,
}

/// Receiving half of a registered connection, owned by its network tasks.
pub struct Connection {
    pub id: u64,
    pub outbound: mpsc::UnboundedReceiver<Arc<str>>,
    /// Notified when the server wants the connection gone (kick, replacement
    /// by a newer connection, shutdown).
    pub closed: Arc<Notify>,
}

/// Transport backed by one unbounded queue per player. A writer task per
/// connection drains the queue into the socket.
#[derive(Default)]
pub struct ChannelTransport {
    connections: Mutex<HashMap<PlayerId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection for `player`, replacing and closing any
    /// previous one.
    pub fn register(&self, player: PlayerId) -> Connection {
        let (sender, outbound) = mpsc::unbounded_channel();
        let closed = Arc::new(Notify::new());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let previous = self.connections.lock().insert(
            player,
            ConnectionHandle {
                id,
                sender,
                closed: Arc::clone(&closed),
            },
        );
        if let Some(previous) = previous {
            debug!("Replacing connection {} of player {}", previous.id, player);
            previous.closed.notify_one();
        }

        Connection {
            id,
            outbound,
            closed,
        }
    }

    /// Removes the connection if it is still the current one for `player`.
    /// Returns false if a newer connection took over in the meantime.
    pub fn unregister(&self, player: PlayerId, connection_id: u64) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(&player) {
            Some(handle) if handle.id == connection_id => {
                connections.remove(&player);
                true
            }
            _ => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, player: PlayerId, message: Arc<str>) -> Result<(), TransportError> {
        let connections = self.connections.lock();
        let handle = connections
            .get(&player)
            .ok_or(TransportError::NotConnected(player))?;
        handle
            .sender
            .send(message)
            .map_err(|_| TransportError::ChannelClosed(player))
    }

    fn close(&self, player: PlayerId) {
        // Stays registered until the reader task unregisters, so the
        // disconnect is still reported to the lobby.
        if let Some(handle) = self.connections.lock().get(&player) {
            handle.closed.notify_one();
        }
    }
}
