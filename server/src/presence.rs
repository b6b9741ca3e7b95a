use delivery_api::ServerFrame;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Sending half of one live connection. Cloning yields another handle to the
/// same connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: UnboundedSender<ServerFrame>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver the connection task drains.
    pub fn new() -> (Self, UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Hand a frame to the connection. False if the connection is already gone.
    pub fn deliver(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Maps a user to at most one live connection. Last connection wins.
#[derive(Default)]
pub struct PresenceRegistry {
    live: Mutex<HashMap<String, ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the handle it replaced, if any.
    pub fn connect(&self, user_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self.live.lock().insert(user_id.to_string(), handle);
        if let Some(prev) = &previous {
            tracing::debug!(user_id, connection = %prev.id, "superseding live connection");
        }
        previous
    }

    /// Remove the mapping only if it still points at `connection_id`.
    /// Returns true when the user went offline.
    pub fn disconnect(&self, user_id: &str, connection_id: Uuid) -> bool {
        let mut guard = self.live.lock();
        match guard.get(user_id) {
            Some(current) if current.id == connection_id => {
                guard.remove(user_id);
                true
            }
            Some(_) => {
                tracing::debug!(user_id, connection = %connection_id, "ignoring stale disconnect");
                false
            }
            None => false,
        }
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.live.lock().get(user_id).cloned()
    }

    pub fn online_count(&self) -> usize {
        self.live.lock().len()
    }
}
