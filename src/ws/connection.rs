//! Connection handles shared by rooms, the competition, and the socket tasks

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::ServerMsg;

pub type ConnectionId = Uuid;

/// Outbound queue depth per connection
pub const OUTBOUND_CAPACITY: usize = 256;

/// Close code: registration refused
pub const CLOSE_NOT_ACCEPTING: u16 = 4003;
/// Close code: knocked out of the competition
pub const CLOSE_ELIMINATED: u16 = 4000;
/// Close code: competition was reset
pub const CLOSE_RESET: u16 = 4001;

#[derive(Debug)]
pub enum Outbound {
    Msg(ServerMsg),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone)]
struct CloseRequest {
    code: u16,
    reason: String,
}

/// Non-owning handle to a client connection. Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMsg>,
    /// Kept off the message queue so a full queue cannot swallow it
    close_tx: Arc<watch::Sender<Option<CloseRequest>>>,
}

impl ConnectionHandle {
    pub fn new(capacity: usize) -> (Self, Outbox) {
        let (tx, queue) = mpsc::channel(capacity);
        let (close_tx, close) = watch::channel(None);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
                close_tx: Arc::new(close_tx),
            },
            Outbox {
                queue,
                close,
                close_taken: false,
            },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message without waiting. Returns false if it was dropped.
    pub fn send(&self, msg: ServerMsg) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "Outbound queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn_id = %self.id, "Connection gone, dropping message");
                false
            }
        }
    }

    /// Ask the socket task to close with the given code once queued messages
    /// are flushed. The first request wins.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        self.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(CloseRequest { code, reason });
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side of a connection, owned by its socket task
#[derive(Debug)]
pub struct Outbox {
    queue: mpsc::Receiver<ServerMsg>,
    close: watch::Receiver<Option<CloseRequest>>,
    close_taken: bool,
}

impl Outbox {
    /// Next queued message, or the close request once the queue is empty
    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        match self.queue.try_recv() {
            Ok(msg) => Ok(Outbound::Msg(msg)),
            Err(err) => self.take_close().ok_or(err),
        }
    }

    /// Wait for the next message or close request. Cancel safe.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            if let Ok(out) = self.try_recv() {
                return Some(out);
            }
            tokio::select! {
                biased;
                msg = self.queue.recv() => match msg {
                    Some(msg) => return Some(Outbound::Msg(msg)),
                    None => return self.take_close(),
                },
                changed = self.close.changed() => {
                    if changed.is_err() {
                        return self.take_close();
                    }
                }
            }
        }
    }

    fn take_close(&mut self) -> Option<Outbound> {
        if self.close_taken {
            return None;
        }
        let req = self.close.borrow_and_update().clone()?;
        self.close_taken = true;
        Some(Outbound::Close {
            code: req.code,
            reason: req.reason,
        })
    }
}

/// Every live connection, for server-wide announcements
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: ConnectionHandle) {
        self.connections.insert(conn.id(), conn);
    }

    pub fn remove(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn broadcast(&self, msg: &ServerMsg) {
        for entry in self.connections.iter() {
            entry.value().send(msg.clone());
        }
    }
}
