//! Outbound delivery to connected front-ends and workers.
//!
//! Registry code never writes to a socket directly. It addresses a
//! connection by its [`ConnId`] and hands a frame to a [`Transport`]; the
//! production transport ([`Outbox`]) queues the frame on that connection's
//! bounded channel, and the connection's writer task drains it onto the wire.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::{CommandKind, Frame};

/// Default number of frames a single connection may have queued.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Opaque handle for one accepted connection (front-end or worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnId {
    fn from(raw: u64) -> Self {
        ConnId(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection not attached: {0}")]
    NotConnected(ConnId),
    #[error("outbound queue full: {0}")]
    Backpressure(ConnId),
    #[error("connection closed: {0}")]
    Closed(ConnId),
}

/// Sends one command to one connection.
///
/// Implementations must not block: callers invoke this from connection
/// tasks, including while iterating a broadcast snapshot.
pub trait Transport: Send + Sync {
    fn send(&self, conn: ConnId, kind: CommandKind, payload: Bytes) -> Result<(), DeliveryError>;
}

/// Per-connection bounded outbound queues.
#[derive(Clone)]
pub struct Outbox {
    queues: Arc<RwLock<HashMap<ConnId, mpsc::Sender<Frame>>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    /// Allocate a handle for a newly accepted connection.
    ///
    /// The caller's writer task owns the returned receiver and writes every
    /// frame it yields to the socket. Handles are never reused.
    pub fn attach(&self) -> (ConnId, mpsc::Receiver<Frame>) {
        let conn = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);
        self.queues.write().insert(conn, tx);
        (conn, rx)
    }

    /// Drop the queue for `conn`. Frames already queued are still drained by
    /// the writer task; later sends fail with `NotConnected`.
    pub fn detach(&self, conn: ConnId) {
        self.queues.write().remove(&conn);
    }

    #[cfg(test)]
    fn is_attached(&self, conn: ConnId) -> bool {
        self.queues.read().contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for Outbox {
    fn send(&self, conn: ConnId, kind: CommandKind, payload: Bytes) -> Result<(), DeliveryError> {
        // Clone the sender so the map lock is not held across try_send.
        let tx = self
            .queues
            .read()
            .get(&conn)
            .cloned()
            .ok_or(DeliveryError::NotConnected(conn))?;
        match tx.try_send(Frame::new(kind, payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::Backpressure(conn)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed(conn)),
        }
    }
}
