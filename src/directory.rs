use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::protocol::CommandKind;
use crate::session::{Client, Session};
use crate::transport::{ConnId, DeliveryError, Transport};

/// Outcome of a broadcast to every connected front-end.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<(ConnId, DeliveryError)>,
}

/// Maps a front-end connection to its [`Client`].
#[derive(Clone, Default)]
pub struct ClientDirectory {
    clients: Arc<RwLock<HashMap<ConnId, Client>>>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client for a freshly accepted connection.
    ///
    /// Handles are expected to be fresh. If `conn` is already registered the
    /// new client replaces the old one.
    pub fn add(&self, conn: ConnId) -> Client {
        let client = Client::new(conn);
        if self.clients.write().insert(conn, client.clone()).is_some() {
            tracing::warn!(%conn, "front-end connection registered twice, replacing client");
        }
        client
    }

    pub fn get(&self, conn: ConnId) -> Option<Client> {
        self.clients.read().get(&conn).cloned()
    }

    /// Unregister a client and tear down all of its sessions.
    ///
    /// The entry leaves the directory before teardown starts, so no reader
    /// ever routes to a client whose table is being drained. Returns the
    /// sessions that were still live, or an empty vec if `conn` was unknown.
    pub fn remove(&self, conn: ConnId) -> Vec<Session> {
        let removed = self.clients.write().remove(&conn);
        match removed {
            Some(client) => client.teardown(),
            None => Vec::new(),
        }
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.clients.read().contains_key(&conn)
    }

    pub fn connections(&self) -> Vec<ConnId> {
        self.clients.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send one command to every registered client.
    ///
    /// Works on a snapshot of the connections taken under the read lock; the
    /// lock is released before the first send. A failed send is logged and
    /// reported but neither stops the broadcast nor unregisters the client.
    pub fn broadcast(
        &self,
        transport: &dyn Transport,
        kind: CommandKind,
        payload: Bytes,
    ) -> BroadcastReport {
        let targets = self.connections();
        let mut report = BroadcastReport::default();
        for conn in targets {
            match transport.send(conn, kind, payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(%conn, error = %e, "broadcast delivery failed");
                    report.failed.push((conn, e));
                }
            }
        }
        tracing::debug!(
            delivered = report.delivered,
            failed = report.failed.len(),
            "broadcast finished"
        );
        report
    }
}
