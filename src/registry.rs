//! Front-end side bookkeeping: which client owns which session, and which
//! sessions are running which action.
//!
//! Three tables are involved and each has its own lock:
//!
//! - the [`ClientDirectory`] (connection -> client) plus one table per client
//!   (session id -> session),
//! - the [`ActionIndex`] (action name -> sessions),
//! - the owner table (session id -> owning connection), used to route worker
//!   replies that only carry a session id.
//!
//! No method holds two of these locks at once. The tables may disagree for
//! a moment (a session removed from its client but still indexed, or the
//! reverse); every path that removes a session also calls [`Registry::release`]
//! so the disagreement never outlives the call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::action_index::ActionIndex;
use crate::directory::{BroadcastReport, ClientDirectory};
use crate::protocol::{encode_payload, BroadcastMsg, CancelRequestMsg, CommandKind};
use crate::session::{Client, Session, SessionId};
use crate::transport::{ConnId, Transport};

#[derive(Clone)]
pub struct Registry {
    clients: ClientDirectory,
    actions: ActionIndex,
    owners: Arc<RwLock<HashMap<SessionId, ConnId>>>,
    transport: Arc<dyn Transport>,
}

impl Registry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            clients: ClientDirectory::new(),
            actions: ActionIndex::new(),
            owners: Arc::new(RwLock::new(HashMap::new())),
            transport,
        }
    }

    pub fn clients(&self) -> &ClientDirectory {
        &self.clients
    }

    pub fn actions(&self) -> &ActionIndex {
        &self.actions
    }

    pub fn on_frontend_connect(&self, conn: ConnId) -> Client {
        tracing::debug!(%conn, "front-end connected");
        self.clients.add(conn)
    }

    /// Unregister a front-end and cancel every session it still owns.
    /// Returns how many sessions were torn down.
    pub fn on_frontend_disconnect(&self, conn: ConnId) -> usize {
        let sessions = self.clients.remove(conn);
        for session in &sessions {
            self.release(session);
        }
        tracing::debug!(%conn, sessions = sessions.len(), "front-end disconnected");
        sessions.len()
    }

    pub fn client(&self, conn: ConnId) -> Option<Client> {
        self.clients.get(conn)
    }

    /// Create a session on `client` and index it under `action`.
    ///
    /// If the client has already been torn down the returned session is
    /// cancelled and tracked nowhere.
    pub fn begin_action(&self, client: &Client, action: &str) -> Session {
        let session = client.add_session(action);
        if session.is_cancelled() {
            tracing::debug!(conn = %client.conn(), action, "action begun on a closed client");
            return session;
        }
        self.owners.write().insert(session.id, client.conn());
        self.actions.record(action, &session);

        // A teardown that drained the table before `record` released its
        // copy before our entry existed; drop the entry ourselves.
        if !client.contains(session.id) {
            self.release(&session);
        }
        tracing::debug!(session = %session.id, action, "action begun");
        session
    }

    /// Normal completion. Returns `false` if the session had already been
    /// cancelled or torn down.
    pub fn end_action(&self, session: &Session) -> bool {
        let removed = self
            .clients
            .get(session.connection)
            .and_then(|client| client.remove_session(session.id))
            .is_some();
        self.release(session);
        removed
    }

    /// Cancel one session of `client`. Unknown ids are a no-op.
    pub fn cancel_session(&self, client: &Client, id: SessionId) -> bool {
        match client.remove_session(id) {
            Some(session) => {
                self.release(&session);
                tracing::info!(session = %id, action = %session.action, "session cancelled");
                true
            }
            None => {
                tracing::debug!(session = %id, "cancel for unknown session");
                false
            }
        }
    }

    /// Cancel every session currently running `action`.
    ///
    /// Works on a snapshot of the index: sessions that begin after the
    /// snapshot are left running. Each snapshotted session's front-end is sent
    /// a cancel notice, then the session is removed. The removal happens even
    /// if the notice could not be delivered. Returns how many sessions this
    /// call removed; sessions that finished concurrently are not counted.
    pub fn cancel_action(&self, action: &str) -> usize {
        let snapshot = self.actions.snapshot(action);
        let mut cancelled = 0;
        for session in snapshot {
            tracing::info!(action, session = %session.id, "cancel");
            self.notify_cancelled(&session);

            let removed = self
                .clients
                .get(session.connection)
                .and_then(|client| client.remove_session(session.id));
            self.release(&session);
            if removed.is_some() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Number of sessions currently running `action`.
    pub fn active_count(&self, action: &str) -> usize {
        self.actions.active_count(action)
    }

    /// Look a live session up by id alone.
    pub fn find_session(&self, id: SessionId) -> Option<Session> {
        let owner = self.owners.read().get(&id).copied()?;
        self.clients.get(owner)?.get_session(id)
    }

    pub fn broadcast_to_frontends(&self, header: &str, body: &[u8]) -> BroadcastReport {
        let msg = BroadcastMsg {
            header: header.to_string(),
            body: body.to_vec(),
        };
        match encode_payload(&msg) {
            Ok(payload) => {
                tracing::info!(header, clients = self.clients.len(), "begin broadcast");
                self.clients
                    .broadcast(self.transport.as_ref(), CommandKind::Broadcast, payload)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast");
                BroadcastReport::default()
            }
        }
    }

    /// Send `CancelRequest{session}` to the session's front-end, best effort.
    pub fn notify_cancelled(&self, session: &Session) {
        let payload = match encode_payload(&CancelRequestMsg { session: session.id }) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(session = %session.id, error = %e, "failed to encode cancel notice");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .send(session.connection, CommandKind::CancelRequest, payload)
        {
            tracing::warn!(session = %session.id, error = %e, "cancel notice not delivered");
        }
    }

    /// Drop `session` from the action index and owner table.
    fn release(&self, session: &Session) {
        self.actions.forget(&session.action, session.id);
        self.owners.write().remove(&session.id);
    }

    /// Number of sessions reachable by id. Used to check that every removal
    /// path cleaned up after itself.
    pub fn tracked_sessions(&self) -> usize {
        self.owners.read().len()
    }
}
