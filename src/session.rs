use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{DoneMsg, OutputMsg};
use crate::transport::ConnId;

/// Capacity of a session's output channel. Output arriving while it is
/// full is dropped so a worker reader never waits on a slow session.
/// Completions travel on a separate unbounded channel and are never dropped.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Process-wide session id counter. Ids are never reused.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one outstanding action request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker message addressed to a session.
#[derive(Debug, Clone)]
pub enum SessionReply {
    Output(OutputMsg),
    Done(DoneMsg),
}

/// Receiving half of a session's replies.
///
/// Queued output is always yielded before a completion. A worker's output
/// is queued before its `Done`, so the last output reaches the consumer
/// before the target is marked finished.
#[derive(Debug)]
pub struct SessionReplies {
    output: mpsc::Receiver<OutputMsg>,
    done: mpsc::UnboundedReceiver<DoneMsg>,
}

impl SessionReplies {
    pub async fn recv(&mut self) -> Option<SessionReply> {
        tokio::select! {
            biased;
            Some(msg) = self.output.recv() => Some(SessionReply::Output(msg)),
            Some(msg) = self.done.recv() => Some(SessionReply::Done(msg)),
            else => None,
        }
    }
}

/// One outstanding action request from a front-end.
///
/// Cloning is cheap and every clone refers to the same session: the
/// cancellation token and reply channel are shared.
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    /// The owning front-end's connection. Also the key of the owning
    /// [`Client`] in the client directory.
    pub connection: ConnId,
    /// Name of the action this session runs.
    pub action: Arc<str>,
    /// Fires once when the session is removed from its client's table,
    /// whether by completion, cancellation, or disconnect.
    pub cancelled: CancellationToken,
    output_tx: mpsc::Sender<OutputMsg>,
    done_tx: mpsc::UnboundedSender<DoneMsg>,
    replies: Arc<Mutex<Option<SessionReplies>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("action", &self.action)
            .field("cancelled", &self.cancelled.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(connection: ConnId, action: &str) -> Self {
        let (output_tx, output) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (done_tx, done) = mpsc::unbounded_channel();
        Self {
            id: SessionId::next(),
            connection,
            action: Arc::from(action),
            cancelled: CancellationToken::new(),
            output_tx,
            done_tx,
            replies: Arc::new(Mutex::new(Some(SessionReplies { output, done }))),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Hand a worker reply to whoever consumes this session's replies.
    ///
    /// Returns `false` if the reply was dropped: output while the channel is
    /// full, or anything once the consumer has gone away. A `Done` is never
    /// dropped while the consumer is alive.
    pub fn deliver(&self, reply: SessionReply) -> bool {
        match reply {
            SessionReply::Output(msg) => match self.output_tx.try_send(msg) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session = %self.id, "session output channel full, dropping output");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(session = %self.id, "session reply consumer gone");
                    false
                }
            },
            SessionReply::Done(msg) => {
                if self.done_tx.send(msg).is_err() {
                    tracing::debug!(session = %self.id, "session reply consumer gone");
                    return false;
                }
                true
            }
        }
    }

    /// Take the reply receiver. There is a single consumer per session;
    /// later calls return `None`.
    pub fn take_replies(&self) -> Option<SessionReplies> {
        self.replies.lock().take()
    }

    #[cfg(test)]
    fn same_as(&self, other: &Session) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.replies, &other.replies)
    }
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    /// Set by `teardown`. A closed table accepts no new sessions.
    closed: bool,
}

/// One connected front-end and the table of sessions it owns.
#[derive(Clone)]
pub struct Client {
    conn: ConnId,
    table: Arc<RwLock<SessionTable>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.conn)
            .field("sessions", &self.len())
            .finish()
    }
}

impl Client {
    pub fn new(conn: ConnId) -> Self {
        Self {
            conn,
            table: Arc::new(RwLock::new(SessionTable::default())),
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// Create a session for `action` with a fresh id and cancellation
    /// token, and insert it into this client's table.
    ///
    /// After `teardown` the session is still returned but is born cancelled
    /// and never enters the table.
    pub fn add_session(&self, action: &str) -> Session {
        let session = Session::new(self.conn, action);
        let mut table = self.table.write();
        if table.closed {
            session.cancelled.cancel();
        } else {
            table.sessions.insert(session.id, session.clone());
        }
        session
    }

    /// Remove a session, firing its cancellation token.
    ///
    /// Returns the removed session, or `None` if it was already gone. Only
    /// the caller that gets `Some` has fired the token.
    pub fn remove_session(&self, id: SessionId) -> Option<Session> {
        let removed = self.table.write().sessions.remove(&id);
        if let Some(ref session) = removed {
            session.cancelled.cancel();
        }
        removed
    }

    pub fn get_session(&self, id: SessionId) -> Option<Session> {
        self.table.read().sessions.get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.table.read().sessions.contains_key(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.table.read().sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and cancel every session this client owns.
    ///
    /// The table is drained under one write lock, so a concurrent
    /// `remove_session` for the same id either wins before the drain (and the
    /// drain never sees it) or finds nothing afterwards.
    pub fn teardown(&self) -> Vec<Session> {
        let drained: Vec<Session> = {
            let mut table = self.table.write();
            table.closed = true;
            table.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.cancelled.cancel();
        }
        drained
    }
}
