//! The hub: one explicitly constructed context shared by every connection
//! task.
//!
//! [`Hub`] ties the front-end [`Registry`], the worker [`MachineDirectory`],
//! the action catalog and the outbound [`Outbox`] together. It also runs
//! actions. A `Run` from a front-end becomes a session and a `Request` to
//! each target machine. A supervising task then relays worker output back
//! to the front-end until every target has reported `Done` or the session
//! is cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::catalog::ActionCatalog;
use crate::directory::BroadcastReport;
use crate::machine::{validate_identifier, Machine, MachineDirectory};
use crate::protocol::{
    encode_payload, CancelActionMsg, CancelRequestMsg, CancelSessionMsg, CommandKind, DoneMsg,
    ErrorMsg, Frame, OutputMsg, RequestMsg, RunMsg, StartedMsg,
};
use crate::registry::Registry;
use crate::session::{Client, Session, SessionId, SessionReplies, SessionReply};
use crate::transport::{ConnId, Outbox, Transport};

/// Exit code reported for a machine that disconnected mid-action or could
/// not be sent the request.
pub const MACHINE_LOST_CODE: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("no machines available in group {group}")]
    NoMachines { group: String },
    #[error("front-end connection is closed")]
    ClientClosed,
    #[error("malformed payload: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] std::io::Error),
    #[error("unexpected frame: {0:?}")]
    UnexpectedFrame(CommandKind),
}

impl HubError {
    /// Machine-readable code carried in `Error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::InvalidName(_) => "invalid_name",
            HubError::NoMachines { .. } => "no_machines",
            HubError::ClientClosed => "client_closed",
            HubError::Protocol(_) => "malformed_payload",
            HubError::MalformedFrame(_) => "malformed_frame",
            HubError::UnexpectedFrame(_) => "unexpected_frame",
        }
    }
}

#[derive(Clone)]
pub struct Hub {
    registry: Registry,
    machines: MachineDirectory,
    catalog: ActionCatalog,
    outbox: Outbox,
}

impl Hub {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            registry: Registry::new(Arc::new(outbox.clone())),
            machines: MachineDirectory::new(),
            catalog: ActionCatalog::new(),
            outbox,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn machines(&self) -> &MachineDirectory {
        &self.machines
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    // ── Front-end side ─────────────────────────────────────────────

    pub fn on_frontend_connect(&self, conn: ConnId) -> Client {
        self.registry.on_frontend_connect(conn)
    }

    pub fn on_frontend_disconnect(&self, conn: ConnId) {
        self.registry.on_frontend_disconnect(conn);
    }

    pub fn begin_action(&self, client: &Client, action: &str) -> Session {
        self.registry.begin_action(client, action)
    }

    pub fn end_action(&self, session: &Session) -> bool {
        self.registry.end_action(session)
    }

    /// Cancel one of `client`'s sessions and confirm it to the front-end
    /// with a `CancelRequest` notice.
    pub fn cancel_session(&self, client: &Client, id: SessionId) -> bool {
        let Some(session) = client.get_session(id) else {
            tracing::debug!(session = %id, "cancel for unknown session");
            return false;
        };
        let cancelled = self.registry.cancel_session(client, id);
        if cancelled {
            self.registry.notify_cancelled(&session);
        }
        cancelled
    }

    pub fn cancel_action(&self, action: &str) -> usize {
        self.registry.cancel_action(action)
    }

    pub fn active_count(&self, action: &str) -> usize {
        self.registry.active_count(action)
    }

    pub fn broadcast_to_frontends(&self, header: &str, body: &[u8]) -> BroadcastReport {
        self.registry.broadcast_to_frontends(header, body)
    }

    // ── Worker side ────────────────────────────────────────────────

    pub fn on_worker_connect(&self, group: &str, nickname: &str, conn: ConnId) -> Machine {
        self.machines.register(group, nickname, conn)
    }

    pub fn on_worker_disconnect(&self, conn: ConnId) -> Option<Machine> {
        self.machines.unregister(conn)
    }

    pub fn machines_in_group(&self, group: &str) -> Vec<Machine> {
        self.machines.lookup_group(group)
    }

    // ── Frame handling ─────────────────────────────────────────────

    /// Handle one frame received from a front-end.
    pub fn handle_frontend_frame(&self, client: &Client, frame: Frame) -> Result<(), HubError> {
        match frame.kind {
            CommandKind::Run => {
                let msg: RunMsg = frame.parse_json()?;
                self.run(client, msg).map(|_| ())
            }
            CommandKind::CancelSession => {
                let msg: CancelSessionMsg = frame.parse_json()?;
                self.cancel_session(client, msg.session);
                Ok(())
            }
            CommandKind::CancelAction => {
                let msg: CancelActionMsg = frame.parse_json()?;
                let cancelled = self.cancel_action(&msg.action);
                tracing::info!(action = %msg.action, cancelled, "action cancelled by front-end");
                Ok(())
            }
            other => Err(HubError::UnexpectedFrame(other)),
        }
    }

    /// Handle one frame received from a registered worker.
    pub fn handle_worker_frame(&self, machine: &Machine, frame: Frame) -> Result<(), HubError> {
        match frame.kind {
            CommandKind::Output => {
                let mut msg: OutputMsg = frame.parse_json()?;
                msg.machine = machine.nickname.clone();
                self.route_reply(msg.session, SessionReply::Output(msg));
                Ok(())
            }
            CommandKind::Done => {
                let mut msg: DoneMsg = frame.parse_json()?;
                msg.machine = machine.nickname.clone();
                self.route_reply(msg.session, SessionReply::Done(msg));
                Ok(())
            }
            CommandKind::Error => {
                let msg: ErrorMsg = frame.parse_json()?;
                tracing::warn!(
                    group = %machine.group,
                    nickname = %machine.nickname,
                    code = %msg.code,
                    message = %msg.message,
                    "worker reported error"
                );
                Ok(())
            }
            other => Err(HubError::UnexpectedFrame(other)),
        }
    }

    /// Hand a worker reply to the session it names. Replies for sessions
    /// that are already gone are dropped.
    pub fn route_reply(&self, id: SessionId, reply: SessionReply) -> bool {
        match self.registry.find_session(id) {
            Some(session) => session.deliver(reply),
            None => {
                tracing::debug!(session = %id, "reply for unknown session dropped");
                false
            }
        }
    }

    /// Send an `Error` frame, best effort.
    pub fn report_error(&self, conn: ConnId, error: &HubError) {
        let msg = ErrorMsg {
            code: error.code().to_string(),
            message: error.to_string(),
        };
        self.send_msg(conn, CommandKind::Error, &msg);
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Start `msg.action` on the machines of `msg.group` for `client`.
    ///
    /// Fails without creating a session when the names are invalid or no
    /// machine matches. On success the front-end has been sent `Started`
    /// and each target a `Request`, and a supervising task owns the session
    /// until it finishes or is cancelled.
    pub fn run(&self, client: &Client, msg: RunMsg) -> Result<Session, HubError> {
        validate_identifier("group", &msg.group).map_err(HubError::InvalidName)?;
        validate_identifier("action", &msg.action).map_err(HubError::InvalidName)?;

        let mut targets = self.machines_in_group(&msg.group);
        if let Some(ref nickname) = msg.machine {
            targets.retain(|m| &m.nickname == nickname);
        }
        if targets.is_empty() {
            return Err(HubError::NoMachines { group: msg.group });
        }

        let session = self.begin_action(client, &msg.action);
        if session.is_cancelled() {
            return Err(HubError::ClientClosed);
        }
        let Some(replies) = session.take_replies() else {
            self.end_action(&session);
            return Err(HubError::ClientClosed);
        };

        self.send_msg(
            session.connection,
            CommandKind::Started,
            &StartedMsg {
                session: session.id,
                action: msg.action.clone(),
                machines: targets.iter().map(|m| m.nickname.clone()).collect(),
            },
        );

        let request = RequestMsg {
            session: session.id,
            action: msg.action.clone(),
            args: msg.args,
        };
        let mut pending = HashMap::new();
        let mut lost = Vec::new();
        for machine in targets {
            if self.send_msg(machine.connection, CommandKind::Request, &request) {
                pending.insert(machine.nickname.clone(), machine);
            } else {
                lost.push(machine.nickname);
            }
        }
        tracing::info!(
            session = %session.id,
            action = %msg.action,
            group = %msg.group,
            machines = pending.len(),
            "action dispatched"
        );

        let supervisor = Supervisor {
            hub: self.clone(),
            session: session.clone(),
            pending,
            exit_code: if lost.is_empty() { 0 } else { MACHINE_LOST_CODE },
        };
        tokio::spawn(supervisor.run(replies));
        Ok(session)
    }

    /// Serialize and send, logging failures. Returns whether the frame was
    /// queued.
    fn send_msg<T: Serialize>(&self, conn: ConnId, kind: CommandKind, msg: &T) -> bool {
        let payload: Bytes = match encode_payload(msg) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(?kind, error = %e, "failed to encode frame");
                return false;
            }
        };
        match self.outbox.send(conn, kind, payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%conn, ?kind, error = %e, "delivery failed");
                false
            }
        }
    }
}

/// Owns one running session: relays its worker replies and finishes or
/// cancels it.
struct Supervisor {
    hub: Hub,
    session: Session,
    /// Targets that have not reported `Done`, by nickname.
    pending: HashMap<String, Machine>,
    exit_code: i32,
}

impl Supervisor {
    async fn run(mut self, mut replies: SessionReplies) {
        for machine in self.pending.values() {
            self.watch_machine(machine.clone());
        }

        while !self.pending.is_empty() {
            tokio::select! {
                _ = self.session.cancelled.cancelled() => {
                    self.notify_workers();
                    return;
                }
                reply = replies.recv() => match reply {
                    Some(SessionReply::Output(msg)) => self.forward_output(msg),
                    Some(SessionReply::Done(msg)) => self.machine_done(msg),
                    None => return,
                },
            }
        }

        if self.hub.end_action(&self.session) {
            self.hub.send_msg(
                self.session.connection,
                CommandKind::Done,
                &DoneMsg {
                    session: self.session.id,
                    machine: String::new(),
                    code: self.exit_code,
                },
            );
            tracing::info!(session = %self.session.id, code = self.exit_code, "action finished");
        }
    }

    /// Turn a target's disconnect into a `Done` for this session.
    fn watch_machine(&self, machine: Machine) {
        let session = self.session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = machine.disconnected.cancelled() => {
                    session.deliver(SessionReply::Done(DoneMsg {
                        session: session.id,
                        machine: machine.nickname.clone(),
                        code: MACHINE_LOST_CODE,
                    }));
                }
                _ = session.cancelled.cancelled() => {}
            }
        });
    }

    fn forward_output(&self, msg: OutputMsg) {
        if !self.pending.contains_key(&msg.machine) {
            tracing::debug!(session = %self.session.id, machine = %msg.machine, "output from non-target dropped");
            return;
        }
        self.hub
            .send_msg(self.session.connection, CommandKind::Output, &msg);
    }

    fn machine_done(&mut self, msg: DoneMsg) {
        if self.pending.remove(&msg.machine).is_none() {
            return;
        }
        tracing::debug!(session = %self.session.id, machine = %msg.machine, code = msg.code, "machine done");
        if self.exit_code == 0 && msg.code != 0 {
            self.exit_code = msg.code;
        }
    }

    /// Tell every still-running, still-connected target to stop.
    fn notify_workers(&self) {
        let notice = CancelRequestMsg {
            session: self.session.id,
        };
        for machine in self.pending.values() {
            if machine.is_connected() {
                self.hub
                    .send_msg(machine.connection, CommandKind::CancelRequest, &notice);
            }
        }
        tracing::info!(session = %self.session.id, machines = self.pending.len(), "session cancelled, workers notified");
    }
}
