use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::transport::ConnId;

/// Validate a group name or nickname. Must be 1-64 chars,
/// alphanumeric/hyphens/underscores/dots.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must not be empty"));
    }
    let chars = value.chars().count();
    if chars > 64 {
        return Err(format!("{kind} too long ({chars} chars, max 64)"));
    }
    if !value.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(format!("{kind} contains invalid characters: {value}"));
    }
    Ok(())
}

/// One connected worker.
#[derive(Debug, Clone)]
pub struct Machine {
    pub group: String,
    pub nickname: String,
    pub connection: ConnId,
    /// Fires when this machine leaves the directory, either because its
    /// connection went away or because another connection took its slot.
    pub disconnected: CancellationToken,
}

impl Machine {
    fn new(group: &str, nickname: &str, connection: ConnId) -> Self {
        Self {
            group: group.to_string(),
            nickname: nickname.to_string(),
            connection,
            disconnected: CancellationToken::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.is_cancelled()
    }
}

/// A named pool of machines, keyed by nickname.
#[derive(Debug, Default)]
pub struct Group {
    machines: HashMap<String, Machine>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn get(&self, nickname: &str) -> Option<&Machine> {
        self.machines.get(nickname)
    }

    fn insert(&mut self, machine: Machine) -> Option<Machine> {
        self.machines.insert(machine.nickname.clone(), machine)
    }

    fn remove(&mut self, nickname: &str) -> Option<Machine> {
        self.machines.remove(nickname)
    }
}

#[derive(Default)]
struct Tables {
    groups: HashMap<String, Group>,
    by_conn: HashMap<ConnId, Machine>,
}

impl Tables {
    /// Remove the `(group, nickname)` slot if it belongs to `conn`, pruning
    /// the group when it empties.
    fn remove_slot(&mut self, group: &str, nickname: &str, conn: ConnId) {
        if let Some(g) = self.groups.get_mut(group) {
            if g.get(nickname).is_some_and(|m| m.connection == conn) {
                g.remove(nickname);
            }
            if g.is_empty() {
                self.groups.remove(group);
            }
        }
    }
}

/// All connected workers, by `(group, nickname)` and by connection.
///
/// Both views live under one lock and are updated together, so a machine
/// reachable one way is always reachable the other.
#[derive(Clone, Default)]
pub struct MachineDirectory {
    inner: Arc<RwLock<Tables>>,
}

impl MachineDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker connection under `(group, nickname)`.
    ///
    /// Last registration wins. A machine already in the slot is evicted: its
    /// reverse entry is dropped and its `disconnected` token fires, so the
    /// old connection's eventual `unregister` finds nothing to remove. If
    /// `conn` was registered elsewhere, that earlier slot is released first.
    pub fn register(&self, group: &str, nickname: &str, conn: ConnId) -> Machine {
        let machine = Machine::new(group, nickname, conn);
        let mut tables = self.inner.write();

        if let Some(previous) = tables.by_conn.remove(&conn) {
            tables.remove_slot(&previous.group, &previous.nickname, conn);
            previous.disconnected.cancel();
            tracing::info!(
                %conn,
                group = %previous.group,
                nickname = %previous.nickname,
                "connection re-registered, released earlier slot"
            );
        }

        let evicted = tables
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(machine.clone());
        if let Some(old) = evicted {
            tables.by_conn.remove(&old.connection);
            old.disconnected.cancel();
            tracing::warn!(
                group,
                nickname,
                old_conn = %old.connection,
                new_conn = %conn,
                "nickname already registered, evicting previous machine"
            );
        }

        tables.by_conn.insert(conn, machine.clone());
        tracing::info!(group, nickname, %conn, "machine registered");
        machine
    }

    /// Snapshot of every machine in `group`, ordered by nickname.
    pub fn lookup_group(&self, group: &str) -> Vec<Machine> {
        let tables = self.inner.read();
        let mut machines: Vec<Machine> = tables
            .groups
            .get(group)
            .map(|g| g.machines.values().cloned().collect())
            .unwrap_or_default();
        machines.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        machines
    }

    pub fn lookup(&self, group: &str, nickname: &str) -> Option<Machine> {
        self.inner.read().groups.get(group)?.get(nickname).cloned()
    }

    pub fn lookup_by_connection(&self, conn: ConnId) -> Option<Machine> {
        self.inner.read().by_conn.get(&conn).cloned()
    }

    /// Remove the machine registered on `conn`. No-op if there is none.
    pub fn unregister(&self, conn: ConnId) -> Option<Machine> {
        let removed = {
            let mut tables = self.inner.write();
            let machine = tables.by_conn.remove(&conn)?;
            tables.remove_slot(&machine.group, &machine.nickname, conn);
            machine
        };
        removed.disconnected.cancel();
        tracing::info!(
            group = %removed.group,
            nickname = %removed.nickname,
            %conn,
            "machine unregistered"
        );
        Some(removed)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.inner.read().groups.contains_key(group)
    }

    /// Group name -> sorted nicknames, for every live group.
    pub fn overview(&self) -> BTreeMap<String, Vec<String>> {
        let tables = self.inner.read();
        tables
            .groups
            .iter()
            .map(|(name, group)| {
                let mut nicknames: Vec<String> = group.machines.keys().cloned().collect();
                nicknames.sort();
                (name.clone(), nicknames)
            })
            .collect()
    }

    /// Number of registered machines.
    pub fn len(&self) -> usize {
        self.inner.read().by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
