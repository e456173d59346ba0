// Per-connection application state.
//
// `ClientRegistry` maps each live `ConnectionHandle` to a `ClientState`. An
// entry exists exactly while the transport considers the connection to be
// connecting or connected: `lifecycle.rs` inserts it on accept (before the
// connection joins the poll group, so no inbound message can beat it) and
// removes it on close. `dispatch.rs` reads it and changes names.
//
// The registry is owned by the relay loop and mutated from one thread, so it
// carries no locking of its own. A `BTreeMap` keeps broadcast order stable.

use std::collections::BTreeMap;

use crate::transport::ConnectionHandle;

/// Label used in logs for a client that never set a name.
pub const ANONYMOUS_LABEL: &str = "(not logged-in client)";

/// State kept for one connected client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientState {
    /// Display name chosen by the client. `None` until the first non-empty
    /// name change.
    pub name: Option<String>,
}

impl ClientState {
    /// Name shown to other clients: the chosen name, or `Guest#<handle>`.
    pub fn display_name(&self, conn: ConnectionHandle) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => guest_name(conn),
        }
    }

    /// Name used in server-side logs.
    pub fn log_label(&self) -> &str {
        self.name.as_deref().unwrap_or(ANONYMOUS_LABEL)
    }
}

/// Deterministic name for a client that has not picked one.
pub fn guest_name(conn: ConnectionHandle) -> String {
    format!("Guest#{conn}")
}

/// All clients currently connecting or connected.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<ConnectionHandle, ClientState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unnamed entry. Returns false (and leaves the existing entry
    /// alone) if the handle is already registered.
    pub fn register(&mut self, conn: ConnectionHandle) -> bool {
        if self.clients.contains_key(&conn) {
            return false;
        }
        self.clients.insert(conn, ClientState::default());
        true
    }

    /// Remove an entry. Removing an absent handle is a no-op.
    pub fn remove(&mut self, conn: ConnectionHandle) -> Option<ClientState> {
        self.clients.remove(&conn)
    }

    pub fn get(&self, conn: ConnectionHandle) -> Option<&ClientState> {
        self.clients.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnectionHandle) -> Option<&mut ClientState> {
        self.clients.get_mut(&conn)
    }

    pub fn contains(&self, conn: ConnectionHandle) -> bool {
        self.clients.contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Registered handles in ascending order.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.clients.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionHandle, &ClientState)> {
        self.clients.iter().map(|(conn, state)| (*conn, state))
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }
}
