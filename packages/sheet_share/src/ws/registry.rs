//! Connection Registry
//!
//! Single source of truth for which connections exist and which identity each
//! one carries. Owned by the hub task; nothing else mutates it.

use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::debug;

use super::protocol::ServerMessage;

/// Lifecycle of one transport session as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    /// Inserted, greeting not yet delivered
    Connecting,
    Open,
}

/// Entry in the registry: one per WebSocket connection.
#[derive(Debug)]
struct ConnectionEntry {
    outbox: mpsc::Sender<ServerMessage>,
    identity: Option<String>,
    liveness: Liveness,
}

impl ConnectionEntry {
    fn is_open(&self) -> bool {
        self.liveness == Liveness::Open
    }
}

/// Net effect of a registry mutation on the de-duplicated identity set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDelta {
    pub joined: Option<String>,
    pub left: Option<String>,
}

impl PresenceDelta {
    pub fn is_empty(&self) -> bool {
        self.joined.is_none() && self.left.is_none()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly upgraded connection. It carries no identity and is not
    /// open until [`mark_open`](Self::mark_open).
    pub fn insert(&mut self, connection_id: &str, outbox: mpsc::Sender<ServerMessage>) {
        self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                outbox,
                identity: None,
                liveness: Liveness::Connecting,
            },
        );
    }

    /// Promote a connection to open. The delta reports a join when it carries
    /// an identity, registered while still connecting, that no other open
    /// connection holds.
    pub fn mark_open(&mut self, connection_id: &str) -> PresenceDelta {
        let Some(entry) = self.connections.get(connection_id) else {
            return PresenceDelta::default();
        };
        if entry.is_open() {
            return PresenceDelta::default();
        }
        let identity = entry.identity.clone();
        let already_present = identity
            .as_deref()
            .is_some_and(|id| self.held_by_other_open(id, connection_id));
        if let Some(entry) = self.connections.get_mut(connection_id) {
            entry.liveness = Liveness::Open;
        }
        PresenceDelta {
            joined: identity.filter(|_| !already_present),
            left: None,
        }
    }

    /// Associate `identity` with a connection, replacing any prior identity.
    ///
    /// `identity` must already be validated as non-empty. `joined` is set when
    /// the identity was absent from the presence set; `left` is set when the
    /// replaced identity is no longer held by any open connection.
    pub fn add_or_update_identity(&mut self, connection_id: &str, identity: &str) -> PresenceDelta {
        debug_assert!(!identity.is_empty());

        let Some(entry) = self.connections.get(connection_id) else {
            return PresenceDelta::default();
        };
        let counts = entry.is_open();
        let previous = entry.identity.clone();
        if previous.as_deref() == Some(identity) {
            return PresenceDelta::default();
        }

        let already_present = self.held_by_other_open(identity, connection_id);
        if let Some(entry) = self.connections.get_mut(connection_id) {
            entry.identity = Some(identity.to_string());
        }
        if !counts {
            return PresenceDelta::default();
        }

        let left = previous.filter(|old| !self.held_by_other_open(old, connection_id));
        let delta = PresenceDelta {
            joined: (!already_present).then(|| identity.to_string()),
            left,
        };
        debug!(conn_id = %connection_id, identity, ?delta, "identity registered");
        delta
    }

    /// Remove a connection. Idempotent: removing an unknown id is a no-op.
    pub fn remove(&mut self, connection_id: &str) -> PresenceDelta {
        let Some(entry) = self.connections.remove(connection_id) else {
            return PresenceDelta::default();
        };
        if !entry.is_open() {
            return PresenceDelta::default();
        }
        PresenceDelta {
            joined: None,
            left: entry
                .identity
                .filter(|id| !self.held_by_other_open(id, connection_id)),
        }
    }

    /// De-duplicated identities across open connections, sorted.
    pub fn distinct_identities(&self) -> Vec<String> {
        self.connections
            .values()
            .filter(|e| e.is_open())
            .filter_map(|e| e.identity.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn identity_of(&self, connection_id: &str) -> Option<&str> {
        self.connections
            .get(connection_id)
            .and_then(|e| e.identity.as_deref())
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Outbound queue for a connection, regardless of liveness.
    pub fn outbox(&self, connection_id: &str) -> Option<&mpsc::Sender<ServerMessage>> {
        self.connections.get(connection_id).map(|e| &e.outbox)
    }

    /// Ids of every open connection, in no particular order.
    pub fn open_connections(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|(_, e)| e.is_open())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Connections the sweep should evict: never opened, or whose writer has gone away.
    pub fn stale_connections(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|(_, e)| !e.is_open() || e.outbox.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn held_by_other_open(&self, identity: &str, except: &str) -> bool {
        self.connections.iter().any(|(id, e)| {
            id != except && e.is_open() && e.identity.as_deref() == Some(identity)
        })
    }
}
