//! Presence Broadcaster
//!
//! Best-effort delivery into per-connection outboxes. A failed send never
//! blocks other recipients; the failing connection is evicted and any
//! identity it was the last holder of is announced as leaving.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::metrics::ServerMetrics;

use super::protocol::{PresenceAction, ServerMessage};
use super::registry::{ConnectionRegistry, PresenceDelta};

/// Outcome of delivering one message to a set of connections.
struct Delivery {
    delivered: usize,
    failed: Vec<String>,
}

pub struct PresenceBroadcaster {
    metrics: Arc<ServerMetrics>,
}

impl PresenceBroadcaster {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self { metrics }
    }

    /// Send to every open connection. Returns how many outboxes accepted it.
    pub fn announce(&self, registry: &mut ConnectionRegistry, msg: &ServerMessage) -> usize {
        let delivery = self.deliver_all(registry, msg, None);
        self.evict(registry, delivery.failed);
        delivery.delivered
    }

    /// Send to every open connection except `origin`. Returns the number of
    /// peers reached; peers that failed are evicted and not counted.
    pub fn fanout(
        &self,
        registry: &mut ConnectionRegistry,
        msg: &ServerMessage,
        origin: &str,
    ) -> usize {
        let delivery = self.deliver_all(registry, msg, Some(origin));
        self.evict(registry, delivery.failed);
        delivery.delivered
    }

    /// Direct reply to one connection. The connection does not need to be
    /// open yet (greetings go out while it is still connecting).
    pub fn send_to(
        &self,
        registry: &mut ConnectionRegistry,
        connection_id: &str,
        msg: ServerMessage,
    ) -> bool {
        if self.try_deliver(registry, connection_id, msg) {
            true
        } else {
            self.evict(registry, vec![connection_id.to_string()]);
            false
        }
    }

    /// Announce `user-status` events for a registry delta. Leave goes first so
    /// a rename reads as leave-then-join.
    pub fn announce_delta(&self, registry: &mut ConnectionRegistry, delta: PresenceDelta) {
        if let Some(username) = delta.left {
            self.announce(
                registry,
                &ServerMessage::UserStatus {
                    action: PresenceAction::Leave,
                    username,
                },
            );
        }
        if let Some(username) = delta.joined {
            self.announce(
                registry,
                &ServerMessage::UserStatus {
                    action: PresenceAction::Join,
                    username,
                },
            );
        }
    }

    /// Broadcast the current `online-users` snapshot to every open connection.
    pub fn announce_snapshot(&self, registry: &mut ConnectionRegistry) -> usize {
        let msg = ServerMessage::OnlineUsers {
            users: registry.distinct_identities(),
        };
        self.announce(registry, &msg)
    }

    /// Remove connections whose sends failed or that were found stale.
    ///
    /// Identities that disappear are announced as `leave` followed by a fresh
    /// snapshot; connections that fail during those announcements are evicted
    /// in the same pass. Returns true if presence changed.
    pub fn evict(&self, registry: &mut ConnectionRegistry, connection_ids: Vec<String>) -> bool {
        let mut pending: VecDeque<String> = connection_ids.into();
        let mut any_change = false;

        while !pending.is_empty() {
            let mut presence_changed = false;
            while let Some(connection_id) = pending.pop_front() {
                if !registry.contains(&connection_id) {
                    continue;
                }
                let delta = registry.remove(&connection_id);
                self.metrics.connection_evicted();
                warn!(conn_id = %connection_id, "Evicted connection");

                if let Some(username) = delta.left {
                    presence_changed = true;
                    let msg = ServerMessage::UserStatus {
                        action: PresenceAction::Leave,
                        username,
                    };
                    pending.extend(self.deliver_all(registry, &msg, None).failed);
                }
            }
            if presence_changed {
                any_change = true;
                let msg = ServerMessage::OnlineUsers {
                    users: registry.distinct_identities(),
                };
                pending.extend(self.deliver_all(registry, &msg, None).failed);
            }
        }
        any_change
    }

    fn deliver_all(
        &self,
        registry: &ConnectionRegistry,
        msg: &ServerMessage,
        exclude: Option<&str>,
    ) -> Delivery {
        let mut delivery = Delivery {
            delivered: 0,
            failed: Vec::new(),
        };
        for connection_id in registry.open_connections() {
            if exclude == Some(connection_id.as_str()) {
                continue;
            }
            if self.try_deliver(registry, &connection_id, msg.clone()) {
                delivery.delivered += 1;
            } else {
                delivery.failed.push(connection_id);
            }
        }
        delivery
    }

    fn try_deliver(
        &self,
        registry: &ConnectionRegistry,
        connection_id: &str,
        msg: ServerMessage,
    ) -> bool {
        let Some(outbox) = registry.outbox(connection_id) else {
            return false;
        };
        let kind = msg.kind();
        match outbox.try_send(msg) {
            Ok(()) => {
                self.metrics.message_sent();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.message_dropped();
                warn!(conn_id = %connection_id, kind, "Outbox full, dropping slow connection");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.message_dropped();
                debug!(conn_id = %connection_id, kind, "Outbox closed");
                false
            }
        }
    }
}
