//! Share hub actor
//!
//! Owns the connection registry. Socket tasks talk to it through a
//! [`HubHandle`]; every registry mutation and every broadcast happens on the
//! hub task, one event at a time.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::ServerMetrics;

use super::broadcast::PresenceBroadcaster;
use super::dispatch::{DispatchResult, RouterContext, dispatch_frame};
use super::protocol::ServerMessage;
use super::registry::ConnectionRegistry;

/// Inbound event queue depth. Socket readers wait when it is full.
const HUB_QUEUE_CAPACITY: usize = 1024;

/// Smallest usable outbox: the two-message greeting plus one presence update
/// (`user-status` and snapshot) queued before the writer first drains it.
pub const MIN_OUTBOX_CAPACITY: usize = 4;

/// Events that can be sent to the hub
#[derive(Debug)]
pub enum HubEvent {
    Opened {
        connection_id: String,
        outbox: mpsc::Sender<ServerMessage>,
    },
    Frame {
        connection_id: String,
        text: String,
    },
    Closed {
        connection_id: String,
    },
    OnlineUsers {
        respond_to: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to communicate with the hub
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    /// Register a new connection. The hub greets it before marking it open.
    pub async fn open(&self, connection_id: &str, outbox: mpsc::Sender<ServerMessage>) -> Result<()> {
        self.send(HubEvent::Opened {
            connection_id: connection_id.to_string(),
            outbox,
        })
        .await
    }

    pub async fn frame(&self, connection_id: &str, text: String) -> Result<()> {
        self.send(HubEvent::Frame {
            connection_id: connection_id.to_string(),
            text,
        })
        .await
    }

    pub async fn close(&self, connection_id: &str) -> Result<()> {
        self.send(HubEvent::Closed {
            connection_id: connection_id.to_string(),
        })
        .await
    }

    /// Current de-duplicated presence set.
    pub async fn online_users(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(HubEvent::OnlineUsers { respond_to: tx }).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Share hub didn't respond"))
    }

    async fn send(&self, event: HubEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("Share hub is gone"))
    }
}

pub struct Hub {
    registry: ConnectionRegistry,
    broadcaster: PresenceBroadcaster,
    metrics: Arc<ServerMetrics>,
    receiver: mpsc::Receiver<HubEvent>,
}

impl Hub {
    /// Start the hub task. It runs until `cancel` fires or every handle is dropped.
    pub fn spawn(
        sweep_interval: Duration,
        metrics: Arc<ServerMetrics>,
        cancel: CancellationToken,
    ) -> HubHandle {
        let (sender, receiver) = mpsc::channel(HUB_QUEUE_CAPACITY);
        let hub = Hub {
            registry: ConnectionRegistry::new(),
            broadcaster: PresenceBroadcaster::new(metrics.clone()),
            metrics,
            receiver,
        };
        tokio::spawn(async move {
            hub.run(sweep_interval, cancel).await;
        });
        HubHandle { sender }
    }

    async fn run(mut self, sweep_interval: Duration, cancel: CancellationToken) {
        debug!(?sweep_interval, "Share hub started");
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Share hub shutting down");
                    break;
                }
                event = self.receiver.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("All hub handles dropped");
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Opened {
                connection_id,
                outbox,
            } => self.on_open(&connection_id, outbox),
            HubEvent::Frame {
                connection_id,
                text,
            } => self.on_frame(&connection_id, &text),
            HubEvent::Closed { connection_id } => self.on_close(&connection_id),
            HubEvent::OnlineUsers { respond_to } => {
                let _ = respond_to.send(self.registry.distinct_identities());
            }
        }
    }

    fn on_open(&mut self, connection_id: &str, outbox: mpsc::Sender<ServerMessage>) {
        self.registry.insert(connection_id, outbox);

        let snapshot = ServerMessage::OnlineUsers {
            users: self.registry.distinct_identities(),
        };
        let greeted = self.broadcaster.send_to(
            &mut self.registry,
            connection_id,
            ServerMessage::connection_established(),
        ) && self
            .broadcaster
            .send_to(&mut self.registry, connection_id, snapshot);
        if !greeted {
            return;
        }

        let delta = self.registry.mark_open(connection_id);
        if !delta.is_empty() {
            self.broadcaster.announce_delta(&mut self.registry, delta);
            self.broadcaster.announce_snapshot(&mut self.registry);
        }
        debug!(conn_id = %connection_id, connections = self.registry.len(), "Connection open");
    }

    fn on_frame(&mut self, connection_id: &str, text: &str) {
        self.metrics.frame_received();
        let mut ctx = RouterContext {
            connection_id,
            registry: &mut self.registry,
            broadcaster: &self.broadcaster,
        };
        match dispatch_frame(&mut ctx, text) {
            DispatchResult::Rejected(e) => {
                self.metrics.protocol_error();
                debug!(conn_id = %connection_id, detail = %e.detail(), "Protocol error");
            }
            DispatchResult::Shared { delivered } => {
                self.metrics.share();
                debug!(conn_id = %connection_id, delivered, "Share delivered");
            }
            DispatchResult::Registered { username, delta } => {
                debug!(conn_id = %connection_id, username, ?delta, "Presence updated");
            }
            DispatchResult::Ignored => {}
        }
    }

    fn on_close(&mut self, connection_id: &str) {
        let delta = self.registry.remove(connection_id);
        if !delta.is_empty() {
            self.broadcaster.announce_delta(&mut self.registry, delta);
            self.broadcaster.announce_snapshot(&mut self.registry);
        }
        debug!(conn_id = %connection_id, connections = self.registry.len(), "Connection removed");
    }

    /// Evict stale connections and resynchronize every client's presence view.
    fn sweep(&mut self) {
        let stale = self.registry.stale_connections();
        let evicted = stale.len();
        let snapshot_sent = self.broadcaster.evict(&mut self.registry, stale);
        if !snapshot_sent && !self.registry.is_empty() {
            self.broadcaster.announce_snapshot(&mut self.registry);
        }
        self.metrics.sweep();
        debug!(evicted, connections = self.registry.len(), "Sweep complete");
    }
}
