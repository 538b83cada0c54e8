//! Reconnection Controller
//!
//! Keeps one logical session alive over a series of transport connections.
//! Unexpected closures are retried with exponential backoff; a deliberate
//! [`ClientHandle::close`] is terminal. Sends fail fast unless the
//! connection is open, so nothing queued on one connection leaks onto the next.

use futures::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ws::{ClientMessage, ServerMessage};

use super::backoff::ReconnectPolicy;
use super::connector::{Connector, Inbound, Outbound, Transport};
use super::error::ClientError;

const EVENT_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Lifecycle notifications and server messages, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// A connection is open; re-send `register-user` here
    Opened,
    Message(ServerMessage),
    Closed {
        /// True only for closures requested through [`ClientHandle::close`]
        deliberate: bool,
        reason: Option<String>,
    },
    /// A reconnection attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Retry budget exhausted; nothing happens until [`ClientHandle::reconnect`]
    GaveUp { attempts: u32 },
}

/// Caller-facing handle. Cloning it shares the same controller.
#[derive(Clone)]
pub struct ClientHandle {
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::Sender<String>,
    retry: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl ClientHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queue a message on the current connection.
    pub fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(ClientError::NotConnected(state));
        }
        let text = serde_json::to_string(msg)?;
        self.outbound.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => ClientError::Backpressure,
            TrySendError::Closed(_) => ClientError::Stopped,
        })
    }

    /// Close with a normal closure and stop for good. Safe to call at any time,
    /// including during a backoff wait.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Start over with a fresh retry budget. Skips any pending backoff wait.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Stopped);
        }
        match self.retry.try_send(()) {
            // A retry is already pending
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(ClientError::Stopped),
        }
    }
}

/// How a live connection ended.
enum Disconnect {
    Deliberate,
    Lost(String),
}

/// Outcome of waiting between attempts.
enum Wait {
    Elapsed,
    Retry,
    Cancelled,
}

pub struct ReconnectingClient<C> {
    connector: C,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ControllerEvent>,
    outbound: mpsc::Receiver<String>,
    retry: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

impl<C: Connector> ReconnectingClient<C> {
    /// Start connecting in the background.
    pub fn spawn(
        connector: C,
        policy: ReconnectPolicy,
    ) -> (ClientHandle, mpsc::Receiver<ControllerEvent>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (retry_tx, retry_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let controller = ReconnectingClient {
            connector,
            policy,
            state: state_tx,
            events: event_tx,
            outbound: outbound_rx,
            retry: retry_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(controller.run());

        let handle = ClientHandle {
            state: state_rx,
            outbound: outbound_tx,
            retry: retry_tx,
            cancel,
        };
        (handle, event_rx)
    }

    async fn run(mut self) {
        // Reconnection attempts scheduled since the last open (backoff exponent)
        let mut scheduled: u32 = 0;
        // Consecutive failed connects since the last open
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(transport) => {
                    scheduled = 0;
                    failures = 0;
                    // Stale retry requests must not skip the next backoff
                    while self.retry.try_recv().is_ok() {}
                    self.set_state(ConnectionState::Open);
                    info!("Connected");
                    self.emit(ControllerEvent::Opened).await;

                    let disconnect = self.pump(transport).await;
                    // Never carry frames over to the next connection
                    while self.outbound.try_recv().is_ok() {}

                    match disconnect {
                        Disconnect::Deliberate => break,
                        Disconnect::Lost(reason) => {
                            warn!(reason = %reason, "Connection lost");
                            self.set_state(ConnectionState::Closed);
                            self.emit(ControllerEvent::Closed {
                                deliberate: false,
                                reason: Some(reason),
                            })
                            .await;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, "Connect failed: {}", e);
                    self.set_state(ConnectionState::Closed);
                }
            }

            if failures >= self.policy.max_attempts {
                warn!(attempts = failures, "Giving up on reconnecting");
                self.emit(ControllerEvent::GaveUp { attempts: failures })
                    .await;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    retry = self.retry.recv() => {
                        if retry.is_none() {
                            break;
                        }
                    }
                }
                info!("Retrying after give-up");
                scheduled = 0;
                failures = 0;
                continue;
            }

            let delay = self.policy.delay(scheduled);
            scheduled = scheduled.saturating_add(1);
            debug!(attempt = scheduled, ?delay, "Scheduling reconnect");
            self.emit(ControllerEvent::Reconnecting {
                attempt: scheduled,
                delay,
            })
            .await;

            match self.wait(delay).await {
                Wait::Elapsed => {}
                Wait::Retry => {
                    scheduled = 0;
                    failures = 0;
                }
                Wait::Cancelled => break,
            }
        }

        self.set_state(ConnectionState::Closed);
        self.emit(ControllerEvent::Closed {
            deliberate: true,
            reason: None,
        })
        .await;
        debug!("Controller stopped");
    }

    /// Move frames both ways until the connection ends.
    async fn pump(&mut self, transport: Transport) -> Disconnect {
        let Transport {
            mut sink,
            mut stream,
        } = transport;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    if let Err(e) = sink.send(Outbound::Close).await {
                        debug!("Close frame not delivered: {}", e);
                    }
                    return Disconnect::Deliberate;
                }
                frame = self.outbound.recv() => {
                    let Some(text) = frame else {
                        // Every handle dropped
                        self.cancel.cancel();
                        continue;
                    };
                    if let Err(e) = sink.send(Outbound::Text(text)).await {
                        return Disconnect::Lost(e.to_string());
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Inbound::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => self.emit(ControllerEvent::Message(msg)).await,
                            Err(e) => warn!("Ignoring unrecognized server frame: {}", e),
                        }
                    }
                    Some(Ok(Inbound::Close(code))) => {
                        return Disconnect::Lost(match code {
                            Some(code) => format!("closed by server ({code})"),
                            None => "closed by server".to_string(),
                        });
                    }
                    Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                    None => return Disconnect::Lost("connection ended".to_string()),
                },
            }
        }
    }

    async fn wait(&mut self, delay: Duration) -> Wait {
        tokio::select! {
            _ = self.cancel.cancelled() => Wait::Cancelled,
            _ = tokio::time::sleep(delay) => Wait::Elapsed,
            retry = self.retry.recv() => match retry {
                Some(()) => Wait::Retry,
                None => Wait::Cancelled,
            },
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn emit(&self, event: ControllerEvent) {
        // A caller that stopped listening does not stop the controller
        let _ = self.events.send(event).await;
    }
}
