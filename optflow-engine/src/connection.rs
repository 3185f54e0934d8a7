//! Feed connection lifecycle: dial, send, receive, detect close, reconnect.
//!
//! The connection layer has no knowledge of trade semantics. It owns the
//! WebSocket transport, the pending-call table, and the state machine
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED, and delivers
//! inbound frames to the engine as an ordered [`FeedEvent`] stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::FlowError;
use crate::protocol::RpcRequest;

/// Connection lifecycle states. Exactly one instance per engine; transitions
/// gate whether outbound calls are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the caller intended a pending call's response for. Routing
/// dispatches on this, falling back to payload shape only for envelopes
/// that match no pending call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallPurpose {
    /// Bulk trade-history fetch for the selected currency
    TradeHistory,
    /// Perp ticker used as the spot price reference
    SpotTicker,
    /// Option ticker fetched for open-interest enrichment
    InstrumentTicker(String),
    /// Spot-feed fallback when the perp ticker fails
    SpotFeed,
}

/// An outstanding request awaiting its response. Discarded, not retried,
/// when the connection that carried it closes.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub id: u64,
    pub method: String,
    pub purpose: CallPurpose,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CallTable {
    pending: HashMap<u64, PendingCall>,
}

impl CallTable {
    fn insert(&mut self, call: PendingCall) {
        self.pending.insert(call.id, call);
    }

    fn take(&mut self, id: u64) -> Option<PendingCall> {
        self.pending.remove(&id)
    }

    fn drain(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Transport events delivered to the engine, in arrival order.
#[derive(Debug)]
pub enum FeedEvent {
    /// Transport opened. Re-issuing requests is the receiver's
    /// responsibility; the connection never replays pending calls.
    Up,
    /// Transport closed or failed. Pending calls have been discarded.
    Down { reason: Option<String> },
    /// One inbound text frame.
    Message(String),
}

struct ConnectionShared {
    url: String,
    reconnect_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<String>,
    calls: Mutex<CallTable>,
    next_id: AtomicU64,
    foreground: AtomicBool,
    error: Mutex<Option<FlowError>>,
}

/// Cloneable handle to one logical feed connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionShared>,
}

impl Connection {
    /// Build a connection handle plus the driver that owns the transport.
    /// The driver must be spawned for the connection to make progress.
    pub(crate) fn new(url: String, reconnect_delay: Duration) -> (Self, ConnectionDriver) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let connection = Self {
            inner: Arc::new(ConnectionShared {
                url,
                reconnect_delay,
                state_tx,
                outbound_tx,
                calls: Mutex::new(CallTable::default()),
                next_id: AtomicU64::new(0),
                foreground: AtomicBool::new(true),
                error: Mutex::new(None),
            }),
        };
        let driver = ConnectionDriver {
            connection: connection.clone(),
            outbound_rx,
        };
        (connection, driver)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Gate automatic reconnection: while backgrounded the driver stops
    /// dialing until the consumer is foregrounded again.
    pub fn set_foreground(&self, foreground: bool) {
        self.inner.foreground.store(foreground, Ordering::Relaxed);
    }

    pub fn is_foreground(&self) -> bool {
        self.inner.foreground.load(Ordering::Relaxed)
    }

    /// The current user-visible error, if any.
    pub fn last_error(&self) -> Option<FlowError> {
        self.inner.error.lock().clone()
    }

    pub(crate) fn set_error(&self, error: FlowError) {
        *self.inner.error.lock() = Some(error);
    }

    pub(crate) fn clear_error(&self) {
        *self.inner.error.lock() = None;
    }

    /// Issue a call. Returns the allocated call id, or `None` (performing
    /// no action) when the connection is not in the CONNECTED state.
    pub fn send(&self, method: &str, params: Value, purpose: CallPurpose) -> Option<u64> {
        if self.state() != ConnectionState::Connected {
            return None;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = RpcRequest::new(method, params, id);
        let frame = match serde_json::to_string(&request) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(method, error = %e, "failed to serialise request");
                return None;
            }
        };

        // Register before queueing so a fast response finds its call.
        self.inner.calls.lock().insert(PendingCall {
            id,
            method: method.to_string(),
            purpose,
            issued_at: Utc::now(),
        });

        if self.inner.outbound_tx.send(frame).is_err() {
            // Driver is gone; roll back the registration.
            self.inner.calls.lock().take(id);
            return None;
        }
        debug!(method, id, "request queued");
        Some(id)
    }

    /// Remove and return the pending call for a response id.
    pub(crate) fn take_call(&self, id: u64) -> Option<PendingCall> {
        self.inner.calls.lock().take(id)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.calls.lock().len()
    }

    fn transition(&self, state: ConnectionState) {
        self.inner.state_tx.send_replace(state);
    }

    fn discard_pending(&self) -> usize {
        self.inner.calls.lock().drain()
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.transition(state);
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns the transport and the reconnect loop. There is never more than one
/// live transport per driver: the previous socket is dropped before a new
/// dial begins.
pub(crate) struct ConnectionDriver {
    connection: Connection,
    pub(crate) outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl ConnectionDriver {
    /// Run until shutdown. Emits [`FeedEvent`]s in delivery order; stops
    /// early if the event receiver is dropped.
    pub(crate) async fn run(
        mut self,
        events: mpsc::Sender<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(url = %self.connection.inner.url, "starting feed connection driver");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.connection.is_foreground() {
                // Backgrounded consumer: suppress reconnection entirely.
                debug!("consumer backgrounded, reconnect suppressed");
                tokio::select! {
                    _ = tokio::time::sleep(self.connection.inner.reconnect_delay) => {}
                    result = shutdown.changed() => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            self.connection.transition(ConnectionState::Connecting);

            // A dial can outlive a teardown request (an unresponsive remote
            // never completes the handshake), so race it against shutdown.
            let attempt = tokio::select! {
                result = connect_async(&self.connection.inner.url) => result,
                _ = shutdown.changed() => break,
            };

            match attempt {
                Ok((stream, _)) => {
                    info!(url = %self.connection.inner.url, "feed connected");
                    self.connection.clear_error();
                    self.connection.transition(ConnectionState::Connected);
                    if events.send(FeedEvent::Up).await.is_err() {
                        break;
                    }

                    let reason = self.drive(stream, &events, &mut shutdown).await;

                    let discarded = self.connection.discard_pending();
                    if discarded > 0 {
                        debug!(discarded, "discarded pending calls on close");
                    }
                    self.drain_outbound();

                    if let Some(message) = &reason {
                        self.connection
                            .set_error(FlowError::Transport(message.clone()));
                    }
                    self.connection.transition(ConnectionState::Disconnected);
                    if events.send(FeedEvent::Down { reason }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(url = %self.connection.inner.url, error = %e, "failed to connect to feed");
                    self.connection
                        .set_error(FlowError::Transport(e.to_string()));
                    self.connection.transition(ConnectionState::Disconnected);
                    if events
                        .send(FeedEvent::Down {
                            reason: Some(e.to_string()),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            // One-shot reconnect delay, re-armed after every close.
            debug!(delay = ?self.connection.inner.reconnect_delay, "waiting before reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(self.connection.inner.reconnect_delay) => {}
                result = shutdown.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }

        self.connection.transition(ConnectionState::Disconnected);
        info!("feed connection driver stopped");
    }

    /// Pump one live transport until it closes. Returns the close reason,
    /// or `None` for an orderly local shutdown.
    async fn drive(
        &mut self,
        stream: WsStream,
        events: &mpsc::Sender<FeedEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<String> {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return None;
                }
                frame = self.outbound_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                error!(error = %e, "failed to transmit request");
                                return Some(e.to_string());
                            }
                        }
                        // Every sender dropped: the engine is gone.
                        None => return None,
                    }
                }
                inbound = read.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if events.send(FeedEvent::Message(text.to_string())).await.is_err() {
                                return None;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("feed closed the connection");
                            return Some("connection closed by feed".to_string());
                        }
                        Some(Ok(_)) => {
                            // Pong / binary frames carry nothing for us.
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "feed transport error");
                            return Some(e.to_string());
                        }
                        None => return Some("feed stream ended".to_string()),
                    }
                }
            }
        }
    }

    fn drain_outbound(&mut self) {
        while self.outbound_rx.try_recv().is_ok() {}
    }
}
