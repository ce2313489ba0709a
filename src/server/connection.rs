//! Connection adapter
//!
//! Bridges one upgraded WebSocket to the hub. The socket is split in two:
//! the receive loop owns the read half and the send loop owns the write half,
//! so every frame (data, ping and close alike) is written from one place.
//!
//! Teardown can start on either side. The receive loop stops on a read error,
//! a close frame or the idle deadline, and unregisters from the hub; the hub
//! then drops its outbox sender and the send loop writes a close frame and
//! exits. The send loop stops on a write error, the write deadline, or the
//! outbox closing (eviction); the receive loop notices the send task ending
//! and unregisters, which is a no-op if the hub already removed it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::protocol::normalize;
use crate::config::LimitsSection;
use crate::hub::{outbox, ClientId, HubError, HubHandle, Member, OutboxReceiver, Payload};
use crate::render::MessageRenderer;

/// Reasons a connection ends
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Protocol violation: {0}")]
    Protocol(WsError),

    #[error("I/O failure: {0}")]
    Io(WsError),

    #[error("No frame received within {0:?}")]
    IdleTimeout(Duration),

    #[error("Write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Outbox closed by hub")]
    OutboxClosed,

    #[error("Send loop failed: {0}")]
    SendLoop(String),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl From<WsError> for ConnectionError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::PeerClosed,
            WsError::Capacity(_)
            | WsError::Protocol(_)
            | WsError::Utf8
            | WsError::AttackAttempt => Self::Protocol(err),
            _ => Self::Io(err),
        }
    }
}

/// Lifecycle of a connection adapter; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Active => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

/// Timing and buffering limits applied to each connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub outbox_capacity: usize,
}

impl From<&LimitsSection> for ConnectionLimits {
    fn from(limits: &LimitsSection) -> Self {
        Self {
            write_wait: limits.write_wait(),
            pong_wait: limits.pong_wait(),
            ping_period: limits.ping_period(),
            outbox_capacity: limits.outbox_capacity,
        }
    }
}

/// Which side ended the connection
enum Teardown {
    Receiver(ConnectionError),
    Sender(ConnectionError),
}

/// One upgraded connection and its two loops
pub struct ConnectionAdapter {
    id: ClientId,
    peer_addr: SocketAddr,
    identity: String,
    hub: HubHandle,
    renderer: Arc<dyn MessageRenderer>,
    limits: ConnectionLimits,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionAdapter {
    pub fn new(
        peer_addr: SocketAddr,
        identity: impl Into<String>,
        hub: HubHandle,
        renderer: Arc<dyn MessageRenderer>,
        limits: ConnectionLimits,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            id: ClientId::new(),
            peer_addr,
            identity: identity.into(),
            hub,
            renderer,
            limits,
            state,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Watch lifecycle transitions
    #[allow(dead_code)]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Client {} is now {:?}", self.id, next);
        }
    }

    /// Start both loops, register with the hub, and run until the connection ends
    ///
    /// Returns the reason the connection ended.
    pub async fn run<S>(self, ws: WebSocketStream<S>) -> ConnectionError
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (outbox_tx, outbox_rx) = outbox(self.limits.outbox_capacity);

        let mut sender = tokio::spawn(send_loop(self.id, sink, outbox_rx, self.limits));
        self.transition(ConnectionState::Active);

        let member = Member::new(self.id, self.identity.clone(), outbox_tx);
        let teardown = match self.hub.register(member) {
            // The rejected member drops its outbox sender, so the send loop exits too.
            Err(err) => Teardown::Receiver(err.into()),
            Ok(()) => {
                info!(
                    "Client {} ({}) connected from {}",
                    self.id, self.identity, self.peer_addr
                );
                self.receive_loop(stream, &mut sender).await
            }
        };

        self.transition(ConnectionState::Closing);
        let _ = self.hub.unregister(self.id);

        let reason = match teardown {
            Teardown::Receiver(reason) => {
                // Let the send loop flush its close frame and drop the write half.
                if let Err(err) = sender.await {
                    warn!("Send loop for client {} failed: {}", self.id, err);
                }
                reason
            }
            Teardown::Sender(reason) => reason,
        };

        match &reason {
            ConnectionError::Protocol(_) => warn!(
                "Client {} ({}) disconnected: {}",
                self.id, self.peer_addr, reason
            ),
            _ => info!(
                "Client {} ({}) disconnected: {}",
                self.id, self.peer_addr, reason
            ),
        }
        self.transition(ConnectionState::Closed);
        reason
    }

    async fn receive_loop<S>(
        &self,
        mut stream: SplitStream<WebSocketStream<S>>,
        sender: &mut JoinHandle<ConnectionError>,
    ) -> Teardown
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let idle = self.limits.pong_wait;

        loop {
            tokio::select! {
                // Every frame, pongs included, restarts the idle deadline.
                frame = time::timeout(idle, stream.next()) => {
                    let message = match frame {
                        Err(_) => return Teardown::Receiver(ConnectionError::IdleTimeout(idle)),
                        Ok(None) => return Teardown::Receiver(ConnectionError::PeerClosed),
                        Ok(Some(Err(err))) => return Teardown::Receiver(err.into()),
                        Ok(Some(Ok(message))) => message,
                    };

                    match message {
                        Message::Text(text) => {
                            if let Err(err) = self.handle_text(&text) {
                                return Teardown::Receiver(err);
                            }
                        }
                        Message::Binary(data) => {
                            warn!(
                                "Received binary message from client {} ({} bytes), ignoring",
                                self.id,
                                data.len()
                            );
                        }
                        // Pings are answered by the codec on the read path.
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                        Message::Close(_) => {
                            debug!("Client {} requested close", self.id);
                            return Teardown::Receiver(ConnectionError::PeerClosed);
                        }
                    }
                }
                result = &mut *sender => {
                    let reason = result
                        .unwrap_or_else(|err| ConnectionError::SendLoop(err.to_string()));
                    return Teardown::Sender(reason);
                }
            }
        }
    }

    /// A message that fails to render is dropped; the connection stays up.
    fn handle_text(&self, text: &str) -> Result<(), ConnectionError> {
        let frame = normalize(text);
        match self.renderer.render(&self.identity, &frame, Utc::now()) {
            Ok(payload) => self.hub.broadcast(payload)?,
            Err(err) => warn!("Dropping message from client {}: {}", self.id, err),
        }
        Ok(())
    }
}

async fn send_loop<S>(
    id: ClientId,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbox: OutboxReceiver,
    limits: ConnectionLimits,
) -> ConnectionError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut keepalive = time::interval_at(Instant::now() + limits.ping_period, limits.ping_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            payload = outbox.recv() => match payload {
                Some(payload) => {
                    if let Err(err) = write_frame(&mut sink, frame_for(&payload), limits.write_wait).await {
                        break err;
                    }
                }
                None => {
                    let _ = write_frame(&mut sink, Message::Close(None), limits.write_wait).await;
                    break ConnectionError::OutboxClosed;
                }
            },
            _ = keepalive.tick() => {
                if let Err(err) = write_frame(&mut sink, Message::Ping(Vec::new()), limits.write_wait).await {
                    break err;
                }
            }
        }
    };

    debug!("Send loop for client {} stopped: {}", id, reason);
    reason
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    message: Message,
    wait: Duration,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match time::timeout(wait, sink.send(message)).await {
        Ok(result) => result.map_err(ConnectionError::from),
        Err(_) => Err(ConnectionError::WriteTimeout(wait)),
    }
}

/// Payloads go out as text frames unless they are not valid UTF-8
fn frame_for(payload: &Payload) -> Message {
    match std::str::from_utf8(payload.as_bytes()) {
        Ok(text) => Message::Text(text.to_owned()),
        Err(_) => Message::Binary(payload.as_bytes().to_vec()),
    }
}
