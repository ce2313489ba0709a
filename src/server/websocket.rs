//! WebSocket server implementation
//!
//! Accepts TCP connections, performs the upgrade handshake, and hands each
//! upgraded socket to its own connection adapter wired to the hub.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info};

use super::connection::{ConnectionAdapter, ConnectionLimits};
use super::handshake::HandshakePolicy;
use crate::config::BrokerConfig;
use crate::hub::HubHandle;
use crate::render::{renderer_for, MessageRenderer};

/// Everything a new connection needs, shared by all of them
struct ConnectionContext {
    hub: HubHandle,
    renderer: Arc<dyn MessageRenderer>,
    policy: HandshakePolicy,
    limits: ConnectionLimits,
    ws_config: WebSocketConfig,
}

/// WebSocket server feeding connections into the hub
pub struct ChatServer {
    addr: String,
    context: Arc<ConnectionContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatServer {
    /// Create a new server around a running hub
    pub fn new(config: &BrokerConfig, hub: HubHandle) -> Self {
        Self::with_renderer(config, hub, renderer_for(config.render_format))
    }

    /// Create a server with a custom message renderer
    pub fn with_renderer(
        config: &BrokerConfig,
        hub: HubHandle,
        renderer: Arc<dyn MessageRenderer>,
    ) -> Self {
        // Oversized messages fail the read inside the codec.
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.limits.max_message_size);
        ws_config.max_frame_size = Some(config.limits.max_message_size);

        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            addr: config.socket_addr(),
            context: Arc::new(ConnectionContext {
                hub,
                renderer,
                policy: HandshakePolicy::from_config(config),
                limits: ConnectionLimits::from(&config.limits),
                ws_config,
            }),
            shutdown_tx,
        }
    }

    /// Stop accepting new connections
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    ///
    /// Established connections are left running after shutdown; they end
    /// with the process.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Chat server listening on ws://{}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, context).await {
                                    debug!("Upgrade from {} failed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Upgrade one TCP stream and run its adapter to completion
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<ConnectionContext>,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let mut identity = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        identity = Some(context.policy.accept(request)?);
        Ok(response)
    };
    // A peer that stalls mid-upgrade gets the same deadline as a stalled write.
    let handshake =
        accept_hdr_async_with_config(stream, callback, Some(context.ws_config.clone()));
    let ws_stream = time::timeout(context.limits.write_wait, handshake)
        .await
        .map_err(|_| anyhow!("handshake timed out after {:?}", context.limits.write_wait))??;
    let identity = identity.ok_or_else(|| anyhow!("handshake finished without an identity"))?;

    let adapter = ConnectionAdapter::new(
        peer_addr,
        identity,
        context.hub.clone(),
        Arc::clone(&context.renderer),
        context.limits,
    );
    let id = adapter.id();
    let reason = adapter.run(ws_stream).await;

    // The count query queues behind this client's unregister.
    let remaining = context.hub.member_count().await?;
    debug!("Client {} finished ({}), {} clients remain", id, reason, remaining);
    Ok(())
}
