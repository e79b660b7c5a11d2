//! WebSocket server: one task per connection.
//!
//! ```text
//! Client A ──┐                         ┌── DocumentArena ◀──▶ LogStore ◀──▶ other instances
//!             ├── Session ── Core ─────┼── SessionRegistry
//! Client B ──┘      ▲                  └── BroadcastRelay ◀──▶ bus ◀──▶ other instances
//!                   │                             │
//!                   └──── outbound channel ◀──────┘
//! ```
//!
//! The upgrade request must name the user (`?user_id=` or `X-User-ID`);
//! otherwise the handshake is refused with 400 and no session exists.
//! Each connection task selects over inbound frames, its outbound
//! channel and an idle deadline that every inbound frame pushes back.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::bus::{create_bus, MemoryBus, MessageBus};
use crate::config::ServerConfig;
use crate::error::{BusError, MalformedMessage, SyncError};
use crate::gateway::{Core, Handshake, Session};
use crate::protocol::Frame;
use crate::relay::RelayStats;
use weft_core::{LogStore, MemoryLogStore};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub commits: u64,
    pub rejected_requests: u64,
    pub malformed_frames: u64,
    pub idle_timeouts: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    core: Arc<Core>,
}

impl SyncServer {
    /// Creates a server on an explicit bus with a private document store.
    pub fn with_bus(config: ServerConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self::with_backends(config, bus, Arc::new(MemoryLogStore::new()))
    }

    /// Creates a server on an explicit bus and document store. Servers
    /// sharing one bus and one store behave as instances of one
    /// deployment.
    pub fn with_backends(config: ServerConfig, bus: Arc<dyn MessageBus>, store: Arc<dyn LogStore>) -> Self {
        let core = Arc::new(Core::with_store(config.clone(), bus, store));
        Self { config, core }
    }

    /// Creates a server on the bus selected by `config.bus`.
    pub async fn connect(config: ServerConfig) -> Result<Self, BusError> {
        let bus = create_bus(&config.bus, config.bus_capacity).await?;
        log::info!("using {} message bus", bus.name());
        Ok(Self::with_bus(config, bus))
    }

    /// Default configuration on a private in-memory bus.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let bus = Arc::new(MemoryBus::new(config.bus_capacity));
        Self::with_bus(config, bus)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Binds `config.bind_addr` and serves until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.core.start().await;
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let core = self.core.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, core).await {
                    log::warn!("Connection from {addr} ended: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, core: Arc<Core>) -> Result<(), SyncError> {
        let mut identity: Option<Handshake> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let header = req
                .headers()
                .get("x-user-id")
                .and_then(|v| v.to_str().ok());
            match Handshake::from_parts(req.uri().query(), header) {
                Ok(handshake) => {
                    identity = Some(handshake);
                    Ok(resp)
                }
                Err(e) => {
                    let mut refusal = ErrorResponse::new(Some(e.to_string()));
                    *refusal.status_mut() = StatusCode::BAD_REQUEST;
                    Err(refusal)
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                core.stats.write().await.rejected_handshakes += 1;
                log::info!("Handshake from {addr} rejected: {e}");
                return Ok(());
            }
        };
        let handshake = identity.ok_or_else(|| SyncError::TransportFailure("handshake carried no identity".into()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Arc<str>>(core.config.outbound_capacity.max(1));
        let mut session = Session::open(core.clone(), &handshake, outbound_tx).await;
        log::info!(
            "Session {} (user {}, session {}) connected from {addr}",
            session.handle().id,
            handshake.user_id,
            handshake.session_id
        );

        {
            let mut s = core.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let idle = core.config.idle_timeout();
        let deadline = tokio::time::sleep(idle);
        tokio::pin!(deadline);

        let result: Result<(), SyncError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let replies = match msg {
                        Some(Ok(Message::Text(text))) => {
                            deadline.as_mut().reset(Instant::now() + idle);
                            {
                                let mut s = core.stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            session.handle_text(text.as_str()).await
                        }
                        Some(Ok(Message::Binary(_))) => {
                            deadline.as_mut().reset(Instant::now() + idle);
                            let err = SyncError::from(MalformedMessage::new("$", "binary frames are not supported"));
                            vec![Frame::error(&err)]
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            deadline.as_mut().reset(Instant::now() + idle);
                            Vec::new()
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => Vec::new(),
                        Some(Err(e)) => break Err(e.into()),
                    };
                    let mut failed = None;
                    for frame in replies {
                        match frame.encode() {
                            Ok(text) => {
                                if let Err(e) = ws_sender.send(Message::text(text.to_string())).await {
                                    failed = Some(SyncError::from(e));
                                    break;
                                }
                            }
                            Err(e) => log::error!("Failed to encode reply frame: {e}"),
                        }
                    }
                    if let Some(e) = failed {
                        break Err(e);
                    }
                }

                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                        break Err(e.into());
                    }
                }

                _ = &mut deadline => {
                    log::info!("Session {} idle for {:?}, closing", session.handle().id, idle);
                    core.stats.write().await.idle_timeouts += 1;
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break Ok(());
                }
            }
        };

        session.close().await;
        {
            let mut s = core.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Session {} from {addr} closed", session.handle().id);
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.core.stats.read().await.clone()
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.core.relay.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.commits, 0);
        assert_eq!(server.relay_stats(), RelayStats::default());
    }

    #[tokio::test]
    async fn test_connect_with_memory_bus() {
        let server = SyncServer::connect(ServerConfig::default()).await.unwrap();
        assert_eq!(server.config().namespace, "teable");
        assert_eq!(server.core().registry.session_count().await, 0);
    }
}
