//! Rendezvous registry server
//!
//! Holds the directory of `peer id -> address` and answers the registry
//! protocol. It never sends peer-to-peer traffic itself.

use crate::{
    codec::{Frame, Method, SequentialIdGenerator},
    error::Result,
    message::{from_json_bytes, to_json_bytes, Request, Response, StatusCode},
    network::{Peer, PeerId},
    transport::{bind_socket, Transport, TransportConfig},
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registry server configuration
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub transport: TransportConfig,
}

/// Handle to a running registry server
pub struct RegistryServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    /// Registered peers; last registration wins
    clients: RwLock<HashMap<PeerId, SocketAddr>>,
    transport: Transport,
}

impl RegistryServer {
    /// Bind the server socket and start serving
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, ServerConfig::default()).await
    }

    /// Bind the server socket with a custom configuration and start serving
    pub async fn bind_with_config(addr: SocketAddr, config: ServerConfig) -> Result<Self> {
        let socket = bind_socket(addr).await?;
        let local_addr = socket.local_addr()?;

        // The server only sends `Method::Response` frames, which keep the id they echo.
        let ids = Arc::new(SequentialIdGenerator::new());
        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let weak = weak.clone();
            let on_frame = move |frame: Frame| {
                if let Some(inner) = weak.upgrade() {
                    tokio::spawn(async move { inner.handle(frame).await });
                }
            };
            let transport = Transport::start(socket, local_addr, &config.transport, ids, on_frame);
            ServerInner {
                clients: RwLock::new(HashMap::new()),
                transport,
            }
        });

        info!(addr = %local_addr, "registry server listening");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    /// Snapshot of the directory
    pub async fn peers(&self) -> HashMap<PeerId, SocketAddr> {
        self.inner.clients.read().await.clone()
    }

    /// Address currently registered for `id`
    pub async fn lookup(&self, id: PeerId) -> Option<SocketAddr> {
        self.inner.clients.read().await.get(&id).copied()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    /// Stop both socket loops and release the socket
    pub fn close(&self) {
        info!(addr = %self.local_addr(), "registry server closing");
        self.inner.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.transport.is_closed()
    }
}

impl ServerInner {
    async fn handle(&self, frame: Frame) {
        let response = match frame.method {
            Method::Register => self.handle_register(&frame).await,
            Method::ListPeers => self.handle_list_peers().await,
            Method::ResolvePeer => self.handle_resolve_peer(&frame).await,
            other => {
                debug!(method = ?other, from = %frame.addr, "ignoring non-registry method");
                return;
            },
        };
        self.respond(&frame, response).await;
    }

    async fn handle_register(&self, frame: &Frame) -> Response {
        let request: Request = match from_json_bytes(&frame.data) {
            Ok(request) => request,
            Err(e) => {
                return Response::error(
                    StatusCode::InvalidParam,
                    format!("invalid registry request body: {e}"),
                )
            },
        };

        let previous = self.clients.write().await.insert(request.id, frame.addr);
        match previous {
            Some(old) if old != frame.addr => {
                info!(peer = %request.id, addr = %frame.addr, %old, "peer re-registered")
            },
            _ => info!(peer = %request.id, addr = %frame.addr, "peer registered"),
        }
        Response::success("")
    }

    async fn handle_list_peers(&self) -> Response {
        let listing: BTreeMap<PeerId, String> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(id, addr)| (*id, addr.to_string()))
            .collect();

        match serde_json::to_string(&listing) {
            Ok(body) => Response::success(body),
            Err(e) => {
                warn!(error = %e, "failed to serialize peer listing");
                Response::error(StatusCode::InternalError, "marshal peers failed")
            },
        }
    }

    async fn handle_resolve_peer(&self, frame: &Frame) -> Response {
        let request: Request = match from_json_bytes(&frame.data) {
            Ok(request) => request,
            Err(e) => {
                return Response::error(
                    StatusCode::InvalidParam,
                    format!("invalid resolve peer body: {e}"),
                )
            },
        };
        let target: Peer = match serde_json::from_str(&request.body) {
            Ok(peer) => peer,
            Err(e) => {
                return Response::error(
                    StatusCode::InvalidParam,
                    format!("invalid peer descriptor: {e}"),
                )
            },
        };

        let found = self.clients.read().await.get(&target.id).copied();
        match found {
            Some(addr) => match serde_json::to_string(&Peer::new(target.id, addr)) {
                Ok(body) => Response::success(body),
                Err(e) => Response::error(StatusCode::InternalError, e.to_string()),
            },
            None => {
                debug!(requester = %request.id, peer = %target.id, "resolve miss");
                Response::error(StatusCode::NotFound, format!("peer {} not found", target.id))
            },
        }
    }

    async fn respond(&self, request: &Frame, response: Response) {
        let data = match to_json_bytes(&response) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to encode response");
                return;
            },
        };
        let frame = Frame::reply(Method::Response, request.request_id, data, request.addr);
        if let Err(e) = self.transport.enqueue(frame).await {
            warn!(
                to = %request.addr,
                request_id = request.request_id,
                error = %e,
                "response not sent"
            );
        }
    }
}
