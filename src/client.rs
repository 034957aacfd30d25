//! Peer endpoint
//!
//! A [`Client`] owns one UDP socket, registers with the rendezvous server,
//! resolves other peers through it and then talks to them directly. Requests
//! are correlated with responses by request id through a pending table; any
//! other inbound peer message goes to the configured [`MessageHandler`].

use crate::{
    codec::{Frame, Method, RequestIdGenerator, SnowflakeIdGenerator},
    error::{GoingError, NetworkError, Result, SerializationError},
    identity,
    message::{from_json_bytes, to_json_bytes, Message, Request, Response, StatusCode},
    network::{Peer, PeerId},
    transport::{bind_socket, Transport, TransportConfig},
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Lifecycle of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Socket bound, loops running, not yet registered
    Starting,
    /// Registration acknowledged by the server
    Registered,
    /// Peer cache seeded; serving requests and inbound messages
    Running,
    /// Socket released; no further sends
    Closed,
}

impl EndpointState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EndpointState::Starting,
            1 => EndpointState::Registered,
            2 => EndpointState::Running,
            _ => EndpointState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EndpointState::Starting => 0,
            EndpointState::Registered => 1,
            EndpointState::Running => 2,
            EndpointState::Closed => 3,
        }
    }
}

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// Hard deadline of a single request
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Reaction to an inbound peer message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, conn: Conn);
}

/// An inbound peer message together with the endpoint that received it
pub struct Conn {
    client: Client,
    frame: Frame,
}

impl Conn {
    /// Endpoint that received the message
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn message(&self) -> Result<Message> {
        from_json_bytes(&self.frame.data)
    }

    /// Send a message straight back to the sender, without asking the registry
    pub async fn reply_to_sender(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let message = self.message()?;
        let addr = message
            .from_peer
            .address
            .filter(|addr| !addr.ip().is_unspecified())
            .unwrap_or(self.frame.addr);
        self.client.send_message_to(addr, payload).await
    }
}

/// Logs every message and drops it
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle_message(&self, conn: Conn) {
        log_message(&conn);
    }
}

fn log_message(conn: &Conn) {
    match conn.message() {
        Ok(message) => info!(
            local = %conn.client().local_addr(),
            from = %message.from_peer,
            text = %message.text(),
            "message received"
        ),
        Err(e) => warn!(from = %conn.frame().addr, error = %e, "illegal message"),
    }
}

/// Logs every message and answers the sender with a fixed payload
#[derive(Debug, Clone)]
pub struct EchoHandler {
    reply: Vec<u8>,
}

impl EchoHandler {
    pub fn new(reply: impl Into<Vec<u8>>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle_message(&self, conn: Conn) {
        log_message(&conn);
        if let Err(e) = conn.reply_to_sender(self.reply.clone()).await {
            warn!(to = %conn.frame().addr, error = %e, "reply failed");
        }
    }
}

/// Handle to a peer endpoint. Cloning is cheap and shares the endpoint.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: PeerId,
    server_addr: SocketAddr,
    config: ClientConfig,
    ids: Arc<dyn RequestIdGenerator>,
    /// request id -> waiter; one entry per in-flight request
    pending: DashMap<u64, oneshot::Sender<Frame>>,
    /// Resolved peers, never invalidated
    peers: DashMap<PeerId, Peer>,
    handler: Option<Arc<dyn MessageHandler>>,
    state: AtomicU8,
    transport: Transport,
}

/// Removes a pending entry however the request ends, including when its future is dropped
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<Frame>>,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

impl Client {
    /// Create a builder for an endpoint
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Bind, register and seed the peer cache with default settings
    pub async fn connect(
        local_addr: SocketAddr,
        server_addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        Self::builder()
            .local_addr(local_addr)
            .server_addr(server_addr)
            .with_handler(handler)
            .connect()
            .await
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    /// Descriptor of this endpoint, as sent along with every message
    pub fn current_peer(&self) -> Peer {
        Peer::new(self.id(), self.local_addr())
    }

    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// Every peer in the cache
    pub fn known_peers(&self) -> Vec<Peer> {
        self.inner
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn cached_peer(&self, id: PeerId) -> Option<Peer> {
        self.inner.peers.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of requests currently waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send a request and wait for the response carrying the same request id
    pub async fn request(
        &self,
        method: Method,
        payload: impl Into<Bytes>,
        addr: SocketAddr,
    ) -> Result<Response> {
        let mut frame = Frame::new(method, payload, addr);
        let request_id = frame.ensure_request_id(self.inner.ids.as_ref());

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id, tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            request_id,
        };

        self.inner.transport.enqueue(frame).await?;

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => from_json_bytes(&response.data),
            Ok(Err(_)) => Err(NetworkError::Closed.into()),
            Err(_) => {
                debug!(request_id, method = ?method, to = %addr, "request timed out");
                Err(NetworkError::Timeout { duration: timeout }.into())
            },
        }
    }

    /// Resolve a peer, asking the registry only on a cache miss
    pub async fn resolve_peer(&self, id: PeerId) -> Result<Peer> {
        if let Some(peer) = self.cached_peer(id) {
            return Ok(peer);
        }

        let request = Request::with_body(self.id(), serde_json::to_string(&Peer::unresolved(id))?);
        let response = self
            .request(Method::ResolvePeer, to_json_bytes(&request)?, self.server_addr())
            .await?;

        match response.code {
            StatusCode::Success => {
                let peer: Peer = serde_json::from_str(&response.body)?;
                if peer.id != id || !peer.is_resolved() {
                    return Err(SerializationError::InvalidFormat {
                        expected: format!("resolved descriptor of peer {id}"),
                        actual: response.body,
                    }
                    .into());
                }
                debug!(peer = %peer, "peer resolved");
                self.inner.peers.insert(id, peer.clone());
                Ok(peer)
            },
            StatusCode::NotFound => Err(GoingError::PeerNotFound(id)),
            code => Err(GoingError::Registry {
                code,
                body: response.body,
            }),
        }
    }

    /// Fetch the whole directory from the registry and merge it into the cache
    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        let request = Request::new(self.id());
        let response = self
            .request(Method::ListPeers, to_json_bytes(&request)?, self.server_addr())
            .await?;
        if !response.is_success() {
            return Err(GoingError::Registry {
                code: response.code,
                body: response.body,
            });
        }

        let listing: BTreeMap<PeerId, String> = serde_json::from_str(&response.body)?;
        let mut peers = Vec::with_capacity(listing.len());
        for (id, addr) in listing {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    let peer = Peer::new(id, addr);
                    self.inner.peers.insert(id, peer.clone());
                    peers.push(peer);
                },
                Err(e) => warn!(peer = %id, %addr, error = %e, "skipping unparsable peer address"),
            }
        }
        Ok(peers)
    }

    /// Deliver a message to a peer, resolving it first if needed. Fire-and-forget.
    pub async fn send_message(&self, peer_id: PeerId, payload: impl Into<Vec<u8>>) -> Result<()> {
        let peer = self.resolve_peer(peer_id).await?;
        let Some(addr) = peer.address else {
            return Err(GoingError::PeerNotFound(peer_id));
        };
        self.send_message_to(addr, payload).await
    }

    /// Deliver a message to a known address. Fire-and-forget.
    pub async fn send_message_to(
        &self,
        addr: SocketAddr,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let message = Message::new(payload, self.current_peer());
        let frame = Frame::new(Method::SendMessage, to_json_bytes(&message)?, addr);
        self.inner.transport.enqueue(frame).await
    }

    /// Release the socket. Requests still in flight fail with [`NetworkError::Closed`].
    pub fn close(&self) {
        let previous = self.inner.set_state(EndpointState::Closed);
        self.inner.transport.close();
        self.inner.pending.clear();
        if previous != EndpointState::Closed {
            info!(peer = %self.id(), addr = %self.local_addr(), "endpoint closed");
        }
    }

    async fn register(&self) -> Result<()> {
        let request = Request::new(self.id());
        let response = self
            .request(Method::Register, to_json_bytes(&request)?, self.server_addr())
            .await?;
        if !response.is_success() {
            return Err(GoingError::Registry {
                code: response.code,
                body: response.body,
            });
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.register().await?;
        self.inner.set_state(EndpointState::Registered);
        debug!(peer = %self.id(), server = %self.server_addr(), "registered");

        let peers = self.list_peers().await?;
        self.inner.set_state(EndpointState::Running);
        info!(
            peer = %self.id(),
            addr = %self.local_addr(),
            known_peers = peers.len(),
            "endpoint running"
        );
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("local_addr", &self.local_addr())
            .field("server_addr", &self.server_addr())
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    fn set_state(&self, state: EndpointState) -> EndpointState {
        EndpointState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel))
    }

    /// Runs on the read loop: wake the matching waiter, or hand peer messages to the handler
    fn dispatch(self: &Arc<Self>, frame: Frame) {
        if let Some((_, waiter)) = self.pending.remove(&frame.request_id) {
            if waiter.send(frame).is_err() {
                debug!("response arrived after its waiter gave up");
            }
            return;
        }

        if frame.method == Method::SendMessage {
            match &self.handler {
                Some(handler) => {
                    let handler = handler.clone();
                    let conn = Conn {
                        client: Client {
                            inner: self.clone(),
                        },
                        frame,
                    };
                    tokio::spawn(async move { handler.handle_message(conn).await });
                },
                None => debug!(from = %frame.addr, "no message handler, dropping message"),
            }
            return;
        }

        if frame.addr == self.server_addr {
            debug!(
                request_id = frame.request_id,
                method = ?frame.method,
                "dropping unmatched registry frame"
            );
        } else {
            debug!(
                request_id = frame.request_id,
                method = ?frame.method,
                from = %frame.addr,
                "dropping unexpected frame"
            );
        }
    }
}

/// Builder for peer endpoints
pub struct ClientBuilder {
    id: Option<PeerId>,
    local_addr: SocketAddr,
    server_addr: Option<SocketAddr>,
    ids: Option<Arc<dyn RequestIdGenerator>>,
    handler: Option<Arc<dyn MessageHandler>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new endpoint builder
    pub fn new() -> Self {
        Self {
            id: None,
            local_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            server_addr: None,
            ids: None,
            handler: None,
            config: ClientConfig::default(),
        }
    }

    /// Set the peer id instead of deriving it from the local address
    pub fn with_id(mut self, id: PeerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the local address to bind
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    /// Set the rendezvous server address
    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = Some(addr);
        self
    }

    /// Set the request id source
    pub fn with_id_generator(mut self, ids: Arc<dyn RequestIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Set the handler for inbound peer messages
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the endpoint configuration
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Bind, start the socket loops, register and seed the peer cache.
    ///
    /// The endpoint is only returned once it is running; on any failure it is
    /// closed and the error returned.
    pub async fn connect(self) -> Result<Client> {
        let server_addr = self
            .server_addr
            .ok_or_else(|| GoingError::config("rendezvous server address is required"))?;
        let id = match self.id {
            Some(id) => id,
            None => identity::derive_peer_id()?,
        };
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(SnowflakeIdGenerator::new()));

        let socket = bind_socket(self.local_addr).await?;
        let local_addr = socket.local_addr()?;
        let config = self.config;
        let handler = self.handler;

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let weak = weak.clone();
            let transport =
                Transport::start(socket, local_addr, &config.transport, ids.clone(), move |frame| {
                    if let Some(inner) = weak.upgrade() {
                        inner.dispatch(frame);
                    }
                });
            ClientInner {
                id,
                server_addr,
                config,
                ids,
                pending: DashMap::new(),
                peers: DashMap::new(),
                handler,
                state: AtomicU8::new(EndpointState::Starting.as_u8()),
                transport,
            }
        });
        let client = Client { inner };
        debug!(peer = %id, addr = %local_addr, "endpoint starting");

        if let Err(e) = client.start().await {
            warn!(peer = %id, server = %server_addr, error = %e, "endpoint startup failed");
            client.close();
            return Err(e);
        }
        Ok(client)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
