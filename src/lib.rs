//! Going - a minimal UDP peer-to-peer overlay
//!
//! A rendezvous [`RegistryServer`] maps peer ids to addresses; a peer
//! [`Client`] registers with it, resolves other peers through it and then
//! exchanges messages with them directly.

// Modules
pub mod client;
pub mod codec;
pub mod error;
pub mod identity;
pub mod message;
pub mod network;
pub mod server;
pub mod transport;

// Re-exports
pub use client::{
    Client, ClientBuilder, ClientConfig, Conn, EchoHandler, EndpointState, LoggingHandler,
    MessageHandler,
};
pub use codec::{Frame, Method, RequestIdGenerator, SequentialIdGenerator, SnowflakeIdGenerator};
pub use error::{GoingError, Result};
pub use message::{Message, Request, Response, StatusCode};
pub use network::{Peer, PeerId};
pub use server::{RegistryServer, ServerConfig};
pub use transport::TransportConfig;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Default port of the rendezvous server
pub const DEFAULT_SERVER_PORT: u16 = 9191;
