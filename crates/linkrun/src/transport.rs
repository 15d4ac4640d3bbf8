//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between two endpoints.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about modules, requests or
//!   verification. It moves opaque, already framed buffers.
//! - **Connection-Scoped**: One Transport is one live connection. It ends when
//!   `recv` yields `None`, and is never reused afterwards.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// A connection attempt was refused or could not be routed.
    ConnectFailed(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::ConnectFailed(msg) => write!(f, "Connect failed: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// This side asked for the disconnect.
    Requested,
    /// The remote side closed the connection.
    Remote,
    /// The transport gave up on an unresponsive peer.
    Timeout,
    /// The transport failed.
    Error(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Remote => write!(f, "closed by remote"),
            Self::Timeout => write!(f, "timed out"),
            Self::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// One live, framed, bidirectional connection.
///
/// Object-safe; endpoints hold it as `Arc<dyn Transport>`.
///
/// # invariants
/// - `send` preserves order per connection and may be called while a `recv`
///   is pending on another task.
/// - `recv` returns `Ok(None)` once the connection is closed, by either side.
/// - `disconnect` must cause a pending or future `recv` to return `Ok(None)`.
/// - `token` is assigned when the connection is made and never changes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opaque identity of this connection, unique among live connections.
    fn token(&self) -> &str;

    /// Last measured round-trip time, if the transport tracks one.
    fn latency(&self) -> Option<Duration> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Sends one frame.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next frame, or `None` once the connection has closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the connection.
    async fn disconnect(&self, reason: DisconnectReason);
}

/// Opens outbound connections for the initiating side.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>>;
}

#[async_trait::async_trait]
impl<C: Connector> Connector for std::sync::Arc<C> {
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>> {
        (**self).connect(address).await
    }
}
