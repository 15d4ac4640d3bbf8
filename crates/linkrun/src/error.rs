//! # Error Definitions
//!
//! Failures surfaced to application code by endpoint operations.
//!
//! Inbound traffic that cannot be delivered (an unverified endpoint, an
//! unknown method or property code, an unknown correlation id) is not an
//! error of any call; it is logged and dropped where it is received.

use crate::module::MountError;
use crate::transport;

#[derive(Debug, Clone)]
pub enum Error {
    Transport(transport::Error),
    Wire(linkwire::Error),
    Mount(MountError),
    /// A configuration value was missing or out of range.
    Config(String),
    /// The endpoint has closed; nothing more can be sent on it.
    Disconnected,
    /// An awaited call exceeded its deadline. The remote side is not told.
    Timeout,
    /// The remote method failed; carries its rendering of the failure.
    Remote(RemoteFault),
    /// No remote-visible property of that name exists on the module.
    UnknownProperty(String),
    /// A hub already serves an endpoint with this transport token.
    DuplicateToken(String),
    /// A method or property name was blank.
    InvalidName,
    /// The remote handler could not produce a response for request `id`.
    Request { id: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Mount(e) => write!(f, "Mount error: {}", e),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Disconnected => write!(f, "Endpoint disconnected"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Remote(fault) => write!(f, "Remote failure: {}", fault),
            Self::UnknownProperty(name) => write!(f, "Unknown property: {}", name),
            Self::DuplicateToken(token) => write!(f, "Token already in use: {}", token),
            Self::InvalidName => write!(f, "Name must not be blank"),
            Self::Request { id } => write!(f, "Request {} has failed", id),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Wire(e) => Some(e),
            Self::Mount(e) => Some(e),
            _ => None,
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<linkwire::Error> for Error {
    fn from(e: linkwire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<MountError> for Error {
    fn from(e: MountError) -> Self {
        Self::Mount(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The failure text a remote method reported instead of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault(pub String);

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for RemoteFault {}

/// Returned by module methods and request handlers that cannot complete.
///
/// The rendering is what the caller on the other side receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault(String);

impl Fault {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }

    /// Renders a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self(format!("panic: {}", msg))
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Fault {}

impl From<&str> for Fault {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for Fault {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<linkwire::Error> for Fault {
    fn from(e: linkwire::Error) -> Self {
        Self(e.to_string())
    }
}
