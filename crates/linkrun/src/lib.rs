//! # Linkrun
//!
//! Bidirectional module RPC over a persistent connection.
//!
//! ## Architecture
//!
//! - **Endpoint**: One live connection and all state scoped to it. Torn down
//!   as a unit when the transport ends.
//! - **Verification**: Nothing reaches modules or listeners until the
//!   accepting side's challenge has been answered.
//! - **Modules**: Named groups of methods and properties, dispatched by
//!   16-bit codes derived from their names.
//! - **Requests**: Typed request/response pairs correlated by random ids.
//! - **Listeners**: Ad-hoc handlers keyed by message kind or event tag.
//! - **Roles**: [`Hub`] accepts connections, [`Client`] initiates them and
//!   reconnects.
//!
//! Transports are supplied by the host through [`Transport`] and
//! [`Connector`]; [`mock`] has in-memory ones.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod hub;
pub mod ids;
pub mod listener;
pub mod mock;
pub mod module;
pub mod requests;
pub mod transport;
pub mod verify;

pub use client::Client;
pub use client::ClientBuilder;
pub use config::ClientConfig;
pub use config::HubConfig;
pub use endpoint::Endpoint;
pub use endpoint::EndpointEvent;
pub use endpoint::Role;
pub use error::Error;
pub use error::Fault;
pub use error::RemoteFault;
pub use error::Result;
pub use hub::Hub;
pub use hub::HubBuilder;
pub use ids::IdPool;
pub use listener::Listeners;
pub use listener::Topic;
pub use module::Module;
pub use module::ModuleHandle;
pub use module::MountError;
pub use module::Registry;
pub use module::arg;
pub use requests::Requests;
pub use transport::Connector;
pub use transport::DisconnectReason;
pub use transport::Transport;
pub use verify::Identity;
pub use verify::VerificationState;

pub use linkwire;
