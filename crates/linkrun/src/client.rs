//! # Client
//!
//! The initiating role. A client connects through a [`Connector`], answers
//! the verification challenge with the identity from its [`ClientConfig`],
//! and, when configured to, reconnects after the connection ends.
//!
//! Every connection gets a new [`Endpoint`]. The `on_connect` hook runs on
//! each one before it starts reading, which is where listeners, request
//! handlers and modules are installed again.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::endpoint::EndpointEvent;
use crate::endpoint::Hook;
use crate::endpoint::Side;
use crate::endpoint::lock;
use crate::error::Result;
use crate::transport::Connector;
use crate::transport::DisconnectReason;

const EVENT_CAPACITY: usize = 64;

struct ClientInner {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    on_connect: Option<Hook>,
    on_verified: Option<Hook>,
    events: broadcast::Sender<EndpointEvent>,
    current: RwLock<Option<Endpoint>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Fluent builder for a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    on_connect: Option<Hook>,
    on_verified: Option<Hook>,
}

impl ClientBuilder {
    /// Runs on every new endpoint before it starts reading.
    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Runs once per connection, after the challenge has been answered.
    pub fn on_verified<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.on_verified = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                connector: self.connector,
                on_connect: self.on_connect,
                on_verified: self.on_verified,
                events,
                current: RwLock::new(None),
                supervisor: Mutex::new(None),
            }),
        })
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(config: ClientConfig, connector: impl Connector) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: Box::new(connector),
            on_connect: None,
            on_verified: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.inner.events.subscribe()
    }

    /// The live endpoint, if connected.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner
            .current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint().is_some_and(|e| e.is_verified() && !e.is_closed())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.supervisor)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Makes a single connection attempt without supervision.
    pub async fn connect(&self) -> Result<Endpoint> {
        ClientInner::connect(&self.inner).await
    }

    /// Starts connecting in the background, retrying failed attempts and,
    /// if configured, reconnecting after disconnects. No-op while running.
    pub fn start(&self) {
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *supervisor = Some(tokio::spawn(supervise(self.inner.clone())));
    }

    /// Drops the current connection and starts over on a fresh endpoint.
    pub async fn reconnect(&self) {
        self.stop().await;
        self.start();
    }

    /// Stops supervision and disconnects the current endpoint.
    pub async fn stop(&self) {
        if let Some(task) = lock(&self.inner.supervisor).take() {
            task.abort();
        }
        if let Some(endpoint) = self.endpoint() {
            endpoint.disconnect(DisconnectReason::Requested).await;
            endpoint.closed().await;
        }
    }
}

impl ClientInner {
    async fn connect(inner: &Arc<Self>) -> Result<Endpoint> {
        let config = &inner.config;
        config.validate()?;

        let transport = inner.connector.connect(&config.address).await?;
        let side = Side::Initiating { announce: config.identity() };
        let (endpoint, outbound) = Endpoint::new(
            transport,
            side,
            inner.events.clone(),
            inner.on_verified.clone(),
        );

        info!(token = %endpoint.token(), address = %config.address, "connected");

        if let Some(setup) = &inner.on_connect {
            setup(&endpoint);
        }
        *inner.current.write().unwrap_or_else(|p| p.into_inner()) = Some(endpoint.clone());

        let weak = Arc::downgrade(inner);
        endpoint.start(
            outbound,
            Some(Box::new(move |closed: &Endpoint| {
                if let Some(inner) = weak.upgrade() {
                    let mut current = inner.current.write().unwrap_or_else(|p| p.into_inner());
                    if current.as_ref().is_some_and(|e| e.ptr_eq(closed)) {
                        *current = None;
                    }
                }
            })),
        );

        Ok(endpoint)
    }
}

async fn supervise(inner: Arc<ClientInner>) {
    loop {
        let endpoint = loop {
            match ClientInner::connect(&inner).await {
                Ok(endpoint) => break endpoint,
                Err(e) => {
                    error!(address = %inner.config.address, error = %e, "connection attempt failed");
                    tokio::time::sleep(inner.config.reconnect_delay).await;
                }
            }
        };

        endpoint.closed().await;

        if !inner.config.reconnect {
            info!(address = %inner.config.address, "connection ended, reconnect disabled");
            return;
        }
        info!(address = %inner.config.address, "connection ended, reconnecting");
    }
}
