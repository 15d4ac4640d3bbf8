//! # Hub
//!
//! The accepting role. A hub turns each accepted transport into an
//! [`Endpoint`], challenges it for verification and tracks it until it
//! disconnects. Endpoints are indexed by transport token; lookups by the
//! announced id or name only see verified endpoints.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::info;
use tracing::warn;

use crate::config::HubConfig;
use crate::endpoint::Endpoint;
use crate::endpoint::EndpointEvent;
use crate::endpoint::Hook;
use crate::endpoint::Side;
use crate::error::Error;
use crate::error::Result;
use crate::transport::DisconnectReason;
use crate::transport::Transport;

const EVENT_CAPACITY: usize = 64;

struct HubInner {
    config: HubConfig,
    endpoints: DashMap<String, Endpoint>,
    events: broadcast::Sender<EndpointEvent>,
    on_accept: Option<Hook>,
    on_verified: Option<Hook>,
}

/// Fluent builder for a [`Hub`].
pub struct HubBuilder {
    config: HubConfig,
    on_accept: Option<Hook>,
    on_verified: Option<Hook>,
}

impl HubBuilder {
    /// Runs for every accepted endpoint before it starts reading, so
    /// listeners, handlers and modules installed here see all traffic.
    pub fn on_accept<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.on_accept = Some(Arc::new(f));
        self
    }

    /// Runs when an endpoint completes verification, before the
    /// `Verified` event is published.
    pub fn on_verified<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.on_verified = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Hub {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Hub {
            inner: Arc::new(HubInner {
                config: self.config,
                endpoints: DashMap::new(),
                events,
                on_accept: self.on_accept,
                on_verified: self.on_verified,
            }),
        }
    }
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder { config, on_accept: None, on_verified: None }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.inner.events.subscribe()
    }

    /// Takes ownership of a freshly connected transport and starts serving it.
    ///
    /// A transport whose token is already registered is refused and
    /// disconnected; the endpoint holding that token is left alone.
    pub fn accept(&self, transport: Box<dyn Transport>) -> Result<Endpoint> {
        let token = transport.token().to_string();
        let (endpoint, outbound) = match self.inner.endpoints.entry(token) {
            Entry::Occupied(slot) => {
                warn!(token = %slot.key(), "refusing transport with a token already in use");
                let token = slot.key().clone();
                drop(slot);
                tokio::spawn(async move {
                    transport.disconnect(DisconnectReason::Error("duplicate token".into())).await;
                });
                return Err(Error::DuplicateToken(token));
            }
            Entry::Vacant(slot) => {
                let side = Side::Accepting { challenge_delay: self.inner.config.verification_delay };
                let (endpoint, outbound) = Endpoint::new(
                    transport,
                    side,
                    self.inner.events.clone(),
                    self.inner.on_verified.clone(),
                );
                slot.insert(endpoint.clone());
                (endpoint, outbound)
            }
        };

        info!(token = %endpoint.token(), remote = ?endpoint.remote_addr(), "endpoint accepted");

        if let Some(setup) = &self.inner.on_accept {
            setup(&endpoint);
        }

        let registry = Arc::downgrade(&self.inner);
        endpoint.start(
            outbound,
            Some(Box::new(move |closed: &Endpoint| {
                if let Some(inner) = registry.upgrade() {
                    inner.endpoints.remove_if(closed.token(), |_, e| e.ptr_eq(closed));
                }
            })),
        );

        Ok(endpoint)
    }

    pub fn by_token(&self, token: &str) -> Option<Endpoint> {
        self.inner.endpoints.get(token).map(|e| e.value().clone())
    }

    pub fn by_id(&self, id: &str) -> Option<Endpoint> {
        self.find(|e| e.id() == Some(id))
    }

    pub fn by_name(&self, name: &str) -> Option<Endpoint> {
        self.find(|e| e.name() == Some(name))
    }

    fn find(&self, pred: impl Fn(&Endpoint) -> bool) -> Option<Endpoint> {
        self.inner
            .endpoints
            .iter()
            .find(|entry| entry.value().is_verified() && pred(entry.value()))
            .map(|entry| entry.value().clone())
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.endpoints.is_empty()
    }

    /// Disconnects every endpoint and waits for each teardown.
    pub async fn stop(&self) {
        let endpoints = self.endpoints();
        for endpoint in &endpoints {
            endpoint.disconnect(DisconnectReason::Requested).await;
        }
        for endpoint in &endpoints {
            endpoint.closed().await;
        }
        info!(count = endpoints.len(), "hub stopped");
    }
}
