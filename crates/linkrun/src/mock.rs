//! In-memory transports for tests and local wiring.
//!
//! Frames sent on one half of a [`DuplexTransport`] pair arrive on the other.
//! Disconnecting either half ends the stream on both.

use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::endpoint::lock;
use crate::endpoint::wait_closed;
use crate::hub::Hub;
use crate::transport;
use crate::transport::Connector;
use crate::transport::DisconnectReason;
use crate::transport::Transport;

pub struct DuplexTransport {
    token: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    latency: Option<Duration>,
}

impl DuplexTransport {
    /// Creates two connected halves sharing one token.
    pub fn pair(token: impl Into<String>) -> (Self, Self) {
        let token = token.into();
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self::half(token.clone(), tx_a, rx_b);
        let b = Self::half(token, tx_b, rx_a);
        (a, b)
    }

    fn half(token: String, tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            token,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed,
            latency: None,
        }
    }

    /// Reports a fixed latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    fn token(&self) -> &str {
        &self.token
    }

    fn latency(&self) -> Option<Duration> {
        self.latency
    }

    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = lock(&self.tx);
        match tx.as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| transport::Error::ConnectionLost("Channel closed".into())),
            None => Err(transport::Error::ConnectionLost("Disconnected".into())),
        }
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = wait_closed(closed) => Ok(None),
        }
    }

    async fn disconnect(&self, _reason: DisconnectReason) {
        lock(&self.tx).take();
        self.closed.send_replace(true);
    }
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

/// Connects by handing the far half of a fresh pair to a [`Hub`].
///
/// Tokens are numbered across every connector in the process, so several
/// connectors can share one hub.
pub struct MemoryConnector {
    hub: Hub,
    attempts: AtomicUsize,
    failures: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str) -> transport::Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(transport::Error::ConnectFailed(format!("{} refused", address)));
        }

        let token = format!("mem-{}", NEXT_TOKEN.fetch_add(1, Ordering::SeqCst));
        let (client, server) = DuplexTransport::pair(token);
        self.hub
            .accept(Box::new(server))
            .map_err(|e| transport::Error::ConnectFailed(e.to_string()))?;
        Ok(Box::new(client))
    }
}
