//! # Endpoint with Async Pump
//!
//! An `Endpoint` is one live connection and every piece of RPC state scoped to
//! it: the verification state, the correlation table, the listener registry
//! and the mounted modules.
//!
//! Two tasks drive it. The writer drains an unbounded outbound queue into the
//! transport, so `send` never blocks and can be called from synchronous
//! handler code. The pump reads frames, decodes them and dispatches each one
//! to completion before reading the next, so handlers observe messages in
//! arrival order.
//!
//! ## Lifecycle
//!
//! Created on connect, started once, torn down when the transport ends.
//! Teardown stops every module and clears every table *before* the
//! disconnected event is raised. A reconnect always makes a new Endpoint.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use linkwire::Message;
use linkwire::Payload;
use linkwire::PayloadType;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::listener::Listeners;
use crate::module::Module;
use crate::module::ModuleHandle;
use crate::module::ModuleSlot;
use crate::module::MountError;
use crate::requests::Requests;
use crate::transport::DisconnectReason;
use crate::transport::Transport;
use crate::verify::Identity;
use crate::verify::VerificationState;

/// Which side of the handshake an endpoint plays.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Issues the verification challenge and records the announced identity.
    Accepting,
    /// Answers the challenge with its own identity.
    Initiating,
}

/// Lifecycle notifications, published on the owning hub's or client's channel.
#[derive(Clone, Debug)]
pub enum EndpointEvent {
    /// Raised exactly once per connection, when verification completes.
    Verified(Endpoint),
    /// Raised after teardown, once every table has been cleared.
    Disconnected(Endpoint, DisconnectReason),
}

pub(crate) type Hook = Arc<dyn Fn(&Endpoint) + Send + Sync>;
pub(crate) type CloseHook = Box<dyn FnOnce(&Endpoint) + Send>;

#[derive(Clone, Debug)]
pub(crate) enum Side {
    Accepting { challenge_delay: Duration },
    Initiating { announce: Identity },
}

/// The outbound half shared by everything that sends on an endpoint.
pub(crate) struct Outbox {
    token: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
    invocation_clock: AtomicI32,
}

impl Outbox {
    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    /// Encodes and queues a message. Fails once the endpoint has closed.
    pub(crate) fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        let frame = linkwire::encode(message)?;
        self.tx.send(frame).map_err(|_| Error::Disconnected)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Invocation ids are unique across all modules of the endpoint, since
    /// results do not name the module they belong to.
    pub(crate) fn next_invocation_id(&self) -> i32 {
        self.invocation_clock.fetch_add(1, Ordering::Relaxed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub(crate) struct Mounted {
    instance: Arc<dyn Any + Send + Sync>,
    slot: Arc<ModuleSlot>,
}

struct Shared {
    outbox: Arc<Outbox>,
    side: Side,
    transport: Arc<dyn Transport>,
    verified: AtomicBool,
    identity: OnceLock<Identity>,
    requests: Requests,
    listeners: Listeners,
    modules: RwLock<HashMap<TypeId, Mounted>>,
    events: broadcast::Sender<EndpointEvent>,
    on_verified: Option<Hook>,
    local_reason: Mutex<Option<DisconnectReason>>,
    closed: watch::Sender<bool>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// A handle to one live connection. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("token", &self.token())
            .field("role", &self.role())
            .field("verified", &self.is_verified())
            .field("identity", &self.identity())
            .finish()
    }
}

impl Endpoint {
    /// Creates an endpoint that is not yet running. Callers install handlers
    /// and modules, then call `start` with the returned queue.
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        side: Side,
        events: broadcast::Sender<EndpointEvent>,
        on_verified: Option<Hook>,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Arc::new(Outbox {
            token: transport.token().to_string(),
            tx,
            closed: AtomicBool::new(false),
            invocation_clock: AtomicI32::new(0),
        });
        let (closed, _) = watch::channel(false);

        let shared = Shared {
            requests: Requests::new(outbox.clone()),
            listeners: Listeners::new(outbox.clone()),
            outbox,
            side,
            transport,
            verified: AtomicBool::new(false),
            identity: OnceLock::new(),
            modules: RwLock::new(HashMap::new()),
            events,
            on_verified,
            local_reason: Mutex::new(None),
            closed,
            writer: Mutex::new(None),
        };

        (Self { shared: Arc::new(shared) }, rx)
    }

    /// Spawns the writer and the pump. The accepting side also schedules the
    /// verification challenge.
    pub(crate) fn start(&self, outbound: mpsc::UnboundedReceiver<Vec<u8>>, on_closed: Option<CloseHook>) {
        let writer = tokio::spawn(write_loop(
            self.shared.transport.clone(),
            outbound,
            self.token().to_string(),
        ));
        *lock(&self.shared.writer) = Some(writer);

        tokio::spawn(self.clone().pump(on_closed));

        if let Side::Accepting { challenge_delay } = &self.shared.side {
            let endpoint = self.clone();
            let delay = *challenge_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !endpoint.is_closed() {
                    endpoint.send_challenge();
                }
            });
        }
    }

    // ------------------------------------------------------------------
    //  Identity
    // ------------------------------------------------------------------

    /// Transport-assigned identity of the connection.
    pub fn token(&self) -> &str {
        self.shared.outbox.token()
    }

    pub fn role(&self) -> Role {
        match self.shared.side {
            Side::Accepting { .. } => Role::Accepting,
            Side::Initiating { .. } => Role::Initiating,
        }
    }

    /// The identity the remote side announced. Only the accepting side
    /// learns one, and only once verified.
    pub fn identity(&self) -> Option<&Identity> {
        self.shared.identity.get()
    }

    pub fn id(&self) -> Option<&str> {
        self.identity().map(|i| i.id.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.identity().map(|i| i.name.as_str())
    }

    pub fn port(&self) -> Option<i32> {
        self.identity().map(|i| i.port)
    }

    pub fn is_verified(&self) -> bool {
        self.shared.verified.load(Ordering::Acquire)
    }

    pub fn verification_state(&self) -> VerificationState {
        if self.is_verified() {
            VerificationState::Verified
        } else {
            VerificationState::Unverified
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        self.shared.transport.latency()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.transport.remote_addr()
    }

    /// True if both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // ------------------------------------------------------------------
    //  Outbound
    // ------------------------------------------------------------------

    /// Queues a message for the remote side.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.shared.outbox.send(&message.into())
    }

    /// Sends `body` as a one-way event.
    pub fn emit<T: PayloadType>(&self, body: &T) -> Result<()> {
        self.send(Message::Event(Payload::pack(body)?))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.outbox.is_closed()
    }

    /// Asks the transport to close the connection. Teardown follows once the
    /// pump observes the end of the stream.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        {
            let mut local = lock(&self.shared.local_reason);
            if local.is_none() {
                *local = Some(reason.clone());
            }
        }
        self.shared.transport.disconnect(reason).await;
    }

    /// Resolves once teardown has completed.
    pub async fn closed(&self) {
        wait_closed(self.shared.closed.subscribe()).await;
    }

    pub fn requests(&self) -> &Requests {
        &self.shared.requests
    }

    pub fn listeners(&self) -> &Listeners {
        &self.shared.listeners
    }

    // ------------------------------------------------------------------
    //  Modules
    // ------------------------------------------------------------------

    /// Builds the module's dispatch tables, mounts it and calls its `start`.
    ///
    /// At most one module of each type is mounted at a time.
    pub fn mount<M: Module>(&self, module: M) -> Result<ModuleHandle<M>> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        if self.modules_read().contains_key(&TypeId::of::<M>()) {
            return Err(MountError::AlreadyMounted(module.name().to_string()).into());
        }

        let module = Arc::new(module);
        let slot = Arc::new(ModuleSlot::build(module.clone(), self.token())?);

        {
            let mut modules = self.modules_write();
            if modules.contains_key(&TypeId::of::<M>()) {
                return Err(MountError::AlreadyMounted(slot.name().to_string()).into());
            }
            modules.insert(TypeId::of::<M>(), Mounted {
                instance: module.clone(),
                slot: slot.clone(),
            });
        }

        let handle = ModuleHandle::new(module, slot, self.shared.outbox.clone());
        info!(
            token = %self.token(),
            module = %handle.name(),
            code = handle.code(),
            "module mounted"
        );
        handle.module().start(&handle);
        Ok(handle)
    }

    /// Returns the mounted module of type `M`, mounting a default one first
    /// if there is none.
    pub fn mount_default<M: Module + Default>(&self) -> Result<ModuleHandle<M>> {
        match self.module::<M>() {
            Some(handle) => Ok(handle),
            None => self.mount(M::default()),
        }
    }

    pub fn module<M: Module>(&self) -> Option<ModuleHandle<M>> {
        let modules = self.modules_read();
        let mounted = modules.get(&TypeId::of::<M>())?;
        let module = mounted.instance.clone().downcast::<M>().ok()?;
        Some(ModuleHandle::new(module, mounted.slot.clone(), self.shared.outbox.clone()))
    }

    /// Stops the module of type `M` and clears its tables.
    pub fn unmount<M: Module>(&self) -> bool {
        let removed = self.modules_write().remove(&TypeId::of::<M>());
        match removed {
            Some(mounted) => {
                mounted.slot.shutdown();
                info!(token = %self.token(), module = %mounted.slot.name(), "module unmounted");
                true
            }
            None => false,
        }
    }

    /// Stops every module. Returns how many were mounted.
    pub fn unmount_all(&self) -> usize {
        let drained: Vec<Mounted> = self.modules_write().drain().map(|(_, m)| m).collect();
        for mounted in &drained {
            mounted.slot.shutdown();
        }
        drained.len()
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules_read()
            .values()
            .map(|m| m.slot.name().to_string())
            .collect()
    }

    fn modules_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TypeId, Mounted>> {
        self.shared.modules.read().unwrap_or_else(|p| p.into_inner())
    }

    fn modules_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TypeId, Mounted>> {
        self.shared.modules.write().unwrap_or_else(|p| p.into_inner())
    }

    fn slots(&self) -> Vec<Arc<ModuleSlot>> {
        self.modules_read().values().map(|m| m.slot.clone()).collect()
    }

    // ------------------------------------------------------------------
    //  Verification plumbing
    // ------------------------------------------------------------------

    pub(crate) fn side(&self) -> &Side {
        &self.shared.side
    }

    /// Flips to verified. Returns false if the endpoint already was.
    pub(crate) fn mark_verified(&self, identity: Option<Identity>) -> bool {
        let flipped = self
            .shared
            .verified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            if let Some(identity) = identity {
                let _ = self.shared.identity.set(identity);
            }
        }
        flipped
    }

    pub(crate) fn raise_verified(&self) {
        if let Some(hook) = &self.shared.on_verified {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(self))).is_err() {
                error!(token = %self.token(), "verified hook panicked");
            }
        }
        let _ = self.shared.events.send(EndpointEvent::Verified(self.clone()));
    }

    // ------------------------------------------------------------------
    //  Inbound
    // ------------------------------------------------------------------

    async fn pump(self, on_closed: Option<CloseHook>) {
        let reason = loop {
            match self.shared.transport.recv().await {
                Ok(Some(frame)) => match linkwire::decode(&frame) {
                    Ok(message) => self.dispatch(message),
                    Err(e) => warn!(token = %self.token(), error = %e, "dropping undecodable frame"),
                },
                Ok(None) => {
                    break lock(&self.shared.local_reason)
                        .take()
                        .unwrap_or(DisconnectReason::Remote);
                }
                Err(e) => {
                    warn!(token = %self.token(), error = %e, "transport error in pump");
                    break DisconnectReason::Error(e.to_string());
                }
            }
        };

        self.teardown(reason, on_closed);
    }

    /// Routes one inbound message. Nothing here returns an error to the
    /// sender; undeliverable traffic is logged and dropped.
    pub(crate) fn dispatch(&self, message: Message) {
        debug!(token = %self.token(), kind = %message.kind(), "processing message");

        if !self.is_verified() {
            self.verify(message);
            return;
        }

        match &message {
            Message::Request(request) => self.shared.requests.handle_request(request),
            Message::Response(response) => self.shared.requests.handle_response(response.clone()),
            _ => {}
        }

        self.shared.listeners.dispatch(&message);

        let mut claimed = false;
        for slot in self.slots() {
            claimed |= slot.dispatch(&self.shared.outbox, &message);
        }

        if let Message::InvokeMethodResult(result) = &message {
            if !claimed {
                debug!(
                    token = %self.token(),
                    invocation_id = result.invocation_id,
                    "no pending invocation for result, ignoring"
                );
            }
        }
    }

    fn teardown(&self, reason: DisconnectReason, on_closed: Option<CloseHook>) {
        self.shared.outbox.close();

        let stopped = self.unmount_all();
        self.shared.requests.clear();
        self.shared.listeners.clear();

        if let Some(writer) = lock(&self.shared.writer).take() {
            writer.abort();
        }

        info!(token = %self.token(), reason = %reason, modules = stopped, "endpoint disconnected");

        if let Some(hook) = on_closed {
            hook(self);
        }

        self.shared.closed.send_replace(true);
        let _ = self.shared.events.send(EndpointEvent::Disconnected(self.clone(), reason));
    }
}

async fn write_loop(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    token: String,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = transport.send(&frame).await {
            warn!(token = %token, error = %e, "transport send failed, stopping writer");
            break;
        }
    }
}

/// Waits until the flag behind `closed` becomes true or its sender is gone.
pub(crate) async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
