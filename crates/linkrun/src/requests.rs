//! # Request/Response Correlation
//!
//! A request carries a fresh correlation id and one typed payload. The
//! receiving side looks up a handler by the payload's type tag; the handler's
//! output travels back in a response with the same id, which resolves the
//! pending entry on the requesting side.
//!
//! ## Invariants
//!
//! - An id is in the pool exactly while its request is pending.
//! - Each pending callback runs at most once, and never after the entry was
//!   cleared by a timeout or a disconnect.
//! - A handler that fails, or a request nobody handles, produces no
//!   response. The requester's timeout is the only signal.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use dashmap::DashMap;
use linkwire::Payload;
use linkwire::PayloadType;
use linkwire::Request;
use linkwire::Response;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::endpoint::Outbox;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::ids::DEFAULT_ID_LEN;
use crate::ids::IdPool;

type HandlerFn = Arc<dyn Fn(&Payload) -> std::result::Result<Payload, Fault> + Send + Sync>;

type ResponseFn = Box<dyn FnOnce(Response) + Send>;

struct PendingRequest {
    on_result: Mutex<ResponseFn>,
}

pub struct Requests {
    outbox: Arc<Outbox>,
    ids: IdPool,
    pending: DashMap<String, PendingRequest>,
    handlers: RwLock<HashMap<String, HandlerFn>>,
}

impl Requests {
    pub(crate) fn new(outbox: Arc<Outbox>) -> Self {
        Self {
            outbox,
            ids: IdPool::new(DEFAULT_ID_LEN),
            pending: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Sends `payload` as a request; `on_result` receives the response.
    /// Returns the correlation id.
    pub fn send<F>(&self, payload: Payload, on_result: F) -> Result<String>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        let id = self.ids.next();
        self.pending.insert(id.clone(), PendingRequest { on_result: Mutex::new(Box::new(on_result)) });

        let request = Request { id: id.clone(), payload: Some(payload) };
        if let Err(e) = self.outbox.send(&request.into()) {
            self.forget(&id);
            return Err(e);
        }

        debug!(token = %self.outbox.token(), id = %id, "request sent");
        Ok(id)
    }

    /// Typed `send`. The callback only sees successful, well-typed responses;
    /// anything else is logged and dropped.
    pub fn send_typed<Req, Resp, F>(&self, body: &Req, on_result: F) -> Result<String>
    where
        Req: PayloadType,
        Resp: PayloadType,
        F: FnOnce(Resp) + Send + 'static,
    {
        let payload = Payload::pack(body)?;
        self.send(payload, move |response| match decode_response::<Resp>(&response) {
            Ok(body) => on_result(body),
            Err(e) => warn!(id = %response.id, error = %e, "dropping unusable response"),
        })
    }

    /// Sends a request and waits up to `timeout` for its response.
    ///
    /// A disconnect does not cut the wait short; the call still ends with
    /// [`Error::Timeout`] once `timeout` has passed.
    pub async fn send_awaiting(&self, payload: Payload, timeout: Duration) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let id = self.send(payload, move |response| {
            let _ = tx.send(response);
        })?;

        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => return Ok(response),
            // Teardown dropped the entry; the caller still waits out its own deadline.
            Ok(Err(_)) => tokio::time::sleep_until(deadline).await,
            Err(_) => {}
        }
        self.forget(&id);
        debug!(token = %self.outbox.token(), id = %id, "request timed out");
        Err(Error::Timeout)
    }

    /// Sends `body` and decodes the response as `Resp`.
    pub async fn get<Req, Resp>(&self, body: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: PayloadType,
        Resp: PayloadType,
    {
        let response = self.send_awaiting(Payload::pack(body)?, timeout).await?;
        decode_response(&response)
    }

    /// Installs the handler for requests carrying `Req`, replacing any
    /// previous one.
    pub fn register<Req, Resp, F>(&self, handler: F)
    where
        Req: PayloadType,
        Resp: PayloadType,
        F: Fn(Req) -> std::result::Result<Resp, Fault> + Send + Sync + 'static,
    {
        self.register_raw(Req::TAG, move |payload| {
            let request = payload.unpack::<Req>()?;
            let response = handler(request)?;
            Ok(Payload::pack(&response)?)
        });
    }

    pub fn register_raw<F>(&self, tag: impl Into<String>, handler: F)
    where
        F: Fn(&Payload) -> std::result::Result<Payload, Fault> + Send + Sync + 'static,
    {
        self.handlers_write().insert(tag.into(), Arc::new(handler));
    }

    pub fn unregister<Req: PayloadType>(&self) -> bool {
        self.unregister_tag(Req::TAG)
    }

    pub fn unregister_tag(&self, tag: &str) -> bool {
        self.handlers_write().remove(tag).is_some()
    }

    pub fn has_handler(&self, tag: &str) -> bool {
        self.handlers_read().contains_key(tag)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Correlation ids currently reserved.
    pub fn ids_in_use(&self) -> usize {
        self.ids.in_use()
    }

    pub(crate) fn handle_request(&self, request: &Request) {
        let token = self.outbox.token();
        if request.id.trim().is_empty() {
            warn!(token = %token, "request without id, dropping");
            return;
        }
        let Some(payload) = &request.payload else {
            warn!(token = %token, id = %request.id, "request without payload, dropping");
            return;
        };

        let handler = self.handlers_read().get(&payload.tag).cloned();
        let Some(handler) = handler else {
            debug!(token = %token, id = %request.id, tag = %payload.tag, "no handler for request");
            return;
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload)))
            .unwrap_or_else(|panic| Err(Fault::from_panic(panic)));

        // A failed handler has no payload to return, and a response without
        // one is never sent.
        let body = match outcome {
            Ok(body) => body,
            Err(fault) => {
                warn!(token = %token, id = %request.id, tag = %payload.tag, error = %fault, "request handler failed");
                return;
            }
        };

        let response = Response { id: request.id.clone(), success: true, payload: Some(body) };
        if let Err(e) = self.outbox.send(&response.into()) {
            warn!(token = %token, id = %request.id, error = %e, "failed to send response");
        }
    }

    pub(crate) fn handle_response(&self, response: Response) {
        let token = self.outbox.token();
        if response.id.trim().is_empty() {
            warn!(token = %token, "response without id, dropping");
            return;
        }
        let Some((id, pending)) = self.pending.remove(&response.id) else {
            warn!(token = %token, id = %response.id, "response for unknown request, dropping");
            return;
        };
        self.ids.free(&id);

        let on_result = pending.on_result.into_inner().unwrap_or_else(|p| p.into_inner());
        if std::panic::catch_unwind(AssertUnwindSafe(move || on_result(response))).is_err() {
            error!(token = %token, id = %id, "response callback panicked");
        }
    }

    /// Drops every pending request, frees every id and removes every handler.
    pub(crate) fn clear(&self) {
        self.pending.clear();
        self.ids.free_all();
        self.handlers_write().clear();
    }

    fn forget(&self, id: &str) {
        self.pending.remove(id);
        self.ids.free(id);
    }

    fn handlers_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, HandlerFn>> {
        self.handlers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn handlers_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, HandlerFn>> {
        self.handlers.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn decode_response<Resp: PayloadType>(response: &Response) -> Result<Resp> {
    if !response.success {
        return Err(Error::Request { id: response.id.clone() });
    }
    match &response.payload {
        Some(payload) => Ok(payload.unpack::<Resp>()?),
        None => Err(Error::Request { id: response.id.clone() }),
    }
}
