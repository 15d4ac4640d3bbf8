//! # Modules
//!
//! A module is a named unit of remotely invocable behavior. Mounting one on
//! an endpoint builds its dispatch tables once, from the methods and
//! properties it registers, keyed by the 16-bit code of each name. Both
//! sides address a module by the code of its name, so the same module type
//! mounted on each end of a connection forms a symmetric channel.
//!
//! ```ignore
//! struct Calculator;
//!
//! impl Module for Calculator {
//!     fn name(&self) -> &str { "Calc" }
//!
//!     fn register(registry: &mut Registry<Self>) {
//!         registry.method("Add", |_, args| {
//!             Ok(arg::<i32>(args, 0)? + arg::<i32>(args, 1)?)
//!         });
//!     }
//! }
//! ```
//!
//! ## Invariants
//!
//! - Method codes are unique within a module, as are property codes. Two
//!   names folding to the same code fail the mount.
//! - Each outstanding invocation id has exactly one pending entry, removed
//!   when its result arrives, when an awaiting call times out, or when the
//!   module is unmounted.
//! - `stop` runs at most once per mount.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use linkwire::InvokeMethod;
use linkwire::InvokeMethodResult;
use linkwire::Message;
use linkwire::SetProperty;
use linkwire::Value;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::endpoint::Outbox;
use crate::endpoint::lock;
use crate::error::Error;
use crate::error::Fault;
use crate::error::RemoteFault;
use crate::error::Result;

pub trait Module: Send + Sync + Sized + 'static {
    /// The name both sides address this module by.
    fn name(&self) -> &str;

    /// Declares the remotely invocable methods and properties.
    fn register(registry: &mut Registry<Self>);

    /// Called once the module is mounted.
    fn start(&self, handle: &ModuleHandle<Self>) {
        let _ = handle;
    }

    /// Called once when the module is unmounted or its endpoint closes.
    fn stop(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountError {
    /// A module of this type is already mounted on the endpoint.
    AlreadyMounted(String),
    /// The module has been unmounted; its handle can no longer invoke.
    NotMounted(String),
    /// Two method names, or two property names, fold to one code.
    CodeCollision {
        module: String,
        first: String,
        second: String,
        code: u16,
    },
}

impl std::fmt::Display for MountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyMounted(name) => write!(f, "Module {} is already mounted", name),
            Self::NotMounted(name) => write!(f, "Module {} is not mounted", name),
            Self::CodeCollision { module, first, second, code } => write!(
                f,
                "Module {}: {} and {} share code {:#06x}",
                module, first, second, code
            ),
        }
    }
}

impl std::error::Error for MountError {}

/// Reads argument `index` as `T`.
pub fn arg<T>(args: &[Value], index: usize) -> std::result::Result<T, Fault>
where
    T: TryFrom<Value, Error = linkwire::Error>,
{
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| Fault::new(format!("missing argument {}", index)))?;
    Ok(T::try_from(value)?)
}

// ----------------------------------------------------------------------
//  Registry
// ----------------------------------------------------------------------

type MethodFn<M> = Box<dyn Fn(&M, &[Value]) -> std::result::Result<Value, Fault> + Send + Sync>;
type GetterFn<M> = Box<dyn Fn(&M) -> Value + Send + Sync>;
type SetterFn<M> = Box<dyn Fn(&M, Value) -> linkwire::Result<()> + Send + Sync>;

/// Collects a module's methods and properties during `Module::register`.
pub struct Registry<M> {
    methods: Vec<(String, MethodFn<M>)>,
    properties: Vec<(String, GetterFn<M>, SetterFn<M>)>,
}

impl<M: Module> Registry<M> {
    fn new() -> Self {
        Self { methods: Vec::new(), properties: Vec::new() }
    }

    /// Registers a method callable from the remote side.
    ///
    /// A returned `Fault`, or a panic, is reported to the caller as the
    /// exception string of the result.
    pub fn method<F, R>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&M, &[Value]) -> std::result::Result<R, Fault> + Send + Sync + 'static,
        R: Into<Value>,
    {
        self.methods
            .push((name.to_string(), Box::new(move |m, args| f(m, args).map(Into::into))));
        self
    }

    /// Registers a property the remote side can write.
    pub fn property<T, G, S>(&mut self, name: &str, get: G, set: S) -> &mut Self
    where
        T: Into<Value> + TryFrom<Value, Error = linkwire::Error>,
        G: Fn(&M) -> T + Send + Sync + 'static,
        S: Fn(&M, T) + Send + Sync + 'static,
    {
        self.properties.push((
            name.to_string(),
            Box::new(move |m| get(m).into()),
            Box::new(move |m, value| {
                set(m, T::try_from(value)?);
                Ok(())
            }),
        ));
        self
    }
}

// ----------------------------------------------------------------------
//  Mounted state
// ----------------------------------------------------------------------

struct Method {
    name: String,
    call: Box<dyn Fn(&[Value]) -> std::result::Result<Value, Fault> + Send + Sync>,
}

struct Property {
    name: String,
    code: u16,
    get: Box<dyn Fn() -> Value + Send + Sync>,
    set: Box<dyn Fn(Value) -> linkwire::Result<()> + Send + Sync>,
}

#[derive(Default)]
struct Tables {
    methods: HashMap<u16, Arc<Method>>,
    properties: HashMap<u16, Arc<Property>>,
    values: HashMap<String, Value>,
}

type ResultFn = Box<dyn FnOnce(std::result::Result<Value, RemoteFault>) + Send>;

struct PendingInvocation {
    created_at: Instant,
    on_result: Mutex<ResultFn>,
}

/// The type-erased side of a mounted module, driven by the endpoint pump.
pub(crate) struct ModuleSlot {
    name: String,
    code: u16,
    token: String,
    tables: RwLock<Tables>,
    pending: DashMap<i32, PendingInvocation>,
    stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ModuleSlot {
    pub(crate) fn build<M: Module>(module: Arc<M>, token: &str) -> std::result::Result<Self, MountError> {
        let mut registry = Registry::new();
        M::register(&mut registry);

        let name = module.name().to_string();
        let mut tables = Tables::default();

        for (method_name, call) in registry.methods {
            let code = linkwire::code(&method_name);
            if let Some(existing) = tables.methods.get(&code) {
                return Err(MountError::CodeCollision {
                    module: name,
                    first: existing.name.clone(),
                    second: method_name,
                    code,
                });
            }
            let m = module.clone();
            tables.methods.insert(code, Arc::new(Method {
                name: method_name,
                call: Box::new(move |args| call(&*m, args)),
            }));
        }

        for (property_name, get, set) in registry.properties {
            let code = linkwire::code(&property_name);
            if let Some(existing) = tables.properties.get(&code) {
                return Err(MountError::CodeCollision {
                    module: name,
                    first: existing.name.clone(),
                    second: property_name,
                    code,
                });
            }
            tables.values.insert(property_name.clone(), get(&*module));
            let (getter, setter) = (module.clone(), module.clone());
            tables.properties.insert(code, Arc::new(Property {
                name: property_name,
                code,
                get: Box::new(move || get(&*getter)),
                set: Box::new(move |value| set(&*setter, value)),
            }));
        }

        let stopper = module.clone();
        Ok(Self {
            code: linkwire::code(&name),
            name,
            token: token.to_string(),
            tables: RwLock::new(tables),
            pending: DashMap::new(),
            stop: Mutex::new(Some(Box::new(move || stopper.stop()))),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|p| p.into_inner())
    }

    fn is_stopped(&self) -> bool {
        lock(&self.stop).is_none()
    }

    fn property_named(&self, name: &str) -> Option<Arc<Property>> {
        self.read().properties.values().find(|p| p.name == name).cloned()
    }

    /// Offers an inbound message to this module. Returns true if it resolved
    /// one of this module's pending invocations.
    pub(crate) fn dispatch(&self, outbox: &Outbox, message: &Message) -> bool {
        match message {
            Message::InvokeMethod(invoke) if invoke.module_code == self.code => {
                self.on_invoke(outbox, invoke);
                false
            }
            Message::SetProperty(set) if set.module_code == self.code => {
                self.on_set_property(set);
                false
            }
            Message::InvokeMethodResult(result) => self.on_result(result),
            _ => false,
        }
    }

    fn on_invoke(&self, outbox: &Outbox, invoke: &InvokeMethod) {
        let method = self.read().methods.get(&invoke.method_code).cloned();
        let Some(method) = method else {
            warn!(
                token = %self.token,
                module = %self.name,
                method_code = invoke.method_code,
                "unknown method code"
            );
            return;
        };

        debug!(
            token = %self.token,
            module = %self.name,
            method = %method.name,
            invocation_id = invoke.invocation_id,
            "invoking method"
        );

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (method.call)(&invoke.args)))
            .unwrap_or_else(|panic| Err(Fault::from_panic(panic)));

        let result = match outcome {
            Ok(value) => InvokeMethodResult {
                invocation_id: invoke.invocation_id,
                value: Some(value),
                exception: None,
            },
            Err(fault) => {
                warn!(
                    token = %self.token,
                    module = %self.name,
                    method = %method.name,
                    error = %fault,
                    "method failed"
                );
                InvokeMethodResult {
                    invocation_id: invoke.invocation_id,
                    value: None,
                    exception: Some(fault.to_string()),
                }
            }
        };

        if let Err(e) = outbox.send(&result.into()) {
            warn!(token = %self.token, module = %self.name, error = %e, "failed to send invocation result");
        }
    }

    fn on_set_property(&self, set: &SetProperty) {
        let property = self.read().properties.get(&set.property_code).cloned();
        let Some(property) = property else {
            debug!(
                token = %self.token,
                module = %self.name,
                property_code = set.property_code,
                "unknown property code, ignoring"
            );
            return;
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| (property.set)(set.value.clone()))) {
            Ok(Ok(())) => {
                let mut tables = self.write();
                if tables.properties.contains_key(&property.code) {
                    tables.values.insert(property.name.clone(), set.value.clone());
                }
            }
            Ok(Err(e)) => warn!(
                token = %self.token,
                module = %self.name,
                property = %property.name,
                error = %e,
                "rejected remote property write"
            ),
            Err(_) => error!(
                token = %self.token,
                module = %self.name,
                property = %property.name,
                "property setter panicked"
            ),
        }
    }

    fn on_result(&self, result: &InvokeMethodResult) -> bool {
        let Some((_, pending)) = self.pending.remove(&result.invocation_id) else {
            return false;
        };

        let outcome = match &result.exception {
            Some(exception) if !exception.trim().is_empty() => {
                error!(
                    token = %self.token,
                    module = %self.name,
                    invocation_id = result.invocation_id,
                    "remote method failed: {}",
                    exception
                );
                Err(RemoteFault(exception.clone()))
            }
            _ => Ok(result.value.clone().unwrap_or_default()),
        };

        let on_result = pending.on_result.into_inner().unwrap_or_else(|p| p.into_inner());
        if std::panic::catch_unwind(AssertUnwindSafe(move || on_result(outcome))).is_err() {
            error!(
                token = %self.token,
                module = %self.name,
                invocation_id = result.invocation_id,
                "result callback panicked"
            );
        }
        true
    }

    /// Runs `stop` if it has not run, then drops every table entry and
    /// pending invocation. Dropped callbacks are never invoked.
    pub(crate) fn shutdown(&self) {
        let stop = lock(&self.stop).take();
        if let Some(stop) = stop {
            if std::panic::catch_unwind(AssertUnwindSafe(stop)).is_err() {
                error!(token = %self.token, module = %self.name, "module stop panicked");
            }
        }

        let mut tables = self.write();
        tables.methods.clear();
        tables.properties.clear();
        tables.values.clear();
        drop(tables);

        self.pending.clear();
    }
}

// ----------------------------------------------------------------------
//  Handle
// ----------------------------------------------------------------------

/// Application-side access to a mounted module. Cheap to clone.
pub struct ModuleHandle<M> {
    module: Arc<M>,
    slot: Arc<ModuleSlot>,
    outbox: Arc<Outbox>,
}

impl<M> Clone for ModuleHandle<M> {
    fn clone(&self) -> Self {
        Self {
            module: self.module.clone(),
            slot: self.slot.clone(),
            outbox: self.outbox.clone(),
        }
    }
}

impl<M: Module> ModuleHandle<M> {
    pub(crate) fn new(module: Arc<M>, slot: Arc<ModuleSlot>, outbox: Arc<Outbox>) -> Self {
        Self { module, slot, outbox }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn code(&self) -> u16 {
        self.slot.code
    }

    pub fn is_mounted(&self) -> bool {
        !self.slot.is_stopped()
    }

    fn invocation(&self, method: &str, args: Vec<Value>) -> Result<InvokeMethod> {
        if method.trim().is_empty() {
            return Err(Error::InvalidName);
        }
        if self.slot.is_stopped() {
            return Err(MountError::NotMounted(self.slot.name.clone()).into());
        }
        Ok(InvokeMethod {
            module_code: self.slot.code,
            method_code: linkwire::code(method),
            invocation_id: self.outbox.next_invocation_id(),
            args,
        })
    }

    /// Fire-and-forget invocation. No pending entry is kept; the result is
    /// dropped on arrival.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let message = self.invocation(method, args)?;
        self.outbox.send(&message.into())
    }

    /// Invokes `method` and calls `on_result` when the result arrives.
    ///
    /// Unless `invoke_null` is set, a successful null result does not reach
    /// the callback. A remote failure always does. Returns the invocation id.
    pub fn invoke_with<F>(&self, method: &str, args: Vec<Value>, invoke_null: bool, on_result: F) -> Result<i32>
    where
        F: FnOnce(std::result::Result<Value, RemoteFault>) + Send + 'static,
    {
        let message = self.invocation(method, args)?;
        let id = message.invocation_id;

        self.slot.pending.insert(id, PendingInvocation {
            created_at: Instant::now(),
            on_result: Mutex::new(Box::new(move |outcome: std::result::Result<Value, RemoteFault>| {
                if !invoke_null && matches!(outcome, Ok(Value::Null)) {
                    return;
                }
                on_result(outcome)
            })),
        });

        if let Err(e) = self.outbox.send(&message.into()) {
            self.slot.pending.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Invokes `method` and waits up to `timeout` for its result.
    ///
    /// On timeout the pending entry is removed; a late result is ignored.
    /// A disconnect before the deadline also ends in [`Error::Timeout`], at
    /// the deadline.
    pub async fn invoke_awaiting(&self, method: &str, timeout: Duration, args: Vec<Value>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = self.invoke_with(method, args, true, move |outcome| {
            let _ = tx.send(outcome);
        })?;

        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Ok(value))) => return Ok(value),
            Ok(Ok(Err(fault))) => return Err(Error::Remote(fault)),
            // Cleared by teardown; wait out the deadline all the same.
            Ok(Err(_)) => tokio::time::sleep_until(deadline).await,
            Err(_) => {}
        }
        self.slot.pending.remove(&id);
        debug!(
            token = %self.slot.token,
            module = %self.slot.name,
            invocation_id = id,
            "invocation timed out"
        );
        Err(Error::Timeout)
    }

    /// `invoke_awaiting`, converting the result to `T`.
    pub async fn call<T>(&self, method: &str, timeout: Duration, args: Vec<Value>) -> Result<T>
    where
        T: TryFrom<Value, Error = linkwire::Error>,
    {
        let value = self.invoke_awaiting(method, timeout, args).await?;
        Ok(T::try_from(value)?)
    }

    pub fn pending_invocations(&self) -> usize {
        self.slot.pending.len()
    }

    /// Abandons pending invocations older than `age`. Their callbacks are
    /// never invoked. Returns how many were dropped.
    pub fn prune_pending(&self, age: Duration) -> usize {
        let before = self.slot.pending.len();
        self.slot.pending.retain(|_, p| p.created_at.elapsed() < age);
        before.saturating_sub(self.slot.pending.len())
    }

    /// The locally cached value of a remote-visible property.
    pub fn get_property(&self, name: &str) -> Result<Value> {
        self.slot
            .read()
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))
    }

    pub fn property<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = linkwire::Error>,
    {
        Ok(T::try_from(self.get_property(name)?)?)
    }

    /// Writes a property locally and propagates the write to the remote side.
    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidName);
        }
        let property = self
            .slot
            .property_named(name)
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))?;
        let value = value.into();

        (property.set)(value.clone())?;
        self.slot.write().values.insert(property.name.clone(), value.clone());

        self.outbox.send(&Message::from(SetProperty {
            module_code: self.slot.code,
            property_code: property.code,
            value,
        }))
    }

    /// Re-reads a property from the module and pushes it to the remote side.
    /// For state the module changed on its own.
    pub fn publish_property(&self, name: &str) -> Result<()> {
        let property = self
            .slot
            .property_named(name)
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))?;
        let value = (property.get)();
        self.slot.write().values.insert(property.name.clone(), value.clone());

        self.outbox.send(&Message::from(SetProperty {
            module_code: self.slot.code,
            property_code: property.code,
            value,
        }))
    }
}
