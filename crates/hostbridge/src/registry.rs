//! Command registry.
//!
//! Maps command names to handlers plus the auto-escape flag. Handlers receive
//! already-decoded arguments and may be synchronous or asynchronous.

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::context::BridgeContext;
use crate::error::{BridgeError, HandlerError};
use crate::host::HostRef;
use crate::value::{Map, Value};

/// One decoded command invocation.
pub struct Invocation {
    pub call_id: u32,
    pub args: Vec<Value>,
    pub kwargs: Map,
    pub context: Arc<BridgeContext>,
    /// Arrived as a mode-0 call: a reply is owed and the call is counted as
    /// pending until it is sent.
    pub expects_reply: bool,
}

impl Invocation {
    pub fn arg(&self, idx: usize) -> Option<&Value> {
        self.args.get(idx)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn host_arg(&self, idx: usize) -> Result<HostRef, HandlerError> {
        self.arg(idx)
            .and_then(Value::as_host)
            .cloned()
            .ok_or_else(|| HandlerError::type_error(format!("argument {} must be an object", idx)))
    }

    pub fn str_arg(&self, idx: usize) -> Result<&str, HandlerError> {
        self.arg(idx)
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::type_error(format!("argument {} must be a string", idx)))
    }

    pub fn u32_arg(&self, idx: usize) -> Result<u32, HandlerError> {
        self.arg(idx).and_then(Value::as_u32).ok_or_else(|| {
            HandlerError::type_error(format!("argument {} must be a non-negative integer", idx))
        })
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<Value, HandlerError>;
}

/// Adapter for synchronous closures.
pub struct SyncFn<F>(pub F);

#[async_trait]
impl<F> CommandHandler for SyncFn<F>
where
    F: Fn(Invocation) -> Result<Value, HandlerError> + Send + Sync,
{
    async fn invoke(&self, invocation: Invocation) -> Result<Value, HandlerError> {
        (self.0)(invocation)
    }
}

/// Adapter for closures returning a future.
pub struct AsyncFn<F>(pub F);

#[async_trait]
impl<F, Fut> CommandHandler for AsyncFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn invoke(&self, invocation: Invocation) -> Result<Value, HandlerError> {
        (self.0)(invocation).await
    }
}

pub struct Command {
    pub name: String,
    pub handler: Arc<dyn CommandHandler>,
    /// When false the result skips the escape codec.
    pub auto_escape: bool,
}

impl Command {
    pub fn new(name: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            auto_escape: true,
        }
    }

    pub fn sync<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Invocation) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self::new(name, SyncFn(func))
    }

    pub fn from_async<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self::new(name, AsyncFn(func))
    }

    /// Mark the result as already wire-safe.
    pub fn raw(self) -> Self {
        self.with_auto_escape(false)
    }

    pub fn with_auto_escape(mut self, auto_escape: bool) -> Self {
        self.auto_escape = auto_escape;
        self
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("auto_escape", &self.auto_escape)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<IndexMap<String, Arc<Command>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexMap<String, Arc<Command>>> {
        match self.commands.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Command registry lock poisoned - continuing");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<String, Arc<Command>>> {
        match self.commands.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Command registry lock poisoned - continuing");
                poisoned.into_inner()
            }
        }
    }

    /// Add or replace a command. Replacing keeps the original position.
    pub fn register(&self, command: Command) {
        let name = command.name.clone();
        let auto_escape = command.auto_escape;
        if self.write().insert(name.clone(), Arc::new(command)).is_some() {
            tracing::debug!(command = %name, "Replaced command");
        } else {
            tracing::trace!(command = %name, auto_escape, "Registered command");
        }
    }

    pub fn register_sync<F>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(Invocation) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(Command::sync(name, func));
    }

    pub fn register_async<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(Command::from_async(name, func));
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<Command>, BridgeError> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::CommandUnknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
