//! Backend callbacks and bound commands.
//!
//! A numeric handle coming from the backend becomes a [`CallbackProxy`]; each
//! invocation sends a mode-5 message and waits for the matching mode-6 reply.
//! Proxies are cached per handle for the life of the connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::bridge::protocol::Target;
use crate::context::BridgeContext;
use crate::error::BridgeError;
use crate::registry::{Command, Invocation};
use crate::value::{Map, Value};

type Waiter = oneshot::Sender<Result<Value, BridgeError>>;

/// Outstanding callback invocations and the proxy cache.
pub struct CallbackTable {
    next_id: AtomicU32,
    waiting: DashMap<u32, Waiter>,
    proxies: DashMap<u32, CallbackProxy>,
    closed: AtomicBool,
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            waiting: DashMap::new(),
            proxies: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Cached proxy for `handle`, created on first use.
    pub fn proxy(&self, handle: u32, ctx: Weak<BridgeContext>) -> CallbackProxy {
        self.proxies
            .entry(handle)
            .or_insert_with(|| {
                tracing::trace!(handle, "Created callback proxy");
                CallbackProxy { handle, ctx }
            })
            .clone()
    }

    /// Allocate a callback call id and register its waiter. Fails once the
    /// table has been closed by [`reject_all`](Self::reject_all).
    pub fn open(
        &self,
    ) -> Result<(u32, oneshot::Receiver<Result<Value, BridgeError>>), BridgeError> {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(call_id, tx);
        // reject_all flips `closed` before sweeping, so a waiter inserted
        // after the sweep is caught here.
        if self.is_closed() {
            self.waiting.remove(&call_id);
            return Err(BridgeError::ConnectionClosed);
        }
        Ok((call_id, rx))
    }

    /// Deliver a mode-6 result. An id nobody waits for is a protocol error.
    pub fn resolve(&self, call_id: u32, result: Result<Value, BridgeError>) -> Result<(), BridgeError> {
        let (_, tx) = self.waiting.remove(&call_id).ok_or_else(|| {
            BridgeError::protocol(format!("no callback waiting for call id {}", call_id))
        })?;
        if tx.send(result).is_err() {
            tracing::debug!(call_id, "Callback caller went away before its reply");
        }
        Ok(())
    }

    pub fn cancel(&self, call_id: u32) {
        self.waiting.remove(&call_id);
    }

    /// Close the table and fail every outstanding invocation with
    /// `ConnectionClosed`.
    pub fn reject_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u32> = self.waiting.iter().map(|e| *e.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, tx)) = self.waiting.remove(&id) {
                let _ = tx.send(Err(BridgeError::ConnectionClosed));
                rejected += 1;
            }
        }
        if rejected > 0 {
            tracing::debug!(rejected, "Rejected outstanding callbacks");
        }
        rejected
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Local stand-in for a backend callback.
#[derive(Clone)]
pub struct CallbackProxy {
    handle: u32,
    ctx: Weak<BridgeContext>,
}

impl CallbackProxy {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Invoke the backend callback and wait for its reply.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, BridgeError> {
        let ctx = self.ctx.upgrade().ok_or(BridgeError::ConnectionClosed)?;
        ctx.invoke_callback(self.handle, args).await
    }
}

impl fmt::Debug for CallbackProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackProxy")
            .field("handle", &self.handle)
            .finish()
    }
}

#[derive(Clone)]
enum Invoker {
    Registered {
        command: Arc<Command>,
        ctx: Weak<BridgeContext>,
    },
    Callback(CallbackProxy),
}

/// Invocable value produced by a `~$` tag: a registered command or a backend
/// callback, addressed by `target`.
#[derive(Clone)]
pub struct CommandRef {
    call_id: u32,
    target: Target,
    invoker: Invoker,
}

impl CommandRef {
    pub(crate) fn registered(call_id: u32, command: Arc<Command>, ctx: Weak<BridgeContext>) -> Self {
        Self {
            call_id,
            target: Target::Name(command.name.clone()),
            invoker: Invoker::Registered { command, ctx },
        }
    }

    pub(crate) fn callback(call_id: u32, proxy: CallbackProxy) -> Self {
        Self {
            call_id,
            target: Target::Handle(proxy.handle),
            invoker: Invoker::Callback(proxy),
        }
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub async fn call(&self, args: Vec<Value>, kwargs: Map) -> Result<Value, BridgeError> {
        match &self.invoker {
            Invoker::Registered { command, ctx } => {
                let context = ctx.upgrade().ok_or(BridgeError::ConnectionClosed)?;
                let invocation = Invocation {
                    call_id: self.call_id,
                    args,
                    kwargs,
                    context,
                    expects_reply: false,
                };
                Ok(command.handler.invoke(invocation).await?)
            }
            Invoker::Callback(proxy) => {
                if !kwargs.is_empty() {
                    tracing::debug!(
                        handle = proxy.handle,
                        "Callbacks take positional arguments only, dropping kwargs"
                    );
                }
                proxy.call(args).await
            }
        }
    }
}

impl PartialEq for CommandRef {
    fn eq(&self, other: &Self) -> bool {
        self.call_id == other.call_id && self.target == other.target
    }
}

impl fmt::Debug for CommandRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRef")
            .field("call_id", &self.call_id)
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn resolve_delivers_to_waiter() {
        let table = CallbackTable::new();
        let (id, rx) = table.open().unwrap();
        assert_eq!(id, 0);
        assert_eq!(table.waiting(), 1);

        table.resolve(id, Ok(Value::from("done"))).unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), Value::from("done"));
        assert_eq!(table.waiting(), 0);
    }

    #[test]
    fn ids_increase_from_zero() {
        let table = CallbackTable::new();
        let ids: Vec<u32> = (0..3).map(|_| table.open().unwrap().0).collect();
        assert_eq!(ids, [0, 1, 2]);
    }

    #[test]
    fn unmatched_resolve_is_protocol_violation() {
        let table = CallbackTable::new();
        let err = table.resolve(9, Ok(Value::Null)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn reject_all_fails_waiters_with_connection_closed() {
        let table = CallbackTable::new();
        let (_, rx1) = table.open().unwrap();
        let (_, rx2) = table.open().unwrap();
        assert_eq!(table.reject_all(), 2);

        for rx in [rx1, rx2] {
            let err = rx.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        }
    }

    #[test]
    fn open_after_reject_all_fails_without_leaking_a_waiter() {
        let table = CallbackTable::new();
        assert!(!table.is_closed());
        assert_eq!(table.reject_all(), 0);
        assert!(table.is_closed());

        let err = table.open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        assert_eq!(table.waiting(), 0);
    }

    #[test]
    fn proxies_are_cached_per_handle() {
        let table = CallbackTable::new();
        let a = table.proxy(4, Weak::new());
        let b = table.proxy(4, Weak::new());
        let c = table.proxy(5, Weak::new());
        assert_eq!(a.handle(), b.handle());
        assert_eq!(c.handle(), 5);
        assert_eq!(table.proxies.len(), 2);
    }

    #[tokio::test]
    async fn proxy_without_connection_fails() {
        let proxy = CallbackTable::new().proxy(1, Weak::new());
        let err = proxy.call(vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
    }
}
