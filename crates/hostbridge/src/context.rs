//! Connection-scoped state.
//!
//! One [`BridgeContext`] owns everything a connection shares: the object
//! table, the command registry, callback bookkeeping, the pending-call counter
//! and the outbound queue. Handlers get it through their [`Invocation`].
//!
//! [`Invocation`]: crate::registry::Invocation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::json;
use tokio::sync::{Notify, mpsc, watch};

use crate::bridge::protocol::{Message, Mode, Target};
use crate::callback::{CallbackProxy, CallbackTable, CommandRef};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::escape::{Decoder, Encoder};
use crate::host::HostRef;
use crate::object_table::ObjectTable;
use crate::registry::CommandRegistry;
use crate::value::{Map, Value};

/// Feature that adds display names to object tags.
pub const FEATURE_FRIENDLY_NAMES: &str = "friendly_obj_names";

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport not open yet
    #[default]
    Connecting,
    /// Dispatching messages
    Open,
    /// Shutdown requested, waiting for in-flight calls
    Draining,
    /// Transport closed, nothing more is accepted
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

/// Work for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Message),
    Close { code: u16, reason: String },
}

/// Calls received in mode 0 minus replies sent.
pub struct PendingCalls {
    count: watch::Sender<u32>,
}

impl PendingCalls {
    fn new() -> Self {
        Self {
            count: watch::channel(0).0,
        }
    }

    pub(crate) fn begin(&self) {
        self.count.send_modify(|n| *n += 1);
    }

    pub(crate) fn finish(&self) {
        self.count.send_modify(|n| {
            if *n == 0 {
                tracing::warn!("Pending-call counter would go negative");
            } else {
                *n -= 1;
            }
        });
    }

    pub fn count(&self) -> u32 {
        *self.count.borrow()
    }

    /// Resolve once at most `limit` calls are pending.
    pub async fn drained(&self, limit: u32) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n <= limit).await;
    }
}

pub struct BridgeContext {
    client_id: String,
    user_agent: String,
    objects: Mutex<ObjectTable>,
    commands: CommandRegistry,
    callbacks: CallbackTable,
    pending: PendingCalls,
    features: Mutex<Map>,
    state: watch::Sender<ConnectionState>,
    close_requested: Notify,
    closing: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    weak_self: Weak<BridgeContext>,
}

fn recover<'a, T>(what: &str, lock: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(lock = what, "Mutex poisoned - continuing with inner state");
            poisoned.into_inner()
        }
    }
}

impl BridgeContext {
    pub(crate) fn new(
        config: &BridgeConfig,
        root: HostRef,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new_cyclic(|weak_self| Self {
            client_id: config.client_id.clone(),
            user_agent: config.user_agent.clone(),
            objects: Mutex::new(ObjectTable::new(root, config.root_name.clone())),
            commands: CommandRegistry::new(),
            callbacks: CallbackTable::new(),
            pending: PendingCalls::new(),
            features: Mutex::new(config.features.clone()),
            state: watch::channel(ConnectionState::Connecting).0,
            close_requested: Notify::new(),
            closing: AtomicBool::new(false),
            outbound,
            weak_self: weak_self.clone(),
        });
        (ctx, rx)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub(crate) fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub fn pending_calls(&self) -> &PendingCalls {
        &self.pending
    }

    // --- objects ---

    pub fn handle_of(&self, obj: &HostRef) -> u32 {
        recover("objects", &self.objects).get_handle(obj)
    }

    pub fn resolve(&self, handle: u32) -> Result<HostRef, BridgeError> {
        recover("objects", &self.objects).resolve(handle)
    }

    pub fn release(&self, handle: u32) -> bool {
        recover("objects", &self.objects).release(handle)
    }

    pub fn set_display_name(&self, obj: &HostRef, name: impl Into<String>) -> u32 {
        recover("objects", &self.objects).set_display_name(obj, name)
    }

    pub fn root(&self) -> HostRef {
        recover("objects", &self.objects).root()
    }

    // --- features ---

    pub fn features(&self) -> Map {
        recover("features", &self.features).clone()
    }

    pub fn merge_features(&self, extra: Map) {
        let mut features = recover("features", &self.features);
        for (name, value) in extra {
            features.insert(name, value);
        }
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        recover("features", &self.features)
            .get(name)
            .is_some_and(Value::is_truthy)
    }

    // --- codec ---

    pub fn decoder(&self) -> Decoder<'_> {
        Decoder::new(self)
    }

    pub fn decode(&self, wire: serde_json::Value) -> Result<Value, BridgeError> {
        self.decoder().decode(wire)
    }

    /// Encode a reply payload `{"result": value}`, wrapped if it holds tags.
    pub fn encode_result(
        &self,
        value: &Value,
        auto_escape: bool,
    ) -> Result<serde_json::Value, BridgeError> {
        let friendly = self.feature_enabled(FEATURE_FRIENDLY_NAMES);
        let mut objects = recover("objects", &self.objects);
        let mut encoder = Encoder::new(&mut objects, auto_escape).with_friendly_names(friendly);
        let result = encoder.encode(value)?;
        Ok(encoder.finish(json!({ "result": result })))
    }

    /// Encode a callback payload `{"args": [...]}`, wrapped if it holds tags.
    pub fn encode_args(&self, args: &[Value]) -> Result<serde_json::Value, BridgeError> {
        let friendly = self.feature_enabled(FEATURE_FRIENDLY_NAMES);
        let mut objects = recover("objects", &self.objects);
        let mut encoder = Encoder::new(&mut objects, true).with_friendly_names(friendly);
        let args = args
            .iter()
            .map(|arg| encoder.encode(arg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(encoder.finish(json!({ "args": args })))
    }

    // --- commands and callbacks ---

    pub fn callback_proxy(&self, handle: u32) -> CallbackProxy {
        self.callbacks.proxy(handle, self.weak_self.clone())
    }

    /// Invocable for a `~$` tag target.
    pub fn command_ref(&self, call_id: u32, target: Target) -> Result<CommandRef, BridgeError> {
        match target {
            Target::Name(name) => {
                let command = self.commands.lookup(&name)?;
                Ok(CommandRef::registered(call_id, command, self.weak_self.clone()))
            }
            Target::Handle(handle) => Ok(CommandRef::callback(call_id, self.callback_proxy(handle))),
        }
    }

    /// Send a mode-5 invocation and wait for the backend's mode-6 reply.
    pub async fn invoke_callback(&self, handle: u32, args: Vec<Value>) -> Result<Value, BridgeError> {
        if self.state().is_terminal() {
            return Err(BridgeError::ConnectionClosed);
        }
        let payload = self.encode_args(&args)?;
        let (call_id, rx) = self.callbacks.open()?;
        tracing::debug!(handle, call_id, "Invoking backend callback");
        let msg = Message::new(Mode::Callback, call_id, Target::Handle(handle), payload);
        if self.send(msg).is_err() {
            self.callbacks.cancel(call_id);
            return Err(BridgeError::ConnectionClosed);
        }
        rx.await.unwrap_or(Err(BridgeError::ConnectionClosed))
    }

    // --- outbound ---

    pub(crate) fn send(&self, msg: Message) -> Result<(), BridgeError> {
        self.enqueue(Outbound::Frame(msg))
    }

    pub(crate) fn enqueue(&self, item: Outbound) -> Result<(), BridgeError> {
        self.outbound
            .send(item)
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    // --- lifecycle ---

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    /// Wait until at most `limit` calls are in flight.
    pub async fn drain(&self, limit: u32) {
        let pending = self.pending.count();
        if pending > limit {
            tracing::info!(pending, "Draining in-flight calls before close");
        }
        self.pending.drained(limit).await;
    }

    /// Ask the dispatch loop to send the terminal notification and close.
    pub fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.close_requested.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) async fn close_requested(&self) {
        self.close_requested.notified().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::PropertyObject;

    pub(crate) fn context() -> (Arc<BridgeContext>, mpsc::UnboundedReceiver<Outbound>) {
        let config = BridgeConfig::default()
            .with_client_id("test-cid")
            .with_user_agent("test-agent");
        BridgeContext::new(&config, PropertyObject::new("window").into_ref())
    }

    #[test]
    fn pending_counter_never_goes_negative() {
        let (ctx, _rx) = context();
        ctx.pending.begin();
        ctx.pending.begin();
        ctx.pending.finish();
        assert_eq!(ctx.pending_calls().count(), 1);
        ctx.pending.finish();
        ctx.pending.finish();
        assert_eq!(ctx.pending_calls().count(), 0);
    }

    #[tokio::test]
    async fn drained_waits_for_limit() {
        let (ctx, _rx) = context();
        ctx.pending.begin();
        ctx.pending.begin();

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.drain(1).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        ctx.pending.finish();
        waiter.await.unwrap();
    }

    #[test]
    fn features_merge_and_truthiness() {
        let (ctx, _rx) = context();
        assert!(!ctx.feature_enabled(FEATURE_FRIENDLY_NAMES));
        ctx.merge_features(Map::from_iter([
            (FEATURE_FRIENDLY_NAMES.to_string(), Value::Bool(true)),
            ("_user_feature".to_string(), Value::from(0u32)),
        ]));
        assert!(ctx.feature_enabled(FEATURE_FRIENDLY_NAMES));
        assert!(!ctx.feature_enabled("_user_feature"));
        assert_eq!(ctx.features().len(), 2);
    }

    #[tokio::test]
    async fn callback_invocation_is_queued_and_resolved() {
        let (ctx, mut rx) = context();
        let proxy = ctx.callback_proxy(4);
        let call = tokio::spawn(async move { proxy.call(vec![Value::from("hi")]).await });

        let Some(Outbound::Frame(msg)) = rx.recv().await else {
            panic!("expected a frame");
        };
        assert_eq!(msg.to_frame().unwrap(), r#"[5,0,4,{"args":["hi"]}]"#);

        ctx.callbacks().resolve(0, Ok(Value::from(42u32))).unwrap();
        assert_eq!(call.await.unwrap().unwrap(), Value::from(42u32));
    }

    #[tokio::test]
    async fn callback_after_close_fails_fast() {
        let (ctx, _rx) = context();
        ctx.set_state(ConnectionState::Closed);
        let err = ctx.invoke_callback(1, vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        assert_eq!(ctx.callbacks().waiting(), 0);
    }

    #[tokio::test]
    async fn callback_after_teardown_fails_while_state_still_open() {
        let (ctx, _rx) = context();
        ctx.set_state(ConnectionState::Open);
        ctx.callbacks().reject_all();

        let err = ctx.invoke_callback(1, vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        assert_eq!(ctx.callbacks().waiting(), 0);
    }

    #[tokio::test]
    async fn callback_with_dropped_writer_fails() {
        let (ctx, rx) = context();
        drop(rx);
        let err = ctx.invoke_callback(1, vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        assert_eq!(ctx.callbacks().waiting(), 0);
    }

    #[test]
    fn state_transitions_are_observable() {
        let (ctx, _rx) = context();
        let rx = ctx.subscribe_state();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
        ctx.set_state(ConnectionState::Open);
        assert_eq!(*rx.borrow(), ConnectionState::Open);
        assert_eq!(ctx.state(), ConnectionState::Open);
    }

    mod generated {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// `true` is a call received, `false` a reply sent; replies with
            /// nothing outstanding must leave the counter at zero.
            #[test]
            fn pending_counter_tracks_received_minus_sent(
                steps in prop::collection::vec(any::<bool>(), 0..64)
            ) {
                let (ctx, _rx) = context();
                let (mut received, mut sent) = (0u32, 0u32);
                for call_received in steps {
                    if call_received {
                        ctx.pending.begin();
                        received += 1;
                    } else {
                        ctx.pending.finish();
                        if sent < received {
                            sent += 1;
                        }
                    }
                    prop_assert_eq!(ctx.pending_calls().count(), received - sent);
                }
            }
        }
    }
}
