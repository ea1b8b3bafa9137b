//! Dispatch engine.
//!
//! One task per connection reads frames, routes them by mode and drives every
//! in-flight handler future; a second task owns the transport's sink and
//! writes whatever the context queues. Handler bodies never run in parallel:
//! a handler is polled once when its frame arrives and afterwards only from
//! the dispatch loop.

use std::sync::Arc;
use std::task::Poll;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::bridge::protocol::{Message, Mode, Target};
use crate::bridge::transport::{FrameSink, FrameSource, Transport, WebSocketTransport};
use crate::builtins;
use crate::config::BridgeConfig;
use crate::context::{BridgeContext, ConnectionState, Outbound};
use crate::error::BridgeError;
use crate::host::HostRef;
use crate::registry::{Command, CommandRegistry, Invocation};
use crate::value::{Map, Value};

/// WebSocket normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket internal error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Close reason sent after the shutdown command.
pub const CLOSE_REASON_SHUTDOWN: &str = "*last*";

/// Result of one in-flight future.
enum Completion {
    /// A mode-0 call finished; `message` is its reply.
    Reply { call_id: u32, message: Message },
    /// A notification finished; nothing to send.
    Done,
}

enum StopReason {
    CloseRequested,
    PeerClosed,
    ReadFailed(std::io::Error),
}

type Prepared = (Arc<Command>, Vec<Value>, Map);

/// Client-side bridge for one connection.
pub struct Bridge {
    context: Arc<BridgeContext>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    config: BridgeConfig,
}

impl Bridge {
    /// Create a bridge whose handle 0 is `root`, with the reserved commands
    /// already registered.
    pub fn new(config: BridgeConfig, root: HostRef) -> Self {
        let (context, outbound) = BridgeContext::new(&config, root);
        builtins::register(context.commands());
        Self {
            context,
            outbound,
            config,
        }
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.context
    }

    pub fn commands(&self) -> &CommandRegistry {
        self.context.commands()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Open a WebSocket to the configured backend and run until closed.
    pub async fn connect(self) -> Result<(), BridgeError> {
        let url = self.config.connection_url();
        let transport = WebSocketTransport::connect(&url).await?;
        self.run(transport).await
    }

    /// Run the protocol over an already-open transport until it closes.
    pub async fn run<T: Transport>(self, transport: T) -> Result<(), BridgeError> {
        let Bridge {
            context: ctx,
            outbound,
            ..
        } = self;
        let (mut source, sink) = transport.split();
        let writer = tokio::spawn(write_frames(sink, outbound));

        ctx.set_state(ConnectionState::Open);
        tracing::info!(client_id = %ctx.client_id(), "Bridge open");

        let mut in_flight: FuturesUnordered<BoxFuture<'static, Completion>> =
            FuturesUnordered::new();

        // The bootstrap call never crosses the wire; dispatch it as if it had.
        let features = Value::Object(ctx.features())
            .to_plain_json()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Features not representable, bootstrapping without them");
                json!({})
            });
        let bootstrap = Message::call(0, builtins::FIRST, json!({"args": [], "kwargs": features}));
        dispatch(&ctx, bootstrap, &mut in_flight).await;

        let reason = loop {
            tokio::select! {
                biased;

                _ = ctx.close_requested() => break StopReason::CloseRequested,

                Some(completion) = in_flight.next(), if !in_flight.is_empty() => {
                    complete(&ctx, completion);
                }

                frame = source.next_frame() => match frame {
                    Some(Ok(text)) => match Message::from_frame(&text) {
                        Ok(msg) => dispatch(&ctx, msg, &mut in_flight).await,
                        Err(e) => reject_malformed(&ctx, &text, e),
                    },
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Transport read failed");
                        break StopReason::ReadFailed(e);
                    }
                    None => break StopReason::PeerClosed,
                },
            }
        };

        let result = match reason {
            StopReason::CloseRequested => {
                tracing::info!(abandoned = in_flight.len(), "Closing after shutdown request");
                let _ = ctx.send(Message::terminal());
                let _ = ctx.enqueue(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: CLOSE_REASON_SHUTDOWN.to_string(),
                });
                Ok(())
            }
            StopReason::PeerClosed => {
                tracing::info!(abandoned = in_flight.len(), "Peer closed the connection");
                let _ = ctx.enqueue(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "peer closed".to_string(),
                });
                Ok(())
            }
            StopReason::ReadFailed(e) => {
                let _ = ctx.enqueue(Outbound::Close {
                    code: CLOSE_INTERNAL_ERROR,
                    reason: "transport error".to_string(),
                });
                Err(BridgeError::Transport(e))
            }
        };

        ctx.set_state(ConnectionState::Closed);
        ctx.callbacks().reject_all();
        drop(in_flight);

        if let Err(e) = writer.await {
            tracing::error!(error = %e, "Writer task failed");
        }
        result
    }
}

/// Route one inbound message by mode.
async fn dispatch(
    ctx: &Arc<BridgeContext>,
    msg: Message,
    in_flight: &mut FuturesUnordered<BoxFuture<'static, Completion>>,
) {
    tracing::trace!(mode = msg.mode, call_id = msg.call_id, target = %msg.target, "<- frame");

    let future = match msg.mode() {
        Some(Mode::Call) => {
            ctx.pending_calls().begin();
            let prepared = prepare(ctx, msg.target, msg.payload);
            run_call(ctx.clone(), msg.call_id, prepared).boxed()
        }
        Some(Mode::Notify) => {
            let target = msg.target.clone();
            let prepared = prepare(ctx, msg.target, msg.payload);
            run_notification(ctx.clone(), msg.call_id, target, prepared).boxed()
        }
        Some(Mode::CallbackReply) => {
            let result = ctx.decode(msg.payload).map(callback_result);
            if let Err(e) = ctx.callbacks().resolve(msg.call_id, result) {
                tracing::warn!(call_id = msg.call_id, error = %e, "Unmatched callback reply");
            }
            return;
        }
        _ => {
            tracing::debug!(mode = msg.mode, call_id = msg.call_id, "Ignoring message with unhandled mode");
            return;
        }
    };

    // Start the handler now so bodies begin in arrival order.
    let mut future = future;
    match futures::poll!(&mut future) {
        Poll::Ready(completion) => complete(ctx, completion),
        Poll::Pending => in_flight.push(future),
    }
}

/// Answer a malformed call with a protocol error if its call id is readable,
/// otherwise drop the frame.
fn reject_malformed(ctx: &BridgeContext, text: &str, error: BridgeError) {
    let Some(call_id) = Message::salvage_call_id(text) else {
        tracing::warn!(error = %error, "Dropping malformed frame");
        return;
    };
    tracing::warn!(call_id, error = %error, "Malformed call frame");
    ctx.pending_calls().begin();
    let reply = BridgeError::protocol(format!("malformed call frame: {}", error));
    let message = Message::error_reply(call_id, &reply.descriptor());
    complete(ctx, Completion::Reply { call_id, message });
}

/// Look up the command, then decode its arguments.
fn prepare(
    ctx: &BridgeContext,
    target: Target,
    payload: serde_json::Value,
) -> Result<Prepared, BridgeError> {
    let command = match &target {
        Target::Name(name) => ctx.commands().lookup(name)?,
        Target::Handle(_) => return Err(BridgeError::CommandUnknown(target.to_string())),
    };
    let (args, kwargs) = split_payload(ctx.decode(payload)?)?;
    Ok((command, args, kwargs))
}

/// `{"args": [...], "kwargs": {...}}`, both optional.
fn split_payload(payload: Value) -> Result<(Vec<Value>, Map), BridgeError> {
    let mut map = match payload {
        Value::Object(map) => map,
        v if v.is_nullish() => return Ok((Vec::new(), Map::new())),
        other => {
            return Err(BridgeError::protocol(format!(
                "call payload must be a mapping, got {}",
                other.type_name()
            )));
        }
    };
    let args = match map.shift_remove("args") {
        None => Vec::new(),
        Some(Value::Array(args)) => args,
        Some(v) if v.is_nullish() => Vec::new(),
        Some(other) => {
            return Err(BridgeError::protocol(format!(
                "args must be a sequence, got {}",
                other.type_name()
            )));
        }
    };
    let kwargs = match map.shift_remove("kwargs") {
        None => Map::new(),
        Some(Value::Object(kwargs)) => kwargs,
        Some(v) if v.is_nullish() => Map::new(),
        Some(other) => {
            return Err(BridgeError::protocol(format!(
                "kwargs must be a mapping, got {}",
                other.type_name()
            )));
        }
    };
    Ok((args, kwargs))
}

/// Mode-6 payloads mirror replies: `{"result": r}` resolves to `r`.
fn callback_result(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.shift_remove("result") {
            Some(result) => result,
            None => Value::Object(map),
        },
        other => other,
    }
}

async fn run_call(
    ctx: Arc<BridgeContext>,
    call_id: u32,
    prepared: Result<Prepared, BridgeError>,
) -> Completion {
    let message = match prepared {
        Err(e) => {
            tracing::debug!(call_id, error = %e, "Call rejected");
            Message::error_reply(call_id, &e.descriptor())
        }
        Ok((command, args, kwargs)) => {
            let invocation = Invocation {
                call_id,
                args,
                kwargs,
                context: ctx.clone(),
                expects_reply: true,
            };
            match command.handler.invoke(invocation).await {
                Ok(value) => {
                    let value = if value.is_undefined() { Value::Null } else { value };
                    match ctx.encode_result(&value, command.auto_escape) {
                        Ok(payload) => Message::reply(call_id, payload),
                        Err(e) => {
                            tracing::warn!(call_id, command = %command.name, error = %e, "Result not encodable");
                            Message::error_reply(call_id, &e.descriptor())
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(call_id, command = %command.name, error = %e, "Handler failed");
                    Message::error_reply(call_id, &e.descriptor())
                }
            }
        }
    };
    Completion::Reply { call_id, message }
}

async fn run_notification(
    ctx: Arc<BridgeContext>,
    call_id: u32,
    target: Target,
    prepared: Result<Prepared, BridgeError>,
) -> Completion {
    match prepared {
        Err(BridgeError::CommandUnknown(name)) => {
            tracing::debug!(command = %name, "Ignoring notification for unknown command");
        }
        Err(e) => {
            tracing::warn!(command = %target, error = %e, "Dropping notification");
        }
        Ok((command, args, kwargs)) => {
            let invocation = Invocation {
                call_id,
                args,
                kwargs,
                context: ctx,
                expects_reply: false,
            };
            if let Err(e) = command.handler.invoke(invocation).await {
                tracing::warn!(command = %command.name, error = %e, "Notification handler failed");
            }
        }
    }
    Completion::Done
}

fn complete(ctx: &BridgeContext, completion: Completion) {
    let Completion::Reply { call_id, message } = completion else {
        return;
    };
    if ctx.is_closing() {
        tracing::debug!(call_id, "Close requested, reply not sent");
    } else if ctx.send(message).is_err() {
        tracing::warn!(call_id, "Writer gone, reply dropped");
    }
    ctx.pending_calls().finish();
}

/// Writer task: drain the outbound queue into the sink until a close.
async fn write_frames<S: FrameSink>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(msg) => {
                let frame = match msg.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(call_id = msg.call_id, error = %e, "Failed to serialize frame");
                        continue;
                    }
                };
                tracing::trace!(mode = msg.mode, call_id = msg.call_id, target = %msg.target, "-> frame");
                if let Err(e) = sink.send_frame(frame).await {
                    tracing::warn!(error = %e, "Failed to send frame");
                }
            }
            Outbound::Close { code, reason } => {
                if let Err(e) = sink.close(code, &reason).await {
                    tracing::debug!(error = %e, "Close was not delivered");
                }
                return;
            }
        }
    }
}
