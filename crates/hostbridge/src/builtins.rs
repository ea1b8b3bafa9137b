//! Reserved protocol commands, registered on every bridge.

use crate::context::ConnectionState;
use crate::error::HandlerError;
use crate::host::HostRef;
use crate::registry::{Command, CommandRegistry, Invocation};
use crate::value::{Map, UNDEFINED, Value};

pub const FIRST: &str = "*first*";
pub const LAST: &str = "*last*";
pub const FEATURES: &str = "*features*";
pub const GET_COMMANDS: &str = "*getcmds*";
pub const GC: &str = "*gc*";
pub const SET_FRIENDLY_NAME: &str = "*setfrn*";
pub const GET: &str = "*get*";
pub const SET: &str = "*set*";
pub const CALL: &str = "*call*";

pub fn register(registry: &CommandRegistry) {
    registry.register(Command::sync(FIRST, first).raw());
    registry.register(Command::from_async(LAST, last).raw());
    registry.register(Command::sync(FEATURES, features).raw());
    registry.register(Command::sync(GET_COMMANDS, get_commands).raw());
    registry.register(Command::sync(GC, gc).raw());
    registry.register(Command::sync(SET_FRIENDLY_NAME, set_friendly_name).raw());
    registry.register(Command::sync(GET, get));
    registry.register(Command::sync(SET, set));
    registry.register(Command::sync(CALL, call));
}

/// Bootstrap: record the backend's feature flags, report who we are.
fn first(inv: Invocation) -> Result<Value, HandlerError> {
    inv.context.merge_features(inv.kwargs);
    let mut result = Map::new();
    result.insert("cid".to_string(), Value::from(inv.context.client_id()));
    result.insert("ua".to_string(), Value::from(inv.context.user_agent()));
    Ok(Value::Object(result))
}

/// Shutdown: wait for every other in-flight call, then ask for close.
async fn last(inv: Invocation) -> Result<Value, HandlerError> {
    let ctx = inv.context;
    if ctx.state() == ConnectionState::Draining || ctx.is_closing() {
        tracing::debug!(call_id = inv.call_id, "Shutdown already in progress");
        return Ok(Value::Null);
    }
    ctx.set_state(ConnectionState::Draining);
    // a mode-0 shutdown counts itself
    let limit = u32::from(inv.expects_reply);
    ctx.drain(limit).await;
    ctx.request_close();
    Ok(Value::Null)
}

fn features(inv: Invocation) -> Result<Value, HandlerError> {
    Ok(Value::Object(inv.context.features()))
}

fn get_commands(inv: Invocation) -> Result<Value, HandlerError> {
    Ok(Value::Array(
        inv.context
            .commands()
            .names()
            .into_iter()
            .map(Value::from)
            .collect(),
    ))
}

fn gc(inv: Invocation) -> Result<Value, HandlerError> {
    let handle = inv.u32_arg(0)?;
    if !inv.context.release(handle) {
        tracing::debug!(handle, "Collection of unknown or root handle ignored");
    }
    Ok(Value::Null)
}

fn set_friendly_name(inv: Invocation) -> Result<Value, HandlerError> {
    let obj = inv.host_arg(0)?;
    let name = inv.str_arg(1)?;
    inv.context.set_display_name(&obj, name);
    Ok(Value::Null)
}

fn get(inv: Invocation) -> Result<Value, HandlerError> {
    let obj = inv.host_arg(0)?;
    let name = inv.str_arg(1)?;
    match obj.get(name) {
        None => Err(HandlerError::new(
            "DOMAttributeError",
            format!("object has no attribute '{}'", name),
        )),
        Some(Value::Host(value)) => Ok(Value::Bound {
            object: value,
            receiver: obj,
        }),
        Some(value) => Ok(value),
    }
}

fn set(inv: Invocation) -> Result<Value, HandlerError> {
    let obj = inv.host_arg(0)?;
    let name = inv.str_arg(1)?;
    let value = inv.arg(2).cloned().unwrap_or(UNDEFINED);
    obj.set(name, value)?;
    Ok(UNDEFINED)
}

fn call(inv: Invocation) -> Result<Value, HandlerError> {
    let func = match inv.kwarg("objid") {
        Some(Value::Host(obj)) => obj.clone(),
        Some(id) => {
            let handle = id
                .as_u32()
                .ok_or_else(|| HandlerError::type_error("objid must be an object handle"))?;
            inv.context.resolve(handle)?
        }
        None => return Err(HandlerError::type_error("missing objid")),
    };
    let receiver: Option<HostRef> = match inv.kwarg("cntx") {
        None => None,
        Some(v) if v.is_nullish() => None,
        Some(v) => Some(
            v.as_host()
                .cloned()
                .ok_or_else(|| HandlerError::type_error("cntx must be an object or null"))?,
        ),
    };
    func.invoke(receiver.as_ref(), inv.args)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::BridgeContext;
    use crate::context::tests::context;
    use crate::host::{FnObject, PropertyObject, same_object};

    fn invocation(ctx: &Arc<BridgeContext>, args: Vec<Value>, kwargs: Map) -> Invocation {
        Invocation {
            call_id: 1,
            args,
            kwargs,
            context: ctx.clone(),
            expects_reply: true,
        }
    }

    #[test]
    fn all_reserved_commands_registered() {
        let (ctx, _rx) = context();
        register(ctx.commands());
        assert_eq!(
            ctx.commands().names(),
            [FIRST, LAST, FEATURES, GET_COMMANDS, GC, SET_FRIENDLY_NAME, GET, SET, CALL]
        );
        assert!(!ctx.commands().lookup(GC).unwrap().auto_escape);
        assert!(ctx.commands().lookup(GET).unwrap().auto_escape);
    }

    #[test]
    fn first_merges_features_and_reports_identity() {
        let (ctx, _rx) = context();
        let kwargs = Map::from_iter([("_user_feature".to_string(), Value::Bool(true))]);
        let result = first(invocation(&ctx, vec![], kwargs)).unwrap();
        assert_eq!(
            result.to_plain_json().unwrap(),
            serde_json::json!({"cid": "test-cid", "ua": "test-agent"})
        );
        assert!(ctx.feature_enabled("_user_feature"));
    }

    #[tokio::test]
    async fn last_from_notification_drains_to_zero() {
        let (ctx, _rx) = context();
        ctx.pending_calls().begin();
        let mut inv = invocation(&ctx, vec![], Map::new());
        inv.expects_reply = false;

        let shutdown = tokio::spawn(last(inv));
        tokio::task::yield_now().await;
        assert!(!ctx.is_closing());

        ctx.pending_calls().finish();
        shutdown.await.unwrap().unwrap();
        assert!(ctx.is_closing());
    }

    #[tokio::test]
    async fn last_is_a_no_op_while_draining() {
        let (ctx, _rx) = context();
        ctx.set_state(ConnectionState::Draining);
        ctx.pending_calls().begin();
        ctx.pending_calls().begin();

        let result = last(invocation(&ctx, vec![], Map::new())).await.unwrap();
        assert_eq!(result, Value::Null);
        assert!(!ctx.is_closing());
    }

    #[test]
    fn get_missing_attribute() {
        let (ctx, _rx) = context();
        let obj = PropertyObject::new("div").into_ref();
        let err = get(invocation(
            &ctx,
            vec![Value::Host(obj), Value::from("nope")],
            Map::new(),
        ))
        .unwrap_err();
        assert_eq!(err.name, "DOMAttributeError");
        assert_eq!(err.message, "object has no attribute 'nope'");
    }

    #[test]
    fn get_host_property_is_bound_to_owner() {
        let (ctx, _rx) = context();
        let method = FnObject::new("focus", |_, _| Ok(Value::Null)).into_ref();
        let owner = PropertyObject::new("input")
            .with_property("focus", method.clone())
            .into_ref();

        let result = get(invocation(
            &ctx,
            vec![Value::Host(owner.clone()), Value::from("focus")],
            Map::new(),
        ))
        .unwrap();
        match result {
            Value::Bound { object, receiver } => {
                assert!(same_object(&object, &method));
                assert!(same_object(&receiver, &owner));
            }
            other => panic!("expected bound value, got {:?}", other),
        }
    }

    #[test]
    fn set_then_get() {
        let (ctx, _rx) = context();
        let obj = PropertyObject::new("div").into_ref();
        set(invocation(
            &ctx,
            vec![Value::Host(obj.clone()), Value::from("title"), Value::from("x")],
            Map::new(),
        ))
        .unwrap();
        assert_eq!(obj.get("title"), Some(Value::from("x")));
    }

    #[test]
    fn call_uses_objid_and_receiver() {
        let (ctx, _rx) = context();
        let owner = PropertyObject::new("div").with_property("id", "main").into_ref();
        let func = FnObject::new("getId", |this, args| {
            let this = this.ok_or_else(|| HandlerError::type_error("no this"))?;
            let suffix = args.first().and_then(Value::as_str).unwrap_or("");
            let id = this.get("id").and_then(|v| v.as_str().map(str::to_string));
            Ok(Value::from(format!("{}{}", id.unwrap_or_default(), suffix)))
        })
        .into_ref();
        let handle = ctx.handle_of(&func);

        let kwargs = Map::from_iter([
            ("objid".to_string(), Value::from(handle)),
            ("cntx".to_string(), Value::Host(owner)),
        ]);
        let result = call(invocation(&ctx, vec![Value::from("!")], kwargs)).unwrap();
        assert_eq!(result, Value::from("main!"));
    }

    #[test]
    fn call_unknown_objid() {
        let (ctx, _rx) = context();
        let kwargs = Map::from_iter([("objid".to_string(), Value::from(77u32))]);
        let err = call(invocation(&ctx, vec![], kwargs)).unwrap_err();
        assert_eq!(err.name, "ObjectHandleUnknownError");
    }

    #[test]
    fn gc_releases_but_never_root() {
        let (ctx, _rx) = context();
        let obj = PropertyObject::new("div").into_ref();
        let handle = ctx.handle_of(&obj);

        gc(invocation(&ctx, vec![Value::from(handle)], Map::new())).unwrap();
        assert!(ctx.resolve(handle).is_err());

        gc(invocation(&ctx, vec![Value::from(0u32)], Map::new())).unwrap();
        assert!(ctx.resolve(0).is_ok());
    }

    #[test]
    fn setfrn_names_object() {
        let (ctx, _rx) = context();
        let obj = PropertyObject::new("div").into_ref();
        set_friendly_name(invocation(
            &ctx,
            vec![Value::Host(obj.clone()), Value::from("header")],
            Map::new(),
        ))
        .unwrap();
        let wire = ctx.encode_result(&Value::Host(obj), true).unwrap();
        // names only appear with the feature on
        assert_eq!(wire, serde_json::json!(["~", {"result": ["~@", 1]}, {"c": 1}]));
    }
}
