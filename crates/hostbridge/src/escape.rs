//! Escape codec.
//!
//! Values that JSON cannot carry (host objects, bound commands, `undefined`
//! and the non-finite numbers) are rewritten into tag sequences: arrays whose
//! first element is a string starting with `~`. A payload that contains any tag
//! is wrapped once more as `["~", payload, {"c": n}]`; the decoder only treats
//! arrays as tags inside such a wrapper, so plain payloads with literal `~`
//! strings pass through untouched.

use serde_json::json;

use crate::bridge::protocol::Target;
use crate::context::BridgeContext;
use crate::error::BridgeError;
use crate::host::HostRef;
use crate::object_table::ObjectTable;
use crate::value::{Map, Special, Value};

pub const TAG_WRAPPER: &str = "~";
pub const TAG_SEQUENCE: &str = "~~";
pub const TAG_LITERAL: &str = "~-";
pub const TAG_OBJECT: &str = "~@";
pub const TAG_COMMAND: &str = "~$";
pub const TAG_SPECIAL: &str = "~S";
/// Marker the backend emits when its own encoder failed.
pub const TAG_ENCODE_FAILED: &str = "~?";

/// True if `items` would be read as a tag sequence inside a wrapper.
pub fn is_tag_shaped(items: &[serde_json::Value]) -> bool {
    items.len() > 1 && items[0].as_str().is_some_and(|s| s.starts_with('~'))
}

fn tag_of(items: &[serde_json::Value]) -> Option<&str> {
    if is_tag_shaped(items) {
        items[0].as_str()
    } else {
        None
    }
}

/// Encodes one outbound payload. Create a fresh encoder per message.
pub struct Encoder<'a> {
    objects: &'a mut ObjectTable,
    auto_escape: bool,
    friendly_names: bool,
    count: u32,
}

impl<'a> Encoder<'a> {
    pub fn new(objects: &'a mut ObjectTable, auto_escape: bool) -> Self {
        Self {
            objects,
            auto_escape,
            friendly_names: false,
            count: 0,
        }
    }

    /// Include display names in object tags.
    pub fn with_friendly_names(mut self, enabled: bool) -> Self {
        self.friendly_names = enabled;
        self
    }

    /// Number of tags emitted so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn encode(&mut self, value: &Value) -> Result<serde_json::Value, BridgeError> {
        if !self.auto_escape {
            return self.encode_raw(value);
        }
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                let encoded = items
                    .iter()
                    .map(|item| self.encode(item))
                    .collect::<Result<Vec<_>, _>>()?;
                if is_tag_shaped(&encoded) {
                    self.count += 1;
                    json!([TAG_SEQUENCE, encoded])
                } else {
                    serde_json::Value::Array(encoded)
                }
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.encode(v)?);
                }
                serde_json::Value::Object(out)
            }
            Value::Special(special) => {
                self.count += 1;
                json!([TAG_SPECIAL, special.name()])
            }
            Value::Host(obj) => self.encode_object(obj, None),
            Value::Bound { object, receiver } => self.encode_object(object, Some(receiver)),
            Value::Command(cmd) => {
                self.count += 1;
                json!([TAG_COMMAND, cmd.call_id(), cmd.target()])
            }
        })
    }

    /// Non-escaping path: plain JSON, with a single `~-` guard when the
    /// result itself looks like a tag.
    fn encode_raw(&mut self, value: &Value) -> Result<serde_json::Value, BridgeError> {
        let plain = value.to_plain_json()?;
        let guarded = matches!(&plain, serde_json::Value::Array(items) if is_tag_shaped(items));
        if guarded {
            self.count += 1;
            Ok(json!([TAG_LITERAL, plain]))
        } else {
            Ok(plain)
        }
    }

    fn encode_object(&mut self, obj: &HostRef, receiver: Option<&HostRef>) -> serde_json::Value {
        self.count += 1;
        let handle = self.objects.get_handle(obj);
        let this_handle = match receiver {
            Some(receiver) if obj.is_invocable() => {
                Some(self.objects.get_handle(receiver)).filter(|h| *h != handle)
            }
            _ => None,
        };

        let mut tag = vec![json!(TAG_OBJECT), json!(handle)];
        if self.friendly_names || this_handle.is_some() {
            tag.push(json!(self.objects.display_name(handle)));
        }
        if let Some(this_handle) = this_handle {
            tag.push(json!(this_handle));
        }
        serde_json::Value::Array(tag)
    }

    /// Wrap `payload` if any tag was emitted.
    pub fn finish(self, payload: serde_json::Value) -> serde_json::Value {
        if self.count > 0 {
            json!([TAG_WRAPPER, payload, { "c": self.count }])
        } else {
            payload
        }
    }
}

/// Decodes one inbound payload.
pub struct Decoder<'a> {
    ctx: &'a BridgeContext,
    /// Options of every `~` wrapper currently open.
    contexts: Vec<serde_json::Value>,
}

impl<'a> Decoder<'a> {
    pub fn new(ctx: &'a BridgeContext) -> Self {
        Self {
            ctx,
            contexts: Vec::new(),
        }
    }

    pub fn decode(&mut self, wire: serde_json::Value) -> Result<Value, BridgeError> {
        match wire {
            serde_json::Value::Array(items) => {
                let is_tag = match tag_of(&items) {
                    Some(tag) => tag == TAG_WRAPPER || !self.contexts.is_empty(),
                    None => false,
                };
                if is_tag {
                    self.decode_tag(items)
                } else {
                    self.decode_all(items).map(Value::Array)
                }
            }
            serde_json::Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, self.decode(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(Value::from_json(other)),
        }
    }

    fn decode_all(&mut self, items: Vec<serde_json::Value>) -> Result<Vec<Value>, BridgeError> {
        items.into_iter().map(|item| self.decode(item)).collect()
    }

    fn decode_tag(&mut self, items: Vec<serde_json::Value>) -> Result<Value, BridgeError> {
        let mut items = items.into_iter();
        let tag = match items.next() {
            Some(serde_json::Value::String(tag)) => tag,
            _ => return Err(BridgeError::protocol("tag sequence without a tag")),
        };
        let mut args: Vec<serde_json::Value> = items.collect();

        match tag.as_str() {
            TAG_WRAPPER => {
                let payload = take(&mut args, 0);
                let options = take(&mut args, 1);
                self.contexts.push(options);
                let result = self.decode(payload);
                self.contexts.pop();
                result
            }
            TAG_SEQUENCE => match take(&mut args, 0) {
                serde_json::Value::Array(inner) => self.decode_all(inner).map(Value::Array),
                other => Err(BridgeError::protocol(format!(
                    "'~~' expects a sequence, got {}",
                    other
                ))),
            },
            TAG_LITERAL => Ok(Value::from_json(take(&mut args, 0))),
            TAG_OBJECT => {
                let handle = self.decode_handle(take(&mut args, 0))?;
                Ok(Value::Host(self.ctx.resolve(handle)?))
            }
            TAG_COMMAND => {
                if args.len() > 2 {
                    return Err(BridgeError::NotImplemented("compound commands".to_string()));
                }
                let call_id = self.decode(take(&mut args, 0))?.as_u32().ok_or_else(|| {
                    BridgeError::protocol("'~$' call id must be a non-negative integer")
                })?;
                let target: Target = serde_json::from_value(take(&mut args, 1))
                    .map_err(|_| BridgeError::protocol("'~$' target must be a name or a handle"))?;
                Ok(Value::Command(self.ctx.command_ref(call_id, target)?))
            }
            TAG_SPECIAL => {
                let name = self.decode(take(&mut args, 0))?;
                name.as_str()
                    .and_then(Special::from_name)
                    .map(Value::Special)
                    .ok_or_else(|| {
                        BridgeError::protocol(format!("unknown special value {:?}", name))
                    })
            }
            TAG_ENCODE_FAILED => {
                let what = take(&mut args, 0);
                Err(BridgeError::protocol(format!(
                    "backend failed to encode a value: {}",
                    what
                )))
            }
            other => Err(BridgeError::protocol(format!("unknown tag '{}'", other))),
        }
    }

    fn decode_handle(&mut self, raw: serde_json::Value) -> Result<u32, BridgeError> {
        self.decode(raw)?
            .as_u32()
            .ok_or_else(|| BridgeError::protocol("object handle must be a non-negative integer"))
    }
}

/// Move out the `idx`-th tag argument, `null` if absent.
fn take(args: &mut [serde_json::Value], idx: usize) -> serde_json::Value {
    args.get_mut(idx).map(serde_json::Value::take).unwrap_or_default()
}
