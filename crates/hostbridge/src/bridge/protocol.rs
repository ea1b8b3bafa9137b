//! Wire protocol types.
//!
//! Every frame is a JSON array `[mode, call_id, target, payload]`:
//! - **mode**: message role (see [`Mode`])
//! - **call_id**: correlates a call with its reply
//! - **target**: command name, callback handle, or reply status
//! - **payload**: call arguments or reply result, possibly escape-wrapped

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::BridgeError;

/// Reserved name carried by the terminal notification.
pub const CLOSE_TARGET: &str = "*close*";

/// Reply status in the target slot of a mode-1 message.
pub const STATUS_OK: u32 = 0;
pub const STATUS_ERROR: u32 = 1;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
    /// backend -> engine: invoke a named command, reply expected.
    Call = 0,
    /// engine -> backend: result or error of a call.
    Reply = 1,
    /// backend -> engine: invoke a named command, no reply.
    Notify = 2,
    /// engine -> backend: invoke a backend callback by handle.
    Callback = 5,
    /// backend -> engine: result of a callback invocation.
    CallbackReply = 6,
    /// engine -> backend: terminal notification before close.
    Close = 7,
}

impl Mode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Mode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Call),
            1 => Ok(Self::Reply),
            2 => Ok(Self::Notify),
            5 => Ok(Self::Callback),
            6 => Ok(Self::CallbackReply),
            7 => Ok(Self::Close),
            other => Err(other),
        }
    }
}

/// Third element of a message: a command name or a numeric handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Handle(u32),
    Name(String),
}

impl Target {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(handle) => write!(f, "{}", handle),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<u32> for Target {
    fn from(handle: u32) -> Self {
        Self::Handle(handle)
    }
}

/// One protocol message.
///
/// `mode` stays raw so that frames with modes this engine does not know still
/// parse and can be ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawMessage", into = "RawMessage")]
pub struct Message {
    pub mode: u8,
    pub call_id: u32,
    pub target: Target,
    pub payload: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct RawMessage(u8, u32, Target, serde_json::Value);

impl From<RawMessage> for Message {
    fn from(RawMessage(mode, call_id, target, payload): RawMessage) -> Self {
        Self {
            mode,
            call_id,
            target,
            payload,
        }
    }
}

impl From<Message> for RawMessage {
    fn from(msg: Message) -> Self {
        RawMessage(msg.mode, msg.call_id, msg.target, msg.payload)
    }
}

impl Message {
    pub fn new(mode: Mode, call_id: u32, target: Target, payload: serde_json::Value) -> Self {
        Self {
            mode: mode.as_u8(),
            call_id,
            target,
            payload,
        }
    }

    pub fn call(call_id: u32, name: &str, payload: serde_json::Value) -> Self {
        Self::new(Mode::Call, call_id, Target::name(name), payload)
    }

    /// Successful reply; `payload` is the already-encoded `{"result": ..}` block.
    pub fn reply(call_id: u32, payload: serde_json::Value) -> Self {
        Self::new(Mode::Reply, call_id, Target::Handle(STATUS_OK), payload)
    }

    pub fn error_reply(call_id: u32, error: &ErrorDescriptor) -> Self {
        Self::new(
            Mode::Reply,
            call_id,
            Target::Handle(STATUS_ERROR),
            json!({ "result": error }),
        )
    }

    /// Terminal notification sent right before the transport closes.
    pub fn terminal() -> Self {
        Self::new(
            Mode::Close,
            0,
            Target::name(CLOSE_TARGET),
            json!({ "result": null }),
        )
    }

    pub fn mode(&self) -> Option<Mode> {
        Mode::try_from(self.mode).ok()
    }

    pub fn is_error_reply(&self) -> bool {
        self.mode == Mode::Reply.as_u8() && self.target == Target::Handle(STATUS_ERROR)
    }

    pub fn from_frame(frame: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Call id of a frame that failed [`from_frame`](Self::from_frame) but
    /// still reads as `[0, <call id>, ...]`, so the call can be answered.
    pub fn salvage_call_id(frame: &str) -> Option<u32> {
        let value: serde_json::Value = serde_json::from_str(frame).ok()?;
        let items = value.as_array()?;
        if items.first()?.as_u64()? != u64::from(Mode::Call.as_u8()) {
            return None;
        }
        u32::try_from(items.get(1)?.as_u64()?).ok()
    }

    pub fn to_frame(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Structured error carried in the `result` of an error reply.
///
/// Serialized as `[name, message, file, line, column]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawDescriptor", into = "RawDescriptor")]
pub struct ErrorDescriptor {
    pub name: String,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

type RawDescriptor = (String, String, Option<String>, Option<u32>, Option<u32>);

impl From<RawDescriptor> for ErrorDescriptor {
    fn from((name, message, file, line, column): RawDescriptor) -> Self {
        Self {
            name,
            message,
            file,
            line,
            column,
        }
    }
}

impl From<ErrorDescriptor> for RawDescriptor {
    fn from(d: ErrorDescriptor) -> Self {
        (d.name, d.message, d.file, d.line, d.column)
    }
}

impl ErrorDescriptor {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            file: None,
            line: None,
            column: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}
