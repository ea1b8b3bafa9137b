//! hostbridge: client-side engine for a bidirectional remote-object bridge.
//!
//! A backend drives live host objects through named commands; the host calls
//! back into backend-registered callbacks. Values that JSON cannot carry cross
//! the wire as escape tags and integer handles.

pub mod bridge;
pub mod builtins;
pub mod callback;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod escape;
pub mod host;
pub mod object_table;
pub mod registry;
pub mod telemetry;
pub mod value;
mod version;

pub use bridge::protocol::{ErrorDescriptor, Message, Mode, Target};
pub use bridge::transport::{
    FrameSink, FrameSource, FramedTransport, MemoryPeer, MemoryTransport, PeerEvent, Transport,
    WebSocketTransport, memory_pair,
};
pub use callback::{CallbackProxy, CommandRef};
pub use config::BridgeConfig;
pub use context::{BridgeContext, ConnectionState};
pub use engine::Bridge;
pub use error::{BridgeError, ErrorKind, HandlerError, SourceLocation};
pub use host::{FnObject, HostObject, HostRef, PropertyObject, same_object};
pub use object_table::{ObjectTable, ROOT_HANDLE};
pub use registry::{Command, CommandHandler, CommandRegistry, Invocation};
pub use telemetry::init_tracing;
pub use value::{Map, Special, UNDEFINED, Value};
pub use version::{HOSTBRIDGE_VERSION, VersionInfo};
