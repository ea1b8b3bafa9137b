//! Error types for the bridge engine.
//!
//! Handler-local failures are [`HandlerError`]s; everything the engine itself
//! can detect is a [`BridgeError`]. Both convert into the wire-level
//! [`ErrorDescriptor`] sent back in a mode-1 error reply.

use crate::bridge::protocol::ErrorDescriptor;

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Name or handle not registered.
    CommandUnknown,
    /// Stale or invalid object reference.
    ObjectHandleUnknown,
    /// Malformed tag nesting, unsupported compound invocation, bad frame shape.
    ProtocolViolation,
    /// Error raised inside a command handler.
    HandlerFailure,
    /// The transport ended while something was still waiting on it.
    ConnectionClosed,
    /// Transport could not be opened or failed underneath the engine.
    Transport,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("command unknown: {0}")]
    CommandUnknown(String),

    #[error("object handle unknown: {0}")]
    ObjectHandleUnknown(u32),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Recognised but unsupported protocol shape (compound `~$` invocations).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("connection closed")]
    ConnectionClosed,

    /// Handshake failure. The only fatal error of the bridge.
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CommandUnknown(_) => ErrorKind::CommandUnknown,
            Self::ObjectHandleUnknown(_) => ErrorKind::ObjectHandleUnknown,
            Self::ProtocolViolation(_) | Self::NotImplemented(_) | Self::Frame(_) => {
                ErrorKind::ProtocolViolation
            }
            Self::Handler(_) => ErrorKind::HandlerFailure,
            Self::ConnectionClosed => ErrorKind::ConnectionClosed,
            Self::Connect(_) | Self::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Error name as the backend sees it in an error reply.
    pub fn wire_name(&self) -> &str {
        match self {
            Self::CommandUnknown(_) => "CommandUnknownError",
            Self::ObjectHandleUnknown(_) => "ObjectHandleUnknownError",
            Self::ProtocolViolation(_) | Self::Frame(_) => "ProtocolViolationError",
            Self::NotImplemented(_) => "NotImplementedError",
            Self::Handler(e) => &e.name,
            Self::ConnectionClosed => "ConnectionClosedError",
            Self::Connect(_) | Self::Transport(_) => "TransportError",
        }
    }

    /// Build the `[name, message, file, line, column]` reply descriptor.
    pub fn descriptor(&self) -> ErrorDescriptor {
        match self {
            Self::CommandUnknown(name) => ErrorDescriptor::new(self.wire_name(), name.clone()),
            Self::ObjectHandleUnknown(handle) => {
                ErrorDescriptor::new(self.wire_name(), handle.to_string())
            }
            Self::ProtocolViolation(message) | Self::NotImplemented(message) => {
                ErrorDescriptor::new(self.wire_name(), message.clone())
            }
            Self::Handler(e) => e.descriptor(),
            Self::Frame(e) => ErrorDescriptor::new(self.wire_name(), e.to_string()),
            Self::ConnectionClosed => ErrorDescriptor::new(self.wire_name(), "connection closed"),
            Self::Connect(message) => ErrorDescriptor::new(self.wire_name(), message.clone()),
            Self::Transport(e) => ErrorDescriptor::new(self.wire_name(), e.to_string()),
        }
    }
}

/// Where a handler error originated, reported back to the backend verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Error raised by a command handler or a host object.
///
/// `name` is what the backend uses to pick an exception class
/// (e.g. `DOMAttributeError`), so keep it stable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct HandlerError {
    pub name: String,
    pub message: String,
    pub location: Option<SourceLocation>,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            location: None,
        }
    }

    /// Generic failure, reported as `Error`.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn at(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.location = Some(SourceLocation {
            file: file.into(),
            line,
            column,
        });
        self
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        let descriptor = ErrorDescriptor::new(self.name.clone(), self.message.clone());
        match &self.location {
            Some(loc) => descriptor.with_location(loc.file.clone(), loc.line, loc.column),
            None => descriptor,
        }
    }
}

/// Lets handlers use `?` on engine operations (handle lookups and the like)
/// while keeping the engine's error name on the wire.
impl From<BridgeError> for HandlerError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Handler(inner) => inner,
            other => {
                let descriptor = other.descriptor();
                Self::new(descriptor.name, descriptor.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_unknown_carries_requested_name() {
        let err = BridgeError::CommandUnknown("doesnotexist".to_string());
        assert_eq!(err.kind(), ErrorKind::CommandUnknown);
        let descriptor = err.descriptor();
        assert_eq!(descriptor.name, "CommandUnknownError");
        assert_eq!(descriptor.message, "doesnotexist");
        assert!(descriptor.file.is_none());
    }

    #[test]
    fn not_implemented_is_a_protocol_violation_with_its_own_name() {
        let err = BridgeError::NotImplemented("compound commands".to_string());
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(err.wire_name(), "NotImplementedError");
    }

    #[test]
    fn handler_error_keeps_location() {
        let err = HandlerError::new("DOMAttributeError", "no such attribute").at("app.js", 3, 14);
        let descriptor = BridgeError::from(err).descriptor();
        assert_eq!(descriptor.name, "DOMAttributeError");
        assert_eq!(descriptor.file.as_deref(), Some("app.js"));
        assert_eq!(descriptor.line, Some(3));
        assert_eq!(descriptor.column, Some(14));
    }

    #[test]
    fn bridge_error_into_handler_error_keeps_wire_name() {
        let err: HandlerError = BridgeError::ObjectHandleUnknown(9).into();
        assert_eq!(err.name, "ObjectHandleUnknownError");
        assert_eq!(err.message, "9");
    }

    #[test]
    fn display() {
        let err = BridgeError::ObjectHandleUnknown(4);
        assert_eq!(format!("{}", err), "object handle unknown: 4");

        let err = BridgeError::Handler(HandlerError::msg("boom"));
        assert_eq!(format!("{}", err), "Error: boom");
    }
}
