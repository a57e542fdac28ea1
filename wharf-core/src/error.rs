//! Wharf Error Types
//!
//! Every failure the fabric can report, grouped the way callers react to them:
//! configuration mistakes surface synchronously, everything else travels through
//! the promise attached to a task.

use std::time::Duration;
use thiserror::Error;

/// Synchronous configuration failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Socket name was empty or whitespace
    #[error("socket name is required")]
    EmptyName,

    /// Pattern name did not match any supported socket pattern
    #[error("invalid socket pattern: {0}")]
    UnknownPattern(String),

    /// No socket registered under this name
    #[error("socket [{0}] not found")]
    UnknownSocket(String),

    /// Endpoint string could not be parsed
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// The socket's pattern cannot perform the requested operation
    #[error("socket [{socket}] ({pattern}) does not support {operation}")]
    Unsupported {
        socket: String,
        pattern: String,
        operation: &'static str,
    },

    /// Strict registration found a different descriptor under an existing name
    #[error("socket [{name}] already registered with different parameters: {existing}")]
    Conflicting { name: String, existing: String },

    /// Environment override could not be parsed
    #[error("invalid value for {name}: '{value}'")]
    InvalidSetting { name: String, value: String },

    /// Registry no longer accepts work
    #[error("registry is shut down")]
    ShutDown,
}

/// Payload decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Topic has no schema in the topic map
    #[error("no schema registered for topic '{0}'")]
    UnknownTopic(String),

    /// Payload did not match the topic's schema
    #[error("malformed payload for topic '{topic}' ({schema}): {reason}")]
    Malformed {
        topic: String,
        schema: &'static str,
        reason: String,
    },

    /// Message carried a topic no task on the socket was waiting for
    #[error("awaited topic '{expected}', received '{received}'")]
    TopicMismatch { expected: String, received: String },

    /// Frames did not have the shape the socket expects
    #[error("unexpected frame layout: {0}")]
    Framing(String),
}

/// Main error type for fabric operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    /// Invalid configuration or misuse of a socket
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Reply or received payload could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Message could not be handed to the transport
    #[error("send failed on [{socket}]: {reason}")]
    SendFailure { socket: String, reason: String },

    /// Socket or fabric closed while the task was outstanding
    #[error("socket [{0}] closed")]
    Closed(String),

    /// Request retry policy gave up
    #[error("request on [{socket}] gave up after {attempts} attempts")]
    RetriesExhausted { socket: String, attempts: u32 },

    /// Caller-imposed deadline elapsed before the reply arrived
    #[error("no reply within {0:?}")]
    DeadlineElapsed(Duration),

    /// Underlying transport reported an error
    #[error("transport error on [{socket}]: {reason}")]
    Transport { socket: String, reason: String },
}

/// Result type alias for fabric operations
pub type Result<T> = std::result::Result<T, FabricError>;

impl FabricError {
    /// Create an unknown-socket configuration error
    pub fn unknown_socket(name: impl Into<String>) -> Self {
        Self::Configuration(ConfigError::UnknownSocket(name.into()))
    }

    /// Create a send failure
    pub fn send_failure(socket: impl Into<String>, reason: impl ToString) -> Self {
        Self::SendFailure {
            socket: socket.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a transport error
    pub fn transport(socket: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            socket: socket.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error was raised synchronously by configuration
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Check if this error came from payload decoding
    #[must_use]
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    /// Check if the task ended because its socket went away
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let err: FabricError = ConfigError::UnknownPattern("FOO".into()).into();
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "configuration error: invalid socket pattern: FOO"
        );
    }

    #[test]
    fn test_decode_error_converts() {
        let err: FabricError = DecodeError::UnknownTopic("nope".into()).into();
        assert!(err.is_decode());
        assert!(!err.is_closed());
    }

    #[test]
    fn test_unknown_socket_message() {
        let err = FabricError::unknown_socket("cmd-req");
        assert_eq!(err.to_string(), "configuration error: socket [cmd-req] not found");
    }
}
