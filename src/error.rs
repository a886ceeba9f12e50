//! Error types for streaminghub-client.

use std::fmt;

use thiserror::Error;

/// gRPC-compatible status codes carried by remote errors.
pub mod status {
    /// The operation was cancelled.
    pub const CANCELLED: i32 = 1;
    /// Unknown error.
    pub const UNKNOWN: i32 = 2;
    /// A resource (here: client-result concurrency) has been exhausted.
    pub const RESOURCE_EXHAUSTED: i32 = 8;
    /// The method is not implemented by the receiver.
    pub const UNIMPLEMENTED: i32 = 12;
    /// Internal error.
    pub const INTERNAL: i32 = 13;
    /// The service is currently unavailable.
    pub const UNAVAILABLE: i32 = 14;
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectionReason {
    /// The server completed the stream.
    CompletedNormally,
    /// The transport or the protocol failed.
    Faulted(String),
    /// No client heartbeat response arrived within the configured timeout.
    TimedOut,
    /// The session was disposed locally.
    Disposed,
}

impl fmt::Display for DisconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompletedNormally => f.write_str("completed normally"),
            Self::Faulted(cause) => write!(f, "faulted: {cause}"),
            Self::TimedOut => f.write_str("heartbeat timed out"),
            Self::Disposed => f.write_str("disposed"),
        }
    }
}

/// Error reported by the remote side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote error (status {status_code}): {detail}")]
pub struct RemoteError {
    /// gRPC-compatible status code, see [`status`].
    pub status_code: i32,
    /// Short human-readable detail.
    pub detail: String,
    /// Optional extended message (stack trace, debug output).
    pub message: Option<String>,
}

impl RemoteError {
    /// Create a remote error without an extended message.
    pub fn new(status_code: i32, detail: impl Into<String>) -> Self {
        Self {
            status_code,
            detail: detail.into(),
            message: None,
        }
    }
}

/// Main error type for all hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (JSON payload codec).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed framing or message shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote method failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The session is closed.
    #[error("Disconnected: {0}")]
    Disconnected(DisconnectionReason),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HubError {
    /// Shorthand for a [`HubError::Remote`] with the given status and detail.
    pub fn remote(status_code: i32, detail: impl Into<String>) -> Self {
        Self::Remote(RemoteError::new(status_code, detail))
    }
}

impl From<rmp::encode::ValueWriteError> for HubError {
    fn from(err: rmp::encode::ValueWriteError) -> Self {
        match err {
            rmp::encode::ValueWriteError::InvalidMarkerWrite(e)
            | rmp::encode::ValueWriteError::InvalidDataWrite(e) => Self::Io(e),
        }
    }
}

impl From<rmp::decode::ValueReadError> for HubError {
    fn from(err: rmp::decode::ValueReadError) -> Self {
        Self::Protocol(format!("malformed message: {err}"))
    }
}

impl From<rmp::decode::NumValueReadError> for HubError {
    fn from(err: rmp::decode::NumValueReadError) -> Self {
        Self::Protocol(format!("malformed message: {err}"))
    }
}

/// Result type alias using HubError.
pub type Result<T> = std::result::Result<T, HubError>;
