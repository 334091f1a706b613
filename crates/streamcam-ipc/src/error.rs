//! Error types shared between the engine and the UI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing a server URI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// The URI could not be parsed.
    #[error("Invalid server URI: {0}")]
    Malformed(String),

    /// Only plain `rtmp://` is supported.
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The URI has no host.
    #[error("Server URI has no host")]
    MissingHost,

    /// The path is not of the form `app/streamKey`.
    #[error("Server URI path must be app/streamKey, got {0:?}")]
    InvalidPath(String),
}

/// Settings rejected before any connection attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// No server URI configured.
    #[error("Server not set")]
    ServerNotSet,

    /// The server URI is unusable.
    #[error(transparent)]
    InvalidServer(#[from] EndpointError),

    /// Bitrate outside the accepted range.
    #[error("Bitrate {value} kbps is out of range. In kbps. Minimum: {min}, maximum: {max}")]
    BitrateOutOfRange { value: u32, min: u32, max: u32 },

    /// Framerate outside the accepted range.
    #[error("Framerate {value} is out of range. Minimum: {min:.1}, maximum: {max:.1}")]
    FramerateOutOfRange { value: f32, min: f32, max: f32 },

    /// The camera does not offer this resolution.
    #[error("{width}x{height} is not supported by the camera")]
    UnsupportedResolution { width: u32, height: u32 },
}

/// Caller-visible error categories, one per distinct UI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Settings were rejected before connecting.
    Validation,

    /// The server host name could not be resolved.
    HostNotFound,

    /// The OS refused the socket operation.
    PermissionDenied,

    /// The server closed the connection.
    RemoteClosed,

    /// The server refused the connection.
    ConnectionRefused,

    /// Connecting or writing timed out.
    ConnectionTimeout,

    /// Any other socket or protocol failure.
    Socket,
}

/// A terminal error as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingError {
    /// Error category.
    pub category: ErrorCategory,

    /// Human-readable message.
    pub message: String,
}

impl StreamingError {
    /// Dialog title used for every terminal error.
    pub const TITLE: &'static str = "Streaming error";

    /// Create a new streaming error.
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<&ValidationError> for StreamingError {
    fn from(err: &ValidationError) -> Self {
        Self::new(ErrorCategory::Validation, err.to_string())
    }
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", Self::TITLE, self.message)
    }
}
