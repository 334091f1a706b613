//! Error types for the transport module.

use std::io;

use streamcam_ipc::{ErrorCategory, StreamingError, TransportState};
use thiserror::Error;

use crate::frame::MediaType;

/// Errors that can occur during transport operations.
///
/// Socket-level variants render the exact text shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Host name did not resolve.
    #[error("Socket error! {host} was not found.")]
    HostNotFound { host: String },

    /// The OS refused the socket operation.
    #[error("Socket error! The socket operation failed because the application lacked the required privileges.")]
    PermissionDenied,

    /// The server closed the connection.
    #[error("Socket error! {host} closed the connection.")]
    RemoteClosed { host: String },

    /// The server refused the connection.
    #[error("Socket error! {host} refused connection.")]
    ConnectionRefused { host: String },

    /// Connect, handshake or write did not complete in time.
    #[error("Socket error! Connection to {host} timed out.")]
    ConnectionTimeout { host: String },

    /// Any other socket failure.
    #[error("Socket error! {0}")]
    Socket(String),

    /// Handshake or session protocol failure.
    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    /// The server rejected the connect or publish request.
    #[error("Server rejected the stream: {0}")]
    Rejected(String),

    /// Invalid server URI.
    #[error("Invalid RTMP URL: {0}")]
    InvalidUrl(String),

    /// Outbound buffer is past its high-water mark.
    #[error("Outbound buffer full ({buffered} bytes pending)")]
    Backpressure { buffered: usize },

    /// Media sent while not publishing.
    #[error("Not publishing")]
    NotPublishing,

    /// Illegal state machine transition.
    #[error("Invalid transport transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransportState,
        to: TransportState,
    },

    /// The operation was cancelled by a stop request.
    #[error("Cancelled")]
    Cancelled,
}

impl TransportError {
    /// Map an I/O error on a connection to `host`.
    pub fn from_io(err: io::Error, host: &str) -> Self {
        let host = host.to_string();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused { host },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::TimedOut => Self::ConnectionTimeout { host },
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => Self::RemoteClosed { host },
            _ => Self::Socket(err.to_string()),
        }
    }

    /// Returns true if the error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Backpressure { .. }
                | Self::Cancelled
                | Self::NotPublishing
                | Self::InvalidTransition { .. }
                | Self::InvalidUrl(_)
        )
    }

    /// The caller-visible category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HostNotFound { .. } => ErrorCategory::HostNotFound,
            Self::PermissionDenied => ErrorCategory::PermissionDenied,
            Self::RemoteClosed { .. } => ErrorCategory::RemoteClosed,
            Self::ConnectionRefused { .. } => ErrorCategory::ConnectionRefused,
            Self::ConnectionTimeout { .. } => ErrorCategory::ConnectionTimeout,
            Self::InvalidUrl(_) => ErrorCategory::Validation,
            _ => ErrorCategory::Socket,
        }
    }

    /// The notification payload for the UI.
    pub fn to_streaming_error(&self) -> StreamingError {
        StreamingError::new(self.category(), self.to_string())
    }
}

/// Errors produced while muxing a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// Metadata has not been set for the session.
    #[error("Stream not initialized")]
    StreamNotInitialized,

    /// Frame has no payload.
    #[error("Empty {0:?} frame")]
    EmptyFrame(MediaType),

    /// Frame payload could not be parsed.
    #[error("Malformed {media:?} frame: {reason}")]
    MalformedFrame { media: MediaType, reason: String },

    /// Frame timestamp went backwards.
    #[error("{media:?} timestamp regressed from {previous} ms to {current} ms")]
    TimestampRegression {
        media: MediaType,
        previous: u64,
        current: u64,
    },

    /// Message payload does not fit the 24-bit length field.
    #[error("Frame of {0} bytes exceeds the RTMP message size limit")]
    FrameTooLarge(usize),

    /// onMetaData could not be encoded.
    #[error("Metadata encoding failed: {0}")]
    Metadata(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let host = "cam.example.com".to_string();

        assert_eq!(
            TransportError::HostNotFound { host: host.clone() }.to_string(),
            "Socket error! cam.example.com was not found."
        );
        assert_eq!(
            TransportError::RemoteClosed { host: host.clone() }.to_string(),
            "Socket error! cam.example.com closed the connection."
        );
        assert_eq!(
            TransportError::ConnectionRefused { host: host.clone() }.to_string(),
            "Socket error! cam.example.com refused connection."
        );
        assert_eq!(
            TransportError::ConnectionTimeout { host }.to_string(),
            "Socket error! Connection to cam.example.com timed out."
        );
    }

    #[test]
    fn test_from_io_categories() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, ErrorCategory::ConnectionRefused),
            (io::ErrorKind::PermissionDenied, ErrorCategory::PermissionDenied),
            (io::ErrorKind::TimedOut, ErrorCategory::ConnectionTimeout),
            (io::ErrorKind::ConnectionReset, ErrorCategory::RemoteClosed),
            (io::ErrorKind::BrokenPipe, ErrorCategory::RemoteClosed),
            (io::ErrorKind::Other, ErrorCategory::Socket),
        ];

        for (kind, category) in cases {
            let err = TransportError::from_io(io::Error::new(kind, "boom"), "host");
            assert_eq!(err.category(), category, "{kind:?}");
        }
    }

    #[test]
    fn test_backpressure_is_not_fatal() {
        assert!(!TransportError::Backpressure { buffered: 10 }.is_fatal());
        assert!(!TransportError::Cancelled.is_fatal());
        assert!(TransportError::RemoteClosed {
            host: "h".to_string()
        }
        .is_fatal());
    }
}
