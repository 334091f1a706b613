//! Session error types.

use streamcam_ipc::ValidationError;
use streamcam_transport::{MuxError, TransportError};
use thiserror::Error;

/// Why a session could not be started.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StartError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("A session is already streaming")]
    AlreadyStreaming,

    #[error(transparent)]
    Transport(TransportError),

    #[error("Session was stopped while connecting")]
    Cancelled,
}

/// Why a frame could not be fed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Unknown session")]
    UnknownSession,

    #[error("Session has ended")]
    SessionEnded,

    #[error("Frame rejected: {0}")]
    Mux(#[from] MuxError),

    /// The session ended on this error; it has already been reported.
    #[error("Session failed: {0}")]
    Terminal(TransportError),
}

/// Why a session could not be stopped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopError {
    #[error("Unknown session")]
    UnknownSession,
}
