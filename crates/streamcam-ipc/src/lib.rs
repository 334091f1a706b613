//! Typed UI<->Engine messages for StreamCam.
//!
//! This crate defines the message types exchanged between the settings UI
//! and the streaming engine, the per-session stream settings together with
//! their validation rules, and the transport state machine shared by every
//! layer of the pipeline.

mod commands;
mod endpoint;
mod error;
mod events;
mod settings;
mod state;
mod types;

pub use commands::EngineCommand;
pub use endpoint::{RtmpEndpoint, DEFAULT_RTMP_PORT};
pub use error::{EndpointError, ErrorCategory, StreamingError, ValidationError};
pub use events::EngineEvent;
pub use settings::{
    AcceptedRanges, CameraModes, Resolution, StreamSettings, MAX_BITRATE_KBPS, MAX_FRAMERATE,
    MIN_BITRATE_KBPS, MIN_FRAMERATE,
};
pub use state::TransportState;
pub use types::{StreamStatus, WarningType};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (UI → Engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (Engine → UI).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<EngineCommand>, Receiver<EngineCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
