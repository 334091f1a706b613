//! Session management and orchestration for StreamCam.
//!
//! [`ConnectionManager`] owns the single outbound stream: it validates
//! settings, drives the RTMP transport and accounts for every frame.
//! [`Engine`] puts it behind the command, event and frame channels the UI
//! talks to.

mod error;
mod health;
mod manager;
mod orchestrator;
mod sink;

pub use error::{FeedError, StartError, StopError};
pub use health::{dropped_percent, HealthMonitor, HealthSnapshot};
pub use manager::{ConnectionManager, FeedOutcome, SessionHandle};
pub use orchestrator::{Engine, EngineConfig};
pub use sink::{FrameSink, Offer};

use std::io;

use crossbeam_channel::{Receiver, Sender};
use streamcam_ipc::{EngineCommand, EngineEvent};

/// Frames the capture path may queue ahead of the streaming thread.
pub const FRAME_CHANNEL_CAPACITY: usize = 128;

/// Create an engine instance with IPC channels, plus the sink capture code
/// feeds frames into.
pub fn create_engine(
    command_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
    config: EngineConfig,
) -> io::Result<(Engine, FrameSink)> {
    Engine::new(command_rx, event_tx, config)
}
