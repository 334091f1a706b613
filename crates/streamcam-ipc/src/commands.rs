//! Commands sent from the UI to the engine.

use serde::{Deserialize, Serialize};

use crate::settings::StreamSettings;

/// Commands that the UI can send to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Start streaming with the given settings.
    Start { settings: StreamSettings },

    /// Stop the current stream.
    Stop,

    /// Request a status snapshot of the current session.
    GetStatus,

    /// Request the accepted setting ranges for the settings form.
    GetAcceptedRanges,

    /// Shutdown the engine completely.
    Shutdown,
}
