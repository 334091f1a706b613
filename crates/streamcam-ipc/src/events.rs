//! Events sent from the engine to the UI.

use serde::{Deserialize, Serialize};

use crate::error::StreamingError;
use crate::settings::AcceptedRanges;
use crate::state::TransportState;
use crate::types::{StreamStatus, WarningType};

/// Events that the engine can send to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Transport state has changed.
    StateChanged {
        /// Previous state.
        previous: TransportState,

        /// Current state.
        current: TransportState,
    },

    /// Updated status snapshot.
    Status(Box<StreamStatus>),

    /// Performance warning detected.
    PerformanceWarning(WarningType),

    /// The session ended on a terminal error. Emitted once per session.
    StreamingError(StreamingError),

    /// Accepted setting ranges.
    AcceptedRanges(AcceptedRanges),

    /// Engine is ready.
    Ready,

    /// Engine has shut down.
    Shutdown,
}
