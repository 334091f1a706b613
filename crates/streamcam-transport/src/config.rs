//! Transport tuning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_CHUNK_SIZE;

/// Timeouts and buffer limits for an [`RtmpTransport`](crate::RtmpTransport).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Upper bound for DNS resolution plus TCP connect.
    pub connect_timeout: Duration,

    /// Upper bound for the RTMP handshake.
    pub handshake_timeout: Duration,

    /// Upper bound for each of the connect and publish negotiations.
    pub negotiation_timeout: Duration,

    /// How long the outbound buffer may make no progress before the
    /// connection is declared timed out.
    pub write_stall_timeout: Duration,

    /// Time a single send call may spend writing before it returns with the
    /// remainder still buffered.
    pub write_budget: Duration,

    /// Outbound bytes allowed to queue before frames are refused.
    pub high_water_mark: usize,

    /// Outgoing chunk size announced to the server.
    pub chunk_size: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(10),
            write_stall_timeout: Duration::from_secs(10),
            write_budget: Duration::from_millis(20),
            high_water_mark: 2 * 1024 * 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}
