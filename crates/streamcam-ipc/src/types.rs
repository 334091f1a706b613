//! Common types used across IPC messages.

use serde::{Deserialize, Serialize};

use crate::error::StreamingError;
use crate::settings::Resolution;
use crate::state::TransportState;

/// Status snapshot of the current (or last) session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStatus {
    /// Display form of the server (`host:port/app/key`), if a session exists.
    pub server: Option<String>,

    /// Configured resolution.
    pub resolution: Option<Resolution>,

    /// Configured framerate.
    pub framerate: f32,

    /// Configured bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Frames handed to the pipeline.
    pub frames_submitted: u64,

    /// Frames fully written to the socket buffer.
    pub frames_flushed: u64,

    /// Frames dropped anywhere in the pipeline.
    pub dropped_frames: u64,

    /// Percentage of submitted frames that were dropped.
    pub dropped_percent: f64,

    /// Video frames submitted.
    pub video_frames: u64,

    /// Audio frames submitted.
    pub audio_frames: u64,

    /// AAC sample rate in Hz, once audio has started.
    pub audio_sample_rate_hz: Option<u32>,

    /// AAC channel count, once audio has started.
    pub audio_channels: Option<u8>,

    /// Bytes written to the socket.
    pub bytes_sent: u64,

    /// Average outgoing bitrate since the session started, in kbps.
    pub measured_bitrate_kbps: u32,

    /// Outbound buffer fullness relative to the high-water mark (0-100).
    pub buffer_fullness_percent: f32,

    /// Session uptime in seconds.
    pub uptime_seconds: u64,

    /// Current transport state.
    pub state: TransportState,

    /// Terminal error of the session, if it ended on one.
    pub last_error: Option<StreamingError>,
}

impl StreamStatus {
    /// "Server: ..." line.
    pub fn server_line(&self) -> String {
        match &self.server {
            Some(server) => format!("Server: {server}"),
            None => "Server not set".to_string(),
        }
    }

    /// "Video: H264, WxH, Nfps @ Nkbps" line.
    pub fn video_line(&self) -> String {
        let (width, height) = self
            .resolution
            .map(|r| (r.width, r.height))
            .unwrap_or_default();
        format!(
            "Video: H264, {}x{}, {}fps @ {}kbps",
            width, height, self.framerate, self.bitrate_kbps
        )
    }

    /// "Audio: AAC, N kHz, mono|stereo" line.
    pub fn audio_line(&self) -> String {
        match (self.audio_sample_rate_hz, self.audio_channels) {
            (Some(rate), Some(channels)) => format!(
                "Audio: AAC, {} kHz, {}",
                f64::from(rate) / 1000.0,
                if channels == 1 { "mono" } else { "stereo" }
            ),
            _ => "Audio: none".to_string(),
        }
    }

    /// "Dropped frames: N (P%)" line.
    pub fn dropped_line(&self) -> String {
        format!(
            "Dropped frames: {} ({:.1}%)",
            self.dropped_frames, self.dropped_percent
        )
    }

    /// Uptime as `h:mm:ss`.
    pub fn uptime_line(&self) -> String {
        let secs = self.uptime_seconds;
        format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    }
}

/// Types of performance warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WarningType {
    /// Outbound buffer is filling up.
    NetworkCongestion { buffer_percent: f32 },

    /// A large share of frames is being dropped.
    HighDropRate { percent: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines() {
        let status = StreamStatus {
            server: Some("host:1935/live/cam".to_string()),
            resolution: Some(Resolution::new(1280, 720)),
            framerate: 30.0,
            bitrate_kbps: 2500,
            dropped_frames: 3,
            dropped_percent: 1.5,
            uptime_seconds: 3_725,
            ..Default::default()
        };

        assert_eq!(status.server_line(), "Server: host:1935/live/cam");
        assert_eq!(status.video_line(), "Video: H264, 1280x720, 30fps @ 2500kbps");
        assert_eq!(status.dropped_line(), "Dropped frames: 3 (1.5%)");
        assert_eq!(status.uptime_line(), "1:02:05");
        assert_eq!(status.audio_line(), "Audio: none");
    }

    #[test]
    fn test_audio_line() {
        let mut status = StreamStatus {
            audio_sample_rate_hz: Some(44_100),
            audio_channels: Some(2),
            ..Default::default()
        };
        assert_eq!(status.audio_line(), "Audio: AAC, 44.1 kHz, stereo");

        status.audio_sample_rate_hz = Some(48_000);
        status.audio_channels = Some(1);
        assert_eq!(status.audio_line(), "Audio: AAC, 48 kHz, mono");
    }

    #[test]
    fn test_idle_status_has_no_server() {
        let status = StreamStatus::default();
        assert_eq!(status.server_line(), "Server not set");
        assert_eq!(status.state, TransportState::Idle);
    }

    #[test]
    fn test_status_serializes() {
        let status = StreamStatus::default();
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"Idle\""));
    }
}
