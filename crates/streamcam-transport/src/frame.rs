//! Encoded media frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of media carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    /// H.264 video, one Annex B access unit per frame.
    Video,

    /// AAC audio, ADTS framed or raw.
    Audio,
}

/// One encoded access unit as produced by the encoder.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Capture timestamp in milliseconds.
    pub timestamp_ms: u64,

    /// Encoded payload.
    pub payload: Bytes,

    /// Whether the frame is a random access point.
    pub is_key_frame: bool,

    /// Media type.
    pub media_type: MediaType,
}

impl EncodedFrame {
    /// Create a video frame.
    pub fn video(timestamp_ms: u64, payload: impl Into<Bytes>, is_key_frame: bool) -> Self {
        Self {
            timestamp_ms,
            payload: payload.into(),
            is_key_frame,
            media_type: MediaType::Video,
        }
    }

    /// Create an audio frame.
    pub fn audio(timestamp_ms: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp_ms,
            payload: payload.into(),
            is_key_frame: true,
            media_type: MediaType::Audio,
        }
    }
}
