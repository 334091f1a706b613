//! Frame to RTMP message muxing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rml_amf0::Amf0Value;
use tracing::{debug, info, trace};

use crate::aac::{AdtsHeader, AudioSpecificConfig};
use crate::chunk::{ChunkType, MessageType, MuxChunk};
use crate::error::MuxError;
use crate::flv::{put_audio_header, put_video_header, PacketType};
use crate::frame::{EncodedFrame, MediaType};
use crate::h264::{parse_annex_b, write_avcc, NalUnit, ParameterSets};
use crate::MuxResult;

/// Chunk stream carrying audio messages.
pub const AUDIO_CHUNK_STREAM_ID: u32 = 8;

/// Chunk stream carrying video messages.
pub const VIDEO_CHUNK_STREAM_ID: u32 = 9;

/// Chunk stream carrying data messages (onMetaData).
pub const DATA_CHUNK_STREAM_ID: u32 = 10;

/// Message stream id assigned by the server's createStream reply.
pub const PUBLISH_STREAM_ID: u32 = 1;

const MAX_MESSAGE_LENGTH: usize = 0xFF_FFFF;

/// Session-level stream description sent as onMetaData.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadata {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Frames per second.
    pub framerate: f32,

    /// Video bitrate in kbps.
    pub bitrate_kbps: u32,
}

impl StreamMetadata {
    fn encode(&self) -> MuxResult<Bytes> {
        let mut properties = HashMap::new();
        properties.insert("width".to_string(), Amf0Value::Number(f64::from(self.width)));
        properties.insert("height".to_string(), Amf0Value::Number(f64::from(self.height)));
        properties.insert(
            "framerate".to_string(),
            Amf0Value::Number(f64::from(self.framerate)),
        );
        properties.insert(
            "videodatarate".to_string(),
            Amf0Value::Number(f64::from(self.bitrate_kbps)),
        );
        properties.insert("videocodecid".to_string(), Amf0Value::Number(7.0));
        properties.insert(
            "encoder".to_string(),
            Amf0Value::Utf8String("StreamCam".to_string()),
        );

        let values = vec![
            Amf0Value::Utf8String("@setDataFrame".to_string()),
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::Object(properties),
        ];

        rml_amf0::serialize(&values)
            .map(Bytes::from)
            .map_err(|e| MuxError::Metadata(format!("{:?}", e)))
    }
}

/// Why a well-formed frame produced no output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Video has not started yet, or was resynchronized, and this is not a
    /// decodable key frame.
    AwaitingKeyFrame,

    /// Raw AAC arrived before any AudioSpecificConfig was known.
    AwaitingAudioConfig,
}

/// Outcome of [`Muxer::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Muxed {
    /// Chunks to write, in order. Empty when the frame only carried
    /// parameter sets.
    Chunks(Vec<MuxChunk>),

    /// The frame was discarded.
    Dropped(DropReason),
}

/// Per chunk stream header compression state.
#[derive(Debug, Clone, Copy, Default)]
struct ChunkStream {
    last_timestamp: Option<u32>,
}

#[derive(Debug, Clone, Default)]
struct VideoTrack {
    parameter_sets: ParameterSets,
    announced: Option<Bytes>,
    started: bool,
    base_timestamp: Option<u64>,
    last_timestamp: Option<u64>,
    chunks: ChunkStream,
}

#[derive(Debug, Clone, Default)]
struct AudioTrack {
    config: Option<AudioSpecificConfig>,
    announced: Option<AudioSpecificConfig>,
    base_timestamp: Option<u64>,
    last_timestamp: Option<u64>,
    chunks: ChunkStream,
}

#[derive(Debug, Clone, Default)]
struct MuxState {
    metadata_sent: bool,
    video: VideoTrack,
    audio: AudioTrack,
    data: ChunkStream,
}

/// Saved muxer state, see [`Muxer::checkpoint`].
#[derive(Debug, Clone)]
pub struct MuxCheckpoint {
    state: MuxState,
    bytes_muxed: u64,
}

/// Packages encoded frames into RTMP chunks.
///
/// Each media is rebased against its own first accepted frame, so both
/// timelines start at 0 whichever media the capture clock saw first. Each
/// media also keeps its own chunk stream so header compression (type 1
/// deltas) follows that media's timeline.
pub struct Muxer {
    chunk_size: usize,
    metadata: Option<StreamMetadata>,
    state: MuxState,
    bytes_muxed: Arc<AtomicU64>,
}

impl Muxer {
    /// Create a muxer that fragments messages at `chunk_size` bytes.
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size: chunk_size.max(128) as usize,
            metadata: None,
            state: MuxState::default(),
            bytes_muxed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the session metadata. Frames are refused until this is called;
    /// a changed value is re-announced before the next frame.
    pub fn set_metadata(&mut self, metadata: StreamMetadata) {
        if self.metadata.as_ref() != Some(&metadata) {
            info!(?metadata, "Stream metadata set");
            self.metadata = Some(metadata);
            self.state.metadata_sent = false;
        }
    }

    /// Provide the AAC configuration for raw (non-ADTS) audio frames.
    pub fn set_audio_config(&mut self, config: AudioSpecificConfig) {
        self.state.audio.config = Some(config);
    }

    /// Total FLV payload bytes muxed so far.
    pub fn bytes_muxed(&self) -> u64 {
        self.bytes_muxed.load(Ordering::Relaxed)
    }

    /// Shared handle on the muxed byte counter, for bitrate display.
    pub fn bytes_muxed_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_muxed)
    }

    /// AAC configuration last announced to the server, if audio has started.
    pub fn audio_config(&self) -> Option<AudioSpecificConfig> {
        self.state.audio.announced
    }

    /// Snapshot the state so a frame whose chunks never reach the wire can
    /// be undone.
    pub fn checkpoint(&self) -> MuxCheckpoint {
        MuxCheckpoint {
            state: self.state.clone(),
            bytes_muxed: self.bytes_muxed(),
        }
    }

    /// Restore a snapshot taken with [`checkpoint`](Self::checkpoint).
    pub fn rollback(&mut self, checkpoint: MuxCheckpoint) {
        self.state = checkpoint.state;
        self.bytes_muxed
            .store(checkpoint.bytes_muxed, Ordering::Relaxed);
    }

    /// Drop video until the next key frame, after a frame was lost.
    pub fn resync_video(&mut self) {
        if self.state.video.started {
            debug!("Video resync: waiting for next key frame");
            self.state.video.started = false;
        }
    }

    /// Mux one frame.
    ///
    /// On error the muxer is left exactly as it was before the call.
    pub fn submit(&mut self, frame: EncodedFrame) -> MuxResult<Muxed> {
        if self.metadata.is_none() {
            return Err(MuxError::StreamNotInitialized);
        }
        if frame.payload.is_empty() {
            return Err(MuxError::EmptyFrame(frame.media_type));
        }

        let previous = match frame.media_type {
            MediaType::Video => self.state.video.last_timestamp,
            MediaType::Audio => self.state.audio.last_timestamp,
        };
        if let Some(previous) = previous {
            if frame.timestamp_ms < previous {
                return Err(MuxError::TimestampRegression {
                    media: frame.media_type,
                    previous,
                    current: frame.timestamp_ms,
                });
            }
        }

        let saved = self.state.clone();
        let result = match frame.media_type {
            MediaType::Video => self.mux_video(&frame),
            MediaType::Audio => self.mux_audio(&frame),
        };

        match &result {
            Ok(Muxed::Chunks(chunks)) => {
                let bytes: usize = chunks.iter().map(|c| c.payload.len()).sum();
                self.bytes_muxed.fetch_add(bytes as u64, Ordering::Relaxed);
                trace!(
                    media = ?frame.media_type,
                    timestamp_ms = frame.timestamp_ms,
                    chunks = chunks.len(),
                    bytes,
                    "Frame muxed"
                );
            }
            Ok(Muxed::Dropped(reason)) => {
                trace!(media = ?frame.media_type, ?reason, "Frame dropped by muxer");
            }
            Err(_) => self.state = saved,
        }

        result
    }

    fn mux_video(&mut self, frame: &EncodedFrame) -> MuxResult<Muxed> {
        let nals = parse_annex_b(&frame.payload);
        if nals.is_empty() {
            return Err(MuxError::MalformedFrame {
                media: MediaType::Video,
                reason: "no Annex B start code".to_string(),
            });
        }

        let video = &mut self.state.video;
        video.last_timestamp = Some(frame.timestamp_ms);
        video.parameter_sets.absorb(&nals);

        let slices: Vec<&NalUnit> = nals.iter().filter(|n| !n.is_out_of_band()).collect();
        if slices.is_empty() {
            return Ok(Muxed::Chunks(Vec::new()));
        }

        let decoder_config = video.parameter_sets.decoder_config();
        if !video.started {
            if !frame.is_key_frame || decoder_config.is_none() {
                return Ok(Muxed::Dropped(DropReason::AwaitingKeyFrame));
            }
            info!(timestamp_ms = frame.timestamp_ms, "Video starts at key frame");
            video.started = true;
        }

        let timestamp = self.rebase(MediaType::Video, frame.timestamp_ms);
        let mut chunks = Vec::new();
        self.push_metadata(&mut chunks)?;

        if let Some(config) = decoder_config {
            if self.state.video.announced.as_ref() != Some(&config) {
                let mut body = BytesMut::with_capacity(5 + config.len());
                put_video_header(&mut body, true, PacketType::SequenceHeader, 0);
                body.extend_from_slice(&config);
                self.push_message(&mut chunks, MessageType::Video, timestamp, body.freeze())?;

                debug!(len = config.len(), "AVC sequence header queued");
                self.state.video.announced = Some(config);
            }
        }

        let len = slices.iter().map(|n| n.data.len() + 4).sum::<usize>() + 5;
        let mut body = BytesMut::with_capacity(len);
        put_video_header(&mut body, frame.is_key_frame, PacketType::Data, 0);
        write_avcc(&mut body, slices);
        self.push_message(&mut chunks, MessageType::Video, timestamp, body.freeze())?;

        Ok(Muxed::Chunks(chunks))
    }

    fn mux_audio(&mut self, frame: &EncodedFrame) -> MuxResult<Muxed> {
        let (config, raw) = if AdtsHeader::is_adts(&frame.payload) {
            let header =
                AdtsHeader::parse(&frame.payload).ok_or_else(|| MuxError::MalformedFrame {
                    media: MediaType::Audio,
                    reason: "invalid ADTS header".to_string(),
                })?;
            if header.frame_length < frame.payload.len() {
                return Err(MuxError::MalformedFrame {
                    media: MediaType::Audio,
                    reason: format!(
                        "{} trailing bytes after ADTS frame",
                        frame.payload.len() - header.frame_length
                    ),
                });
            }
            self.state.audio.config = Some(header.config);
            (
                header.config,
                frame
                    .payload
                    .slice(header.header_length..header.frame_length),
            )
        } else {
            match self.state.audio.config {
                Some(config) => (config, frame.payload.clone()),
                None => {
                    self.state.audio.last_timestamp = Some(frame.timestamp_ms);
                    return Ok(Muxed::Dropped(DropReason::AwaitingAudioConfig));
                }
            }
        };

        self.state.audio.last_timestamp = Some(frame.timestamp_ms);
        let timestamp = self.rebase(MediaType::Audio, frame.timestamp_ms);
        let mut chunks = Vec::new();
        self.push_metadata(&mut chunks)?;

        if self.state.audio.announced != Some(config) {
            let mut body = BytesMut::with_capacity(4);
            put_audio_header(&mut body, &config, PacketType::SequenceHeader);
            body.extend_from_slice(&config.to_bytes());
            self.push_message(&mut chunks, MessageType::Audio, timestamp, body.freeze())?;

            debug!(
                sample_rate = ?config.sample_rate(),
                channels = config.channel_config,
                "AAC sequence header queued"
            );
            self.state.audio.announced = Some(config);
        }

        let mut body = BytesMut::with_capacity(2 + raw.len());
        put_audio_header(&mut body, &config, PacketType::Data);
        body.extend_from_slice(&raw);
        self.push_message(&mut chunks, MessageType::Audio, timestamp, body.freeze())?;

        Ok(Muxed::Chunks(chunks))
    }

    fn push_metadata(&mut self, out: &mut Vec<MuxChunk>) -> MuxResult<()> {
        if self.state.metadata_sent {
            return Ok(());
        }

        let body = match &self.metadata {
            Some(metadata) => metadata.encode()?,
            None => return Err(MuxError::StreamNotInitialized),
        };
        self.push_message(out, MessageType::Data, 0, body)?;
        self.state.metadata_sent = true;
        Ok(())
    }

    /// Rebase onto the media's own clock. RTMP timestamps are 32-bit and wrap.
    fn rebase(&mut self, media: MediaType, timestamp_ms: u64) -> u32 {
        let base = match media {
            MediaType::Video => &mut self.state.video.base_timestamp,
            MediaType::Audio => &mut self.state.audio.base_timestamp,
        };
        let base = *base.get_or_insert(timestamp_ms);
        timestamp_ms.saturating_sub(base) as u32
    }

    fn push_message(
        &mut self,
        out: &mut Vec<MuxChunk>,
        message_type: MessageType,
        timestamp: u32,
        payload: Bytes,
    ) -> MuxResult<()> {
        if payload.len() > MAX_MESSAGE_LENGTH {
            return Err(MuxError::FrameTooLarge(payload.len()));
        }

        let (chunk_stream_id, stream) = match message_type {
            MessageType::Audio => (AUDIO_CHUNK_STREAM_ID, &mut self.state.audio.chunks),
            MessageType::Video => (VIDEO_CHUNK_STREAM_ID, &mut self.state.video.chunks),
            MessageType::Data => (DATA_CHUNK_STREAM_ID, &mut self.state.data),
        };

        let (first_type, header_timestamp) = match stream.last_timestamp {
            Some(previous) if timestamp >= previous => (ChunkType::Delta, timestamp - previous),
            _ => (ChunkType::Full, timestamp),
        };
        stream.last_timestamp = Some(timestamp);

        let message_length = payload.len() as u32;
        for offset in (0..payload.len()).step_by(self.chunk_size) {
            let end = (offset + self.chunk_size).min(payload.len());
            out.push(MuxChunk {
                chunk_type: if offset == 0 {
                    first_type
                } else {
                    ChunkType::Continuation
                },
                chunk_stream_id,
                message_stream_id: PUBLISH_STREAM_ID,
                message_type,
                message_length,
                timestamp: header_timestamp,
                payload: payload.slice(offset..end),
            });
        }

        Ok(())
    }
}
