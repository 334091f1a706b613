//! RTMP publishing transport.
//!
//! This crate turns encoded H.264/AAC frames into RTMP chunk-stream messages
//! ([`Muxer`]) and writes them to a server over a single TCP connection
//! ([`RtmpTransport`]).

mod aac;
mod chunk;
mod config;
mod connection;
mod error;
mod flv;
mod frame;
mod h264;
mod mux;
mod rtmp;

pub use aac::{AdtsHeader, AudioSpecificConfig, SAMPLING_FREQUENCIES};
pub use chunk::{ChunkType, MessageType, MuxChunk};
pub use config::TransportConfig;
pub use connection::StateHandle;
pub use error::{MuxError, TransportError};
pub use frame::{EncodedFrame, MediaType};
pub use h264::{parse_annex_b, split_access_units, AccessUnit, NalUnit, NalUnitType, ParameterSets};
pub use mux::{
    DropReason, MuxCheckpoint, Muxed, Muxer, StreamMetadata, AUDIO_CHUNK_STREAM_ID,
    DATA_CHUNK_STREAM_ID, PUBLISH_STREAM_ID, VIDEO_CHUNK_STREAM_ID,
};
pub use rtmp::RtmpTransport;

/// Chunk size negotiated with the server.
pub const DEFAULT_CHUNK_SIZE: u32 = 4096;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for muxing operations.
pub type MuxResult<T> = Result<T, MuxError>;
