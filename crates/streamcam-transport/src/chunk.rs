//! RTMP chunk stream framing.
//!
//! Every message is sent as one or more chunks. The first chunk of a
//! message carries a message header (type 0 or 1); the rest are type 3
//! continuations that only repeat the basic header.

use bytes::{BufMut, Bytes, BytesMut};

/// Largest value that fits the 3-byte timestamp field.
const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

/// Chunk header format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// Type 0: absolute timestamp, length, type id and stream id.
    Full,
    /// Type 1: timestamp delta, length and type id; same stream id.
    Delta,
    /// Type 3: next fragment of the current message.
    Continuation,
}

impl ChunkType {
    /// The 2-bit `fmt` field.
    pub fn fmt(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Delta => 1,
            Self::Continuation => 3,
        }
    }

    fn header_len(self) -> usize {
        match self {
            Self::Full => 11,
            Self::Delta => 7,
            Self::Continuation => 0,
        }
    }
}

/// RTMP message type ids used for media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Audio data (8).
    Audio,
    /// Video data (9).
    Video,
    /// AMF0 data message (18).
    Data,
}

impl MessageType {
    /// Wire type id.
    pub fn id(self) -> u8 {
        match self {
            Self::Audio => 8,
            Self::Video => 9,
            Self::Data => 18,
        }
    }
}

/// One chunk ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxChunk {
    /// Header format.
    pub chunk_type: ChunkType,

    /// Chunk stream id (2..=65599).
    pub chunk_stream_id: u32,

    /// Message stream id; only written by `Full` chunks.
    pub message_stream_id: u32,

    /// Message type of the message this chunk belongs to.
    pub message_type: MessageType,

    /// Total length of the message this chunk belongs to.
    pub message_length: u32,

    /// Absolute timestamp for `Full`, delta for `Delta`; continuations
    /// repeat the value of their message's first chunk.
    pub timestamp: u32,

    /// This chunk's slice of the message payload.
    pub payload: Bytes,
}

impl MuxChunk {
    /// Returns true for type 3 fragments.
    pub fn is_continuation(&self) -> bool {
        self.chunk_type == ChunkType::Continuation
    }

    /// Timestamp delta relative to the previous message on the chunk
    /// stream. A `Full` chunk restarts the stream, so its delta is its
    /// absolute timestamp.
    pub fn timestamp_delta(&self) -> u32 {
        self.timestamp
    }

    fn basic_header_len(&self) -> usize {
        match self.chunk_stream_id {
            0..=63 => 1,
            64..=319 => 2,
            _ => 3,
        }
    }

    fn has_extended_timestamp(&self) -> bool {
        self.timestamp >= EXTENDED_TIMESTAMP
    }

    /// Bytes this chunk occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let extended = if self.has_extended_timestamp() { 4 } else { 0 };
        self.basic_header_len() + self.chunk_type.header_len() + extended + self.payload.len()
    }

    /// Append the wire form to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());

        let fmt = self.chunk_type.fmt() << 6;
        match self.chunk_stream_id {
            id @ 0..=63 => buf.put_u8(fmt | id as u8),
            id @ 64..=319 => {
                buf.put_u8(fmt);
                buf.put_u8((id - 64) as u8);
            }
            id => {
                buf.put_u8(fmt | 1);
                buf.put_u16_le((id - 64) as u16);
            }
        }

        let timestamp = self.timestamp.min(EXTENDED_TIMESTAMP);
        match self.chunk_type {
            ChunkType::Full => {
                buf.put_uint(u64::from(timestamp), 3);
                buf.put_uint(u64::from(self.message_length), 3);
                buf.put_u8(self.message_type.id());
                buf.put_u32_le(self.message_stream_id);
            }
            ChunkType::Delta => {
                buf.put_uint(u64::from(timestamp), 3);
                buf.put_uint(u64::from(self.message_length), 3);
                buf.put_u8(self.message_type.id());
            }
            ChunkType::Continuation => {}
        }

        if self.has_extended_timestamp() {
            buf.put_u32(self.timestamp);
        }

        buf.put_slice(&self.payload);
    }
}
