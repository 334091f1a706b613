//! FLV tag bodies carried inside RTMP audio and video messages.

use bytes::{BufMut, BytesMut};

use crate::aac::AudioSpecificConfig;

const CODEC_AVC: u8 = 0x07;
const FRAME_KEY: u8 = 0x10;
const FRAME_INTER: u8 = 0x20;

const SOUND_FORMAT_AAC: u8 = 0xA0;
const SOUND_RATE_44K: u8 = 0x0C;
const SOUND_SIZE_16BIT: u8 = 0x02;

/// Second byte of an AVC or AAC tag body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketType {
    /// Decoder configuration.
    SequenceHeader = 0,
    /// Coded data.
    Data = 1,
}

/// Write the 5-byte AVC video tag header.
///
/// `composition_time` is PTS - DTS; always 0 for streams without B-frames.
pub(crate) fn put_video_header(
    buf: &mut BytesMut,
    is_key_frame: bool,
    packet_type: PacketType,
    composition_time: i32,
) {
    let frame = if is_key_frame { FRAME_KEY } else { FRAME_INTER };
    buf.put_u8(frame | CODEC_AVC);
    buf.put_u8(packet_type as u8);
    buf.put_slice(&composition_time.to_be_bytes()[1..]);
}

/// Write the 2-byte AAC audio tag header.
///
/// FLV always signals 44 kHz for AAC; the real rate lives in the
/// AudioSpecificConfig.
pub(crate) fn put_audio_header(
    buf: &mut BytesMut,
    config: &AudioSpecificConfig,
    packet_type: PacketType,
) {
    let channels = u8::from(config.is_stereo());
    buf.put_u8(SOUND_FORMAT_AAC | SOUND_RATE_44K | SOUND_SIZE_16BIT | channels);
    buf.put_u8(packet_type as u8);
}
