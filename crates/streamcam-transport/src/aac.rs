//! AAC framing.
//!
//! Hardware encoders typically emit ADTS-framed AAC. RTMP wants raw AAC
//! frames plus a one-time AudioSpecificConfig, so the ADTS header is parsed
//! and stripped here.

/// Sampling frequencies indexed by `sampling_frequency_index`.
pub const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Audio object type, sample rate and channel layout of an AAC stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    /// Audio object type (2 = AAC-LC).
    pub object_type: u8,

    /// Index into [`SAMPLING_FREQUENCIES`].
    pub sampling_index: u8,

    /// Channel configuration (1 = mono, 2 = stereo).
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    /// Parse the 2-byte form.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let &[b0, b1, ..] = data else {
            return None;
        };

        let config = Self {
            object_type: b0 >> 3,
            sampling_index: ((b0 & 0x07) << 1) | (b1 >> 7),
            channel_config: (b1 >> 3) & 0x0F,
        };
        config.sample_rate().map(|_| config)
    }

    /// Serialize to the 2-byte form carried in the sequence header.
    pub fn to_bytes(self) -> [u8; 2] {
        [
            (self.object_type << 3) | (self.sampling_index >> 1),
            ((self.sampling_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }

    /// Sample rate in Hz.
    pub fn sample_rate(self) -> Option<u32> {
        SAMPLING_FREQUENCIES.get(self.sampling_index as usize).copied()
    }

    /// Returns true for more than one channel.
    pub fn is_stereo(self) -> bool {
        self.channel_config != 1
    }
}

/// A parsed ADTS frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// Stream configuration carried by the header.
    pub config: AudioSpecificConfig,

    /// Header size: 7 bytes, or 9 with CRC.
    pub header_length: usize,

    /// Header plus payload size.
    pub frame_length: usize,
}

impl AdtsHeader {
    /// Returns true if `data` begins with an ADTS sync word.
    pub fn is_adts(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF6 == 0xF0
    }

    /// Parse the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || !Self::is_adts(data) {
            return None;
        }

        let protection_absent = data[1] & 0x01 == 1;
        let config = AudioSpecificConfig {
            object_type: (data[2] >> 6) + 1,
            sampling_index: (data[2] >> 2) & 0x0F,
            channel_config: ((data[2] & 0x01) << 2) | (data[3] >> 6),
        };
        config.sample_rate()?;

        let frame_length = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] as usize) >> 5);
        let header_length = if protection_absent { 7 } else { 9 };

        if frame_length <= header_length || frame_length > data.len() {
            return None;
        }

        Some(Self {
            config,
            header_length,
            frame_length,
        })
    }

    /// The raw AAC payload within `data`.
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.header_length..self.frame_length]
    }
}
