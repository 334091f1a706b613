//! H.264 bitstream handling.
//!
//! Encoders hand over Annex B access units (NAL units separated by
//! `00 00 01` / `00 00 00 01` start codes). RTMP carries AVCC instead: each
//! NAL unit prefixed with its 4-byte big-endian length, with SPS and PPS
//! moved out of band into an AVC decoder configuration record.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// NAL unit types the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice,
    /// IDR slice (keyframe).
    IdrSlice,
    /// Supplemental Enhancement Information.
    Sei,
    /// Sequence Parameter Set.
    Sps,
    /// Picture Parameter Set.
    Pps,
    /// Access Unit Delimiter.
    Aud,
    /// Anything else.
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::NonIdrSlice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            other => Self::Other(other),
        }
    }
}

/// A single NAL unit, header byte included, start code excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    /// The NAL unit type.
    pub nal_type: NalUnitType,
    /// The NAL unit bytes.
    pub data: Bytes,
}

impl NalUnit {
    fn new(data: Bytes) -> Self {
        Self {
            nal_type: NalUnitType::from(data[0]),
            data,
        }
    }

    /// Returns true for coded slice data.
    pub fn is_vcl(&self) -> bool {
        matches!(self.nal_type, NalUnitType::NonIdrSlice | NalUnitType::IdrSlice)
    }

    /// Returns true for NAL units that travel in the sequence header
    /// rather than in frames.
    pub fn is_out_of_band(&self) -> bool {
        matches!(
            self.nal_type,
            NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Aud
        )
    }

    /// For slices, whether `first_mb_in_slice` is zero, i.e. the slice
    /// begins a new picture. ue(v) 0 is the single bit `1`.
    fn starts_picture(&self) -> bool {
        self.data.get(1).is_some_and(|b| b & 0x80 != 0)
    }
}

fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && data.get(i + 3) == Some(&1) {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Split an Annex B byte stream into NAL units without copying.
///
/// Bytes before the first start code are ignored, as are trailing zero
/// bytes between units.
pub fn parse_annex_b(data: &Bytes) -> Vec<NalUnit> {
    let mut nals = Vec::new();
    let mut next = find_start_code(data, 0);

    while let Some((pos, len)) = next {
        let start = pos + len;
        next = find_start_code(data, start);

        let mut end = next.map_or(data.len(), |(p, _)| p);
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }

        if end > start {
            nals.push(NalUnit::new(data.slice(start..end)));
        }
    }

    nals
}

/// Write NAL units in AVCC form (4-byte length prefixes) into `buf`.
pub fn write_avcc<'a>(buf: &mut BytesMut, nals: impl IntoIterator<Item = &'a NalUnit>) {
    for nal in nals {
        buf.put_u32(nal.data.len() as u32);
        buf.put_slice(&nal.data);
    }
}

/// The most recent SPS and PPS seen on the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    /// Sequence parameter set.
    pub sps: Option<Bytes>,
    /// Picture parameter set.
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Record any SPS/PPS among `nals`. Returns true if either changed.
    pub fn absorb(&mut self, nals: &[NalUnit]) -> bool {
        let mut changed = false;
        for nal in nals {
            let slot = match nal.nal_type {
                NalUnitType::Sps => &mut self.sps,
                NalUnitType::Pps => &mut self.pps,
                _ => continue,
            };
            if slot.as_ref() != Some(&nal.data) {
                debug!(nal_type = ?nal.nal_type, len = nal.data.len(), "Parameter set updated");
                *slot = Some(nal.data.clone());
                changed = true;
            }
        }
        changed
    }

    /// Returns true once both SPS and PPS are known.
    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Build the AVC decoder configuration record (ISO 14496-15).
    ///
    /// ```text
    /// version(1)=1 profile(1) compat(1) level(1)
    /// 0xFF  (6 reserved bits + lengthSizeMinusOne=3)
    /// 0xE1  (3 reserved bits + one SPS)
    /// spsLength(2) sps  numPps(1)=1  ppsLength(2) pps
    /// ```
    ///
    /// Returns `None` until both sets are known or if the SPS is truncated.
    pub fn decoder_config(&self) -> Option<Bytes> {
        let (sps, pps) = match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) if sps.len() >= 4 => (sps, pps),
            _ => return None,
        };

        let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
        buf.put_u8(0x01);
        buf.put_slice(&sps[1..4]);
        buf.put_u8(0xFF);
        buf.put_u8(0xE1);
        buf.put_u16(sps.len() as u16);
        buf.put_slice(sps);
        buf.put_u8(0x01);
        buf.put_u16(pps.len() as u16);
        buf.put_slice(pps);

        Some(buf.freeze())
    }
}

/// The NAL units making up one coded picture.
#[derive(Debug, Clone, Default)]
pub struct AccessUnit {
    /// NAL units in stream order.
    pub nals: Vec<NalUnit>,
}

impl AccessUnit {
    /// Returns true if the unit contains an IDR slice.
    pub fn is_key_frame(&self) -> bool {
        self.nals
            .iter()
            .any(|nal| nal.nal_type == NalUnitType::IdrSlice)
    }

    fn has_picture(&self) -> bool {
        self.nals.iter().any(NalUnit::is_vcl)
    }

    /// Re-serialize with 4-byte start codes.
    pub fn to_annex_b(&self) -> Bytes {
        let len = self.nals.iter().map(|nal| nal.data.len() + 4).sum();
        let mut buf = BytesMut::with_capacity(len);
        for nal in &self.nals {
            buf.put_u32(1);
            buf.put_slice(&nal.data);
        }
        buf.freeze()
    }
}

/// Group an elementary stream into access units.
///
/// A unit ends when a delimiter, parameter set or SEI, or the first slice
/// of another picture, follows a coded slice.
pub fn split_access_units(stream: &Bytes) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    let mut current = AccessUnit::default();

    for nal in parse_annex_b(stream) {
        let boundary = match nal.nal_type {
            NalUnitType::Aud | NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Sei => true,
            NalUnitType::NonIdrSlice | NalUnitType::IdrSlice => nal.starts_picture(),
            NalUnitType::Other(_) => false,
        };

        if boundary && current.has_picture() {
            units.push(std::mem::take(&mut current));
        }
        current.nals.push(nal);
    }

    if current.has_picture() {
        units.push(current);
    }

    units
}
