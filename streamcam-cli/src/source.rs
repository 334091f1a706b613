//! Frames read from a raw H.264 file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use streamcam_transport::{split_access_units, AccessUnit, EncodedFrame};

/// Access units of an Annex B file, replayed with synthetic timestamps.
pub struct FileSource {
    units: Vec<AccessUnit>,
    framerate: f32,
    looping: bool,
    next: usize,
    emitted: u64,
}

impl FileSource {
    /// Load and split `path`.
    pub fn open(path: &Path, framerate: f32, looping: bool) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_bytes(Bytes::from(data), framerate, looping)
    }

    pub fn from_bytes(data: Bytes, framerate: f32, looping: bool) -> Result<Self> {
        let units = split_access_units(&data);
        if units.is_empty() {
            bail!("No H.264 access units found");
        }
        if !units.iter().any(AccessUnit::is_key_frame) {
            bail!("Stream contains no key frame");
        }

        Ok(Self {
            units,
            framerate,
            looping,
            next: 0,
            emitted: 0,
        })
    }

    /// Number of access units in one pass over the file.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Timestamp of the `index`th emitted frame.
    fn timestamp_ms(&self, index: u64) -> u64 {
        (index as f64 * 1000.0 / f64::from(self.framerate)) as u64
    }
}

impl Iterator for FileSource {
    type Item = EncodedFrame;

    fn next(&mut self) -> Option<EncodedFrame> {
        if self.next == self.units.len() {
            if !self.looping {
                return None;
            }
            self.next = 0;
        }

        let unit = &self.units[self.next];
        let frame = EncodedFrame::video(
            self.timestamp_ms(self.emitted),
            unit.to_annex_b(),
            unit.is_key_frame(),
        );
        self.next += 1;
        self.emitted += 1;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F, 0xAC, //
        0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80, //
        0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21, //
        0, 0, 0, 1, 0x41, 0x9A, 0x02, 0x03,
    ];

    #[test]
    fn test_frames_are_paced_and_loop() {
        let source = FileSource::from_bytes(Bytes::from_static(STREAM), 30.0, true).unwrap();
        assert_eq!(source.len(), 2);

        let frames: Vec<_> = source.take(5).collect();
        let timestamps: Vec<_> = frames.iter().map(|f| f.timestamp_ms).collect();
        let keys: Vec<_> = frames.iter().map(|f| f.is_key_frame).collect();

        assert_eq!(timestamps, vec![0, 33, 66, 100, 133]);
        assert_eq!(keys, vec![true, false, true, false, true]);
    }

    #[test]
    fn test_single_pass_ends() {
        let source = FileSource::from_bytes(Bytes::from_static(STREAM), 15.0, false).unwrap();
        assert_eq!(source.count(), 2);
    }

    #[test]
    fn test_rejects_stream_without_key_frame() {
        let result = FileSource::from_bytes(
            Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9A, 0x02]),
            30.0,
            false,
        );
        assert!(result.is_err());
        assert!(FileSource::from_bytes(Bytes::from_static(b"garbage"), 30.0, false).is_err());
    }
}
