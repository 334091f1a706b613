//! Per-session stream settings and their accepted ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::RtmpEndpoint;
use crate::error::ValidationError;

/// Lowest accepted video bitrate in kbps.
pub const MIN_BITRATE_KBPS: u32 = 128;

/// Highest accepted video bitrate in kbps.
pub const MAX_BITRATE_KBPS: u32 = 36_000;

/// Lowest accepted framerate.
pub const MIN_FRAMERATE: f32 = 15.0;

/// Highest accepted framerate.
pub const MAX_FRAMERATE: f32 = 30.0;

/// A video resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The video modes a camera can capture in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraModes {
    /// Camera name for messages.
    pub camera: String,

    /// Supported capture resolutions.
    pub resolutions: Vec<Resolution>,
}

impl CameraModes {
    /// Returns true if the camera can capture at `resolution`.
    pub fn supports(&self, resolution: Resolution) -> bool {
        self.resolutions.contains(&resolution)
    }
}

impl Default for CameraModes {
    fn default() -> Self {
        Self {
            camera: "rear".to_string(),
            resolutions: vec![
                Resolution::new(1920, 1080),
                Resolution::new(1280, 720),
                Resolution::new(720, 720),
                Resolution::new(640, 480),
            ],
        }
    }
}

/// Settings for one streaming session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Server URI (`rtmp://host[:port]/app/streamKey`).
    pub server_uri: String,

    /// Capture resolution.
    pub resolution: Resolution,

    /// Target video bitrate in kbps.
    pub bitrate_kbps: u32,

    /// Target framerate.
    pub framerate: f32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            server_uri: String::new(),
            resolution: Resolution::new(1280, 720),
            bitrate_kbps: 2500,
            framerate: 30.0,
        }
    }
}

impl StreamSettings {
    /// Validate the settings against the accepted ranges and the camera.
    ///
    /// Returns the parsed server endpoint on success.
    pub fn validate(&self, modes: &CameraModes) -> Result<RtmpEndpoint, ValidationError> {
        if self.server_uri.trim().is_empty() {
            return Err(ValidationError::ServerNotSet);
        }

        let endpoint = RtmpEndpoint::parse(&self.server_uri)?;

        if !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&self.bitrate_kbps) {
            return Err(ValidationError::BitrateOutOfRange {
                value: self.bitrate_kbps,
                min: MIN_BITRATE_KBPS,
                max: MAX_BITRATE_KBPS,
            });
        }

        if !(MIN_FRAMERATE..=MAX_FRAMERATE).contains(&self.framerate) {
            return Err(ValidationError::FramerateOutOfRange {
                value: self.framerate,
                min: MIN_FRAMERATE,
                max: MAX_FRAMERATE,
            });
        }

        if !modes.supports(self.resolution) {
            return Err(ValidationError::UnsupportedResolution {
                width: self.resolution.width,
                height: self.resolution.height,
            });
        }

        Ok(endpoint)
    }
}

/// The ranges a settings form should offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedRanges {
    /// Lowest accepted bitrate in kbps.
    pub min_bitrate_kbps: u32,

    /// Highest accepted bitrate in kbps.
    pub max_bitrate_kbps: u32,

    /// Lowest accepted framerate.
    pub min_framerate: f32,

    /// Highest accepted framerate.
    pub max_framerate: f32,

    /// Resolutions the camera supports.
    pub resolutions: Vec<Resolution>,
}

impl AcceptedRanges {
    /// Ranges for the given camera.
    pub fn for_camera(modes: &CameraModes) -> Self {
        Self {
            min_bitrate_kbps: MIN_BITRATE_KBPS,
            max_bitrate_kbps: MAX_BITRATE_KBPS,
            min_framerate: MIN_FRAMERATE,
            max_framerate: MAX_FRAMERATE,
            resolutions: modes.resolutions.clone(),
        }
    }

    /// Hint text shown under the bitrate field.
    pub fn bitrate_hint(&self) -> String {
        format!(
            "In kbps. Minimum: {}, maximum: {}",
            self.min_bitrate_kbps, self.max_bitrate_kbps
        )
    }

    /// Hint text shown under the framerate field.
    pub fn framerate_hint(&self) -> String {
        format!(
            "Minimum: {:.1}, maximum: {:.1}",
            self.min_framerate, self.max_framerate
        )
    }

    /// Message for a resolution the camera lacks.
    pub fn unsupported_hint(camera: &str) -> String {
        format!("Not supported by {camera} camera")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(bitrate_kbps: u32, framerate: f32) -> StreamSettings {
        StreamSettings {
            server_uri: "rtmp://localhost/live/cam".to_string(),
            bitrate_kbps,
            framerate,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_accepts_range_boundaries() {
        let modes = CameraModes::default();

        for (bitrate, framerate) in [
            (MIN_BITRATE_KBPS, MIN_FRAMERATE),
            (MAX_BITRATE_KBPS, MAX_FRAMERATE),
            (2500, 24.0),
        ] {
            let endpoint = settings(bitrate, framerate).validate(&modes).unwrap();
            assert_eq!(endpoint.app, "live");
        }
    }

    #[test]
    fn test_validate_rejects_bitrate() {
        let modes = CameraModes::default();

        assert!(matches!(
            settings(127, 30.0).validate(&modes),
            Err(ValidationError::BitrateOutOfRange { value: 127, .. })
        ));
        assert!(matches!(
            settings(36_001, 30.0).validate(&modes),
            Err(ValidationError::BitrateOutOfRange { value: 36_001, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_framerate() {
        let modes = CameraModes::default();

        for framerate in [14.9, 30.5, f32::NAN] {
            assert!(matches!(
                settings(2500, framerate).validate(&modes),
                Err(ValidationError::FramerateOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_validate_rejects_unknown_resolution() {
        let mut s = settings(2500, 30.0);
        s.resolution = Resolution::new(3840, 2160);

        assert_eq!(
            s.validate(&CameraModes::default()),
            Err(ValidationError::UnsupportedResolution {
                width: 3840,
                height: 2160
            })
        );
    }

    #[test]
    fn test_validate_requires_server() {
        let mut s = settings(2500, 30.0);
        s.server_uri = "  ".to_string();

        assert_eq!(
            s.validate(&CameraModes::default()),
            Err(ValidationError::ServerNotSet)
        );
        assert_eq!(ValidationError::ServerNotSet.to_string(), "Server not set");
    }

    #[test]
    fn test_accepted_ranges_hints() {
        let ranges = AcceptedRanges::for_camera(&CameraModes::default());

        assert_eq!(ranges.bitrate_hint(), "In kbps. Minimum: 128, maximum: 36000");
        assert_eq!(ranges.framerate_hint(), "Minimum: 15.0, maximum: 30.0");
        assert_eq!(ranges.resolutions.len(), 4);
        assert_eq!(
            AcceptedRanges::unsupported_hint("front"),
            "Not supported by front camera"
        );
    }
}
