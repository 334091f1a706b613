//! Frame accounting and transport health.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use streamcam_ipc::WarningType;
use streamcam_transport::MediaType;

/// Buffer fullness above which congestion is reported.
const CONGESTION_THRESHOLD_PERCENT: f32 = 80.0;

/// Drop rate above which a warning is raised.
const HIGH_DROP_RATE_PERCENT: f64 = 10.0;

/// Submissions required before the drop rate is judged.
const HIGH_DROP_RATE_MIN_FRAMES: u64 = 30;

#[derive(Debug, Default)]
struct HealthCounters {
    frames_submitted: u64,
    frames_flushed: u64,
    frames_dropped: u64,
    video_frames: u64,
    audio_frames: u64,
}

/// Consistent view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub frames_submitted: u64,
    pub frames_flushed: u64,
    pub frames_dropped: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub percent_dropped: f64,
}

/// Counts frames through one session.
///
/// Counters sit behind a single lock so a snapshot never mixes values from
/// before and after an update.
pub struct HealthMonitor {
    counters: Mutex<HealthCounters>,
    buffer_fullness: RwLock<f32>,
}

impl HealthMonitor {
    /// Create a monitor with zeroed counters.
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HealthCounters::default()),
            buffer_fullness: RwLock::new(0.0),
        }
    }

    /// Record a frame entering the pipeline.
    pub fn record_submitted(&self, media: MediaType) {
        let mut counters = self.counters.lock();
        counters.frames_submitted += 1;
        match media {
            MediaType::Video => counters.video_frames += 1,
            MediaType::Audio => counters.audio_frames += 1,
        }
    }

    /// Record a frame fully queued on the socket.
    pub fn record_flushed(&self) {
        self.counters.lock().frames_flushed += 1;
    }

    /// Record a frame that will never reach the server.
    pub fn record_dropped(&self) {
        self.counters.lock().frames_dropped += 1;
    }

    /// Update outbound buffer fullness percentage.
    pub fn update_buffer_fullness(&self, fullness: f32) {
        *self.buffer_fullness.write() = fullness.clamp(0.0, 100.0);
    }

    /// Outbound buffer fullness percentage.
    pub fn buffer_fullness(&self) -> f32 {
        *self.buffer_fullness.read()
    }

    /// Consistent copy of all counters.
    pub fn snapshot(&self) -> HealthSnapshot {
        let counters = self.counters.lock();
        HealthSnapshot {
            frames_submitted: counters.frames_submitted,
            frames_flushed: counters.frames_flushed,
            frames_dropped: counters.frames_dropped,
            video_frames: counters.video_frames,
            audio_frames: counters.audio_frames,
            percent_dropped: dropped_percent(counters.frames_dropped, counters.frames_submitted),
        }
    }

    /// Check for warnings based on current counters.
    pub fn check_warnings(&self) -> Vec<WarningType> {
        let mut warnings = Vec::new();

        let buffer_fullness = self.buffer_fullness();
        if buffer_fullness > CONGESTION_THRESHOLD_PERCENT {
            warnings.push(WarningType::NetworkCongestion {
                buffer_percent: buffer_fullness,
            });
        }

        let snapshot = self.snapshot();
        if snapshot.frames_submitted >= HIGH_DROP_RATE_MIN_FRAMES
            && snapshot.percent_dropped > HIGH_DROP_RATE_PERCENT
        {
            warnings.push(WarningType::HighDropRate {
                percent: snapshot.percent_dropped,
            });
        }

        warnings
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// `dropped / submitted * 100`, or 0 when nothing was submitted.
pub fn dropped_percent(dropped: u64, submitted: u64) -> f64 {
    if submitted == 0 {
        0.0
    } else {
        dropped as f64 / submitted as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_empty_monitor_reports_zero() {
        let monitor = HealthMonitor::new();
        let snapshot = monitor.snapshot();

        assert_eq!(snapshot.frames_submitted, 0);
        assert_eq!(snapshot.percent_dropped, 0.0);
        assert!(monitor.check_warnings().is_empty());
    }

    #[test]
    fn test_counts_per_media() {
        let monitor = HealthMonitor::new();
        monitor.record_submitted(MediaType::Video);
        monitor.record_submitted(MediaType::Video);
        monitor.record_submitted(MediaType::Audio);
        monitor.record_flushed();
        monitor.record_dropped();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.frames_submitted, 3);
        assert_eq!(snapshot.video_frames, 2);
        assert_eq!(snapshot.audio_frames, 1);
        assert_eq!(snapshot.frames_flushed, 1);
        assert_eq!(snapshot.frames_dropped, 1);
    }

    #[test]
    fn test_congestion_warning() {
        let monitor = HealthMonitor::new();
        monitor.update_buffer_fullness(80.0);
        assert!(monitor.check_warnings().is_empty());

        monitor.update_buffer_fullness(250.0);
        assert_eq!(
            monitor.check_warnings(),
            vec![WarningType::NetworkCongestion {
                buffer_percent: 100.0
            }]
        );
    }

    #[test]
    fn test_drop_rate_warning_needs_enough_frames() {
        let monitor = HealthMonitor::new();
        for _ in 0..10 {
            monitor.record_submitted(MediaType::Video);
            monitor.record_dropped();
        }
        assert!(monitor.check_warnings().is_empty());

        for _ in 0..20 {
            monitor.record_submitted(MediaType::Video);
            monitor.record_flushed();
        }
        let warnings = monitor.check_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            warnings[0],
            WarningType::HighDropRate { percent } if (percent - 100.0 / 3.0).abs() < 1e-9
        ));
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let monitor = Arc::new(HealthMonitor::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                thread::spawn(move || {
                    for i in 0..1000 {
                        monitor.record_submitted(MediaType::Video);
                        if i % 4 == 0 {
                            monitor.record_dropped();
                        } else {
                            monitor.record_flushed();
                        }
                    }
                })
            })
            .collect();

        let reader = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                for _ in 0..1000 {
                    let s = monitor.snapshot();
                    assert!(s.frames_dropped + s.frames_flushed <= s.frames_submitted);
                    assert!((0.0..=100.0).contains(&s.percent_dropped));
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.frames_submitted, 4000);
        assert_eq!(snapshot.frames_dropped, 1000);
        assert_eq!(snapshot.frames_flushed, 3000);
        assert_eq!(snapshot.percent_dropped, 25.0);
    }

    proptest! {
        #[test]
        fn test_dropped_percent_matches_ratio(submitted in 1u64..1_000_000, ratio in 0.0f64..=1.0) {
            let dropped = (submitted as f64 * ratio) as u64;
            let percent = dropped_percent(dropped, submitted);

            prop_assert!((0.0..=100.0).contains(&percent));
            prop_assert!((percent - 100.0 * dropped as f64 / submitted as f64).abs() < 1e-9);
        }

        #[test]
        fn test_snapshot_percent_tracks_counters(drops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let monitor = HealthMonitor::new();
            for &dropped in &drops {
                monitor.record_submitted(MediaType::Video);
                if dropped {
                    monitor.record_dropped();
                }
            }

            let snapshot = monitor.snapshot();
            let expected = drops.iter().filter(|d| **d).count() as u64;
            prop_assert_eq!(snapshot.frames_dropped, expected);
            prop_assert_eq!(snapshot.percent_dropped, dropped_percent(expected, drops.len() as u64));
        }
    }
}
