//! Producer side of the frame channel.

use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use tracing::trace;

use streamcam_transport::EncodedFrame;

use crate::manager::ConnectionManager;

/// What became of an offered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Queued for the streaming thread.
    Queued,
    /// The queue was full. Counted as dropped if a session is live.
    Dropped,
    /// The engine is gone.
    Disconnected,
}

/// Handle capture code uses to hand frames to the engine.
///
/// Offering never blocks. A frame that finds the queue full is charged to
/// the live session's dropped count, same as a frame lost to backpressure.
#[derive(Clone)]
pub struct FrameSink {
    tx: Sender<EncodedFrame>,
    manager: Arc<ConnectionManager>,
}

impl FrameSink {
    pub fn new(tx: Sender<EncodedFrame>, manager: Arc<ConnectionManager>) -> Self {
        Self { tx, manager }
    }

    /// Queue `frame` without waiting.
    pub fn offer(&self, frame: EncodedFrame) -> Offer {
        let media = frame.media_type;
        match self.tx.try_send(frame) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                let counted = self.manager.record_queue_drop(media);
                trace!(?media, counted, "Frame queue full, frame dropped");
                Offer::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Offer::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use streamcam_ipc::CameraModes;
    use streamcam_transport::TransportConfig;

    use super::*;

    #[test]
    fn test_offer_without_session() {
        let manager = Arc::new(ConnectionManager::new(
            TransportConfig::default(),
            CameraModes::default(),
        ));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sink = FrameSink::new(tx, Arc::clone(&manager));

        assert_eq!(sink.offer(EncodedFrame::video(0, vec![0, 0, 0, 1, 0x65], true)), Offer::Queued);
        assert_eq!(sink.offer(EncodedFrame::video(33, vec![0, 0, 0, 1, 0x41], false)), Offer::Dropped);
        assert_eq!(manager.status().dropped_frames, 0);

        drop(rx);
        assert_eq!(
            sink.offer(EncodedFrame::video(66, vec![0, 0, 0, 1, 0x41], false)),
            Offer::Disconnected
        );
    }
}
