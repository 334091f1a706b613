//! Session lifecycle.
//!
//! A [`ConnectionManager`] owns at most one live [`Session`]. The session
//! bundles the muxer and transport behind an async mutex held by whichever
//! of `feed`, `start_session` or `stop_session` is driving the socket. The
//! cancellation token and the shared counters live outside that mutex so a
//! stop request and status reads never wait on socket I/O.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use streamcam_ipc::{
    AcceptedRanges, CameraModes, EngineEvent, RtmpEndpoint, StreamSettings, StreamStatus,
    StreamingError, TransportState,
};
use streamcam_transport::{
    AudioSpecificConfig, DropReason, EncodedFrame, MediaType, Muxed, Muxer, RtmpTransport, StateHandle,
    StreamMetadata, TransportConfig, TransportError,
};

use crate::error::{FeedError, StartError, StopError};
use crate::health::HealthMonitor;

/// Identifies a session started by [`ConnectionManager::start_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Numeric session id, unique per manager.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// What happened to a fed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Queued on the socket.
    Sent,
    /// Dropped by the muxer and counted.
    Dropped(DropReason),
    /// Dropped because the outbound buffer is full, and counted.
    Backpressure,
}

struct Pipeline {
    muxer: Muxer,
    transport: RtmpTransport<TcpStream>,
}

struct Session {
    id: u64,
    settings: StreamSettings,
    endpoint: RtmpEndpoint,
    state: StateHandle,
    cancel: CancellationToken,
    health: Arc<HealthMonitor>,
    bytes_sent: Arc<AtomicU64>,
    audio_format: Mutex<Option<AudioSpecificConfig>>,
    pipeline: tokio::sync::Mutex<Pipeline>,
    ended: AtomicBool,
    started_at: Instant,
}

impl Session {
    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// Owns the active stream and its transport.
pub struct ConnectionManager {
    transport_config: TransportConfig,
    camera_modes: CameraModes,
    events: Option<Sender<EngineEvent>>,
    /// The live session, or the last one until the next start.
    current: Mutex<Option<Arc<Session>>>,
    last_error: RwLock<Option<StreamingError>>,
    next_session_id: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager with no session.
    pub fn new(transport_config: TransportConfig, camera_modes: CameraModes) -> Self {
        Self {
            transport_config,
            camera_modes,
            events: None,
            current: Mutex::new(None),
            last_error: RwLock::new(None),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Publish state changes and terminal errors on `events`.
    pub fn with_events(mut self, events: Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Accepted settings ranges for the configured camera.
    pub fn accepted_ranges(&self) -> AcceptedRanges {
        AcceptedRanges::for_camera(&self.camera_modes)
    }

    /// Validate `settings`, connect and negotiate publishing.
    ///
    /// Invalid settings fail before any socket is opened. A connect failure
    /// ends the session and is reported once as a streaming error.
    #[instrument(name = "start_session", skip(self, settings), fields(server = %settings.server_uri))]
    pub async fn start_session(&self, settings: StreamSettings) -> Result<SessionHandle, StartError> {
        let endpoint = match settings.validate(&self.camera_modes) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Rejected stream settings");
                let streaming = StreamingError::from(&e);
                *self.last_error.write() = Some(streaming.clone());
                self.send_event(EngineEvent::StreamingError(streaming));
                return Err(StartError::Validation(e));
            }
        };

        let session = {
            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|s| !s.is_ended()) {
                return Err(StartError::AlreadyStreaming);
            }

            let session = Arc::new(self.new_session(settings, endpoint));
            *current = Some(Arc::clone(&session));
            *self.last_error.write() = None;
            session
        };
        info!(id = session.id, endpoint = %session.endpoint, "Starting session");

        let mut pipeline = session.pipeline.lock().await;
        if session.is_ended() {
            return Err(StartError::Cancelled);
        }

        match pipeline.transport.connect_to(&session.endpoint).await {
            Ok(()) => {
                info!(id = session.id, "Session publishing");
                Ok(SessionHandle(session.id))
            }
            Err(TransportError::Cancelled) => {
                debug!(id = session.id, "Connect cancelled");
                Err(StartError::Cancelled)
            }
            Err(e) => {
                self.finish(&session, &mut pipeline, Some(e.clone())).await;
                Err(StartError::Transport(e))
            }
        }
    }

    fn new_session(&self, settings: StreamSettings, endpoint: RtmpEndpoint) -> Session {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let state = match &self.events {
            Some(events) => StateHandle::new().with_events(events.clone()),
            None => StateHandle::new(),
        };

        let mut muxer = Muxer::new(self.transport_config.chunk_size);
        muxer.set_metadata(StreamMetadata {
            width: settings.resolution.width,
            height: settings.resolution.height,
            framerate: settings.framerate,
            bitrate_kbps: settings.bitrate_kbps,
        });
        let transport =
            RtmpTransport::new(self.transport_config.clone(), state.clone(), cancel.clone());

        Session {
            id,
            settings,
            endpoint,
            state,
            cancel,
            health: Arc::new(HealthMonitor::new()),
            bytes_sent: transport.bytes_sent_counter(),
            audio_format: Mutex::new(None),
            pipeline: tokio::sync::Mutex::new(Pipeline { muxer, transport }),
            ended: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    fn session(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.current
            .lock()
            .as_ref()
            .filter(|s| s.id == handle.0)
            .cloned()
    }

    /// Mux `frame` and queue it on the socket.
    ///
    /// Never waits on a full socket: a frame that does not fit is dropped
    /// and counted. A fatal transport error ends the session and is
    /// returned once as [`FeedError::Terminal`]; later calls get
    /// [`FeedError::SessionEnded`].
    pub async fn feed(&self, handle: SessionHandle, frame: EncodedFrame) -> Result<FeedOutcome, FeedError> {
        let session = self.session(handle).ok_or(FeedError::UnknownSession)?;
        if session.is_ended() {
            return Err(FeedError::SessionEnded);
        }

        let media = frame.media_type;
        let health = &session.health;
        health.record_submitted(media);

        let mut guard = session.pipeline.lock().await;
        if session.is_ended() {
            health.record_dropped();
            return Err(FeedError::SessionEnded);
        }
        let pipeline = &mut *guard;

        let checkpoint = pipeline.muxer.checkpoint();
        let chunks = match pipeline.muxer.submit(frame) {
            Ok(Muxed::Chunks(chunks)) => chunks,
            Ok(Muxed::Dropped(reason)) => {
                health.record_dropped();
                debug!(?reason, "Frame dropped by muxer");
                return Ok(FeedOutcome::Dropped(reason));
            }
            Err(e) => {
                health.record_dropped();
                warn!(error = %e, "Frame rejected by muxer");
                return Err(FeedError::Mux(e));
            }
        };

        let result = pipeline.transport.send_chunks(&chunks).await;
        health.update_buffer_fullness(pipeline.transport.buffer_fullness());
        match result {
            Ok(()) => {
                health.record_flushed();
                if media == MediaType::Audio {
                    *session.audio_format.lock() = pipeline.muxer.audio_config();
                }
                Ok(FeedOutcome::Sent)
            }
            Err(TransportError::Backpressure { buffered }) => {
                pipeline.muxer.rollback(checkpoint);
                if media == MediaType::Video {
                    pipeline.muxer.resync_video();
                }
                health.record_dropped();
                debug!(buffered, "Frame dropped on backpressure");
                Ok(FeedOutcome::Backpressure)
            }
            Err(TransportError::Cancelled | TransportError::NotPublishing) => {
                health.record_dropped();
                Err(FeedError::SessionEnded)
            }
            Err(e) => {
                health.record_dropped();
                self.finish(&session, pipeline, Some(e.clone())).await;
                Err(FeedError::Terminal(e))
            }
        }
    }

    /// Count a frame the producer could not queue because the frame channel
    /// was full. Returns false when no session is live to charge it to.
    pub fn record_queue_drop(&self, media: MediaType) -> bool {
        let Some(session) = self.current.lock().clone() else {
            return false;
        };
        if session.is_ended() {
            return false;
        }

        session.health.record_submitted(media);
        session.health.record_dropped();
        true
    }

    /// Stop the session and return the transport to `Idle`.
    ///
    /// A write in progress is cancelled rather than awaited. Stopping a
    /// session that already ended is a no-op.
    #[instrument(name = "stop_session", skip(self))]
    pub async fn stop_session(&self, handle: SessionHandle) -> Result<(), StopError> {
        let session = self.session(handle).ok_or(StopError::UnknownSession)?;

        let mut guard = match session.pipeline.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(id = session.id, "Pipeline busy, cancelling in-flight I/O");
                session.cancel.cancel();
                session.pipeline.lock().await
            }
        };

        self.finish(&session, &mut guard, None).await;
        Ok(())
    }

    /// Tear a session down. Runs once per session; only the first caller's
    /// error is reported.
    async fn finish(&self, session: &Session, pipeline: &mut Pipeline, error: Option<TransportError>) {
        if session.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(err) = &error {
            error!(id = session.id, error = %err, "Session failed");
        }

        pipeline.transport.close().await;
        session.cancel.cancel();

        if let Some(err) = error {
            let streaming = err.to_streaming_error();
            *self.last_error.write() = Some(streaming.clone());
            self.send_event(EngineEvent::StreamingError(streaming));
        }

        let snapshot = session.health.snapshot();
        info!(
            id = session.id,
            submitted = snapshot.frames_submitted,
            dropped = snapshot.frames_dropped,
            "Session ended"
        );
    }

    /// The live session, if any.
    pub fn active_session(&self) -> Option<SessionHandle> {
        self.current
            .lock()
            .as_ref()
            .filter(|s| !s.is_ended())
            .map(|s| SessionHandle(s.id))
    }

    /// Returns true if `handle` refers to a session that has ended.
    pub fn is_ended(&self, handle: SessionHandle) -> bool {
        self.session(handle).map_or(true, |s| s.is_ended())
    }

    /// Health monitor of the current (or last) session.
    pub fn health(&self) -> Option<Arc<HealthMonitor>> {
        self.current.lock().as_ref().map(|s| Arc::clone(&s.health))
    }

    /// Transport state of the current (or last) session.
    pub fn state(&self) -> TransportState {
        self.current
            .lock()
            .as_ref()
            .map_or(TransportState::Idle, |s| s.state.current())
    }

    /// Status snapshot of the current (or last) session.
    pub fn status(&self) -> StreamStatus {
        let last_error = self.last_error.read().clone();
        let Some(session) = self.current.lock().clone() else {
            return StreamStatus {
                last_error,
                ..Default::default()
            };
        };

        let health = session.health.snapshot();
        let audio = *session.audio_format.lock();
        let bytes_sent = session.bytes_sent.load(Ordering::Relaxed);
        let elapsed = session.started_at.elapsed();
        let measured_bitrate_kbps = if elapsed.as_secs_f64() > 0.0 {
            (bytes_sent as f64 * 8.0 / elapsed.as_secs_f64() / 1000.0) as u32
        } else {
            0
        };

        StreamStatus {
            server: Some(session.endpoint.to_string()),
            resolution: Some(session.settings.resolution),
            framerate: session.settings.framerate,
            bitrate_kbps: session.settings.bitrate_kbps,
            frames_submitted: health.frames_submitted,
            frames_flushed: health.frames_flushed,
            dropped_frames: health.frames_dropped,
            dropped_percent: health.percent_dropped,
            video_frames: health.video_frames,
            audio_frames: health.audio_frames,
            audio_sample_rate_hz: audio.and_then(AudioSpecificConfig::sample_rate),
            audio_channels: audio.map(|config| config.channel_config),
            bytes_sent,
            measured_bitrate_kbps,
            buffer_fullness_percent: session.health.buffer_fullness(),
            uptime_seconds: elapsed.as_secs(),
            state: session.state.current(),
            last_error,
        }
    }

    fn send_event(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(event) {
                warn!("Failed to send event: {}", e);
            }
        }
    }
}
