//! Main engine orchestrator.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, instrument, warn};

use streamcam_ipc::{CameraModes, EngineCommand, EngineEvent, StreamSettings};
use streamcam_transport::{EncodedFrame, TransportConfig};

use crate::error::FeedError;
use crate::manager::ConnectionManager;
use crate::sink::FrameSink;
use crate::FRAME_CHANNEL_CAPACITY;

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Socket timeouts and buffer limits.
    pub transport: TransportConfig,

    /// Modes the attached camera supports.
    pub camera_modes: CameraModes,

    /// How often status is pushed while a session exists.
    pub status_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            camera_modes: CameraModes::default(),
            status_interval: Duration::from_secs(1),
        }
    }
}

/// The streaming engine.
///
/// Commands are handled on the thread that calls [`Engine::run`]. Each
/// session gets a streaming thread that connects and then feeds frames
/// from the frame channel until the session ends.
pub struct Engine {
    command_rx: Receiver<EngineCommand>,
    frame_rx: Receiver<EncodedFrame>,
    event_tx: Sender<EngineEvent>,
    runtime: Runtime,
    manager: Arc<ConnectionManager>,
    config: EngineConfig,
    stream_thread: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
    last_status: Instant,
}

impl Engine {
    /// Create a new engine and the sink its frames arrive through.
    ///
    /// The frame queue holds [`FRAME_CHANNEL_CAPACITY`] frames. Once every
    /// clone of the sink is dropped the streaming thread stops the session.
    pub fn new(
        command_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
        config: EngineConfig,
    ) -> io::Result<(Self, FrameSink)> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("streamcam-io")
            .enable_all()
            .build()?;
        let manager = ConnectionManager::new(config.transport.clone(), config.camera_modes.clone())
            .with_events(event_tx.clone());
        let manager = Arc::new(manager);

        let (frame_tx, frame_rx) = crossbeam_channel::bounded(FRAME_CHANNEL_CAPACITY);
        let sink = FrameSink::new(frame_tx, Arc::clone(&manager));

        let engine = Self {
            command_rx,
            frame_rx,
            event_tx,
            runtime,
            manager,
            config,
            stream_thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            last_status: Instant::now(),
        };
        Ok((engine, sink))
    }

    /// Run the engine (blocking).
    #[instrument(name = "engine_run", skip(self))]
    pub fn run(&mut self) {
        info!("Engine starting");
        self.send_event(EngineEvent::Ready);

        loop {
            match self.command_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Command channel disconnected, shutting down");
                    self.stop_stream();
                    break;
                }
            }

            self.reap_stream_thread();
            if self.stream_thread.is_some()
                && self.last_status.elapsed() >= self.config.status_interval
            {
                self.emit_status();
            }
        }

        info!("Engine stopped");
    }

    /// Handle a command. Returns false if engine should stop.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            EngineCommand::Start { settings } => self.start_stream(settings),
            EngineCommand::Stop => self.stop_stream(),
            EngineCommand::GetStatus => self.send_status(),
            EngineCommand::GetAcceptedRanges => {
                self.send_event(EngineEvent::AcceptedRanges(self.manager.accepted_ranges()))
            }
            EngineCommand::Shutdown => {
                self.stop_stream();
                self.send_event(EngineEvent::Shutdown);
                return false;
            }
        }

        true
    }

    /// Start streaming.
    #[instrument(name = "start_stream", skip(self, settings))]
    fn start_stream(&mut self, settings: StreamSettings) {
        // Idempotent: ignore if a session is connecting or live
        if self.stream_thread.is_some() {
            debug!("Already streaming, ignoring start command");
            return;
        }

        info!(server = %settings.server_uri, "Starting stream");
        self.should_stop.store(false, Ordering::SeqCst);

        // Frames queued for an earlier session are stale
        while self.frame_rx.try_recv().is_ok() {}

        let runtime = self.runtime.handle().clone();
        let manager = Arc::clone(&self.manager);
        let frame_rx = self.frame_rx.clone();
        let should_stop = Arc::clone(&self.should_stop);

        let handle = thread::Builder::new()
            .name("streamcam-stream".to_string())
            .spawn(move || stream_loop(runtime, manager, settings, frame_rx, should_stop));

        match handle {
            Ok(handle) => {
                self.stream_thread = Some(handle);
                self.last_status = Instant::now();
            }
            Err(e) => warn!("Failed to spawn stream thread: {}", e),
        }
    }

    /// Stop streaming.
    #[instrument(name = "stop_stream", skip(self))]
    fn stop_stream(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);

        if let Some(session) = self.manager.active_session() {
            info!(id = session.id(), "Stopping stream");
            if let Err(e) = self.runtime.block_on(self.manager.stop_session(session)) {
                debug!("Stop raced with session end: {}", e);
            }
        }

        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
            self.send_status();
        }
    }

    /// Join the stream thread once its session has ended on its own.
    fn reap_stream_thread(&mut self) {
        if self
            .stream_thread
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
        {
            if let Some(handle) = self.stream_thread.take() {
                let _ = handle.join();
            }
            info!("Stream ended");
            self.send_status();
        }
    }

    fn emit_status(&mut self) {
        self.send_status();

        if let Some(health) = self.manager.health() {
            for warning in health.check_warnings() {
                self.send_event(EngineEvent::PerformanceWarning(warning));
            }
        }

        self.last_status = Instant::now();
    }

    fn send_status(&self) {
        self.send_event(EngineEvent::Status(Box::new(self.manager.status())));
    }

    fn send_event(&self, event: EngineEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Connect, then feed frames until the session ends or a stop is requested.
fn stream_loop(
    runtime: Handle,
    manager: Arc<ConnectionManager>,
    settings: StreamSettings,
    frame_rx: Receiver<EncodedFrame>,
    should_stop: Arc<AtomicBool>,
) {
    let session = match runtime.block_on(manager.start_session(settings)) {
        Ok(session) => session,
        Err(e) => {
            warn!("Stream start failed: {}", e);
            return;
        }
    };

    if should_stop.load(Ordering::SeqCst) {
        let _ = runtime.block_on(manager.stop_session(session));
        return;
    }

    debug!("Stream loop starting");
    let mut frames_fed: u64 = 0;

    while !should_stop.load(Ordering::SeqCst) {
        let frame = match frame_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                if manager.is_ended(session) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                info!("Frame channel disconnected");
                let _ = runtime.block_on(manager.stop_session(session));
                break;
            }
        };

        match runtime.block_on(manager.feed(session, frame)) {
            Ok(_) => frames_fed += 1,
            Err(FeedError::Mux(e)) => debug!("Frame rejected: {}", e),
            Err(e) => {
                debug!("Feed stopped: {}", e);
                break;
            }
        }
    }

    info!(frames_fed, "Stream loop stopped");
}

#[cfg(test)]
mod tests {
    use streamcam_ipc::{command_channel, event_channel, ErrorCategory, TransportState};

    use super::*;

    fn engine() -> (Engine, Sender<EngineCommand>, Receiver<EngineEvent>) {
        let (command_tx, command_rx) = command_channel();
        let (event_tx, event_rx) = event_channel();
        let (engine, _sink) = Engine::new(command_rx, event_tx, EngineConfig::default()).unwrap();
        (engine, command_tx, event_rx)
    }

    #[test]
    fn test_engine_answers_queries_and_shuts_down() {
        let (mut engine, command_tx, event_rx) = engine();
        command_tx.send(EngineCommand::GetAcceptedRanges).unwrap();
        command_tx.send(EngineCommand::GetStatus).unwrap();
        command_tx.send(EngineCommand::Shutdown).unwrap();

        engine.run();

        let events: Vec<_> = event_rx.try_iter().collect();
        assert!(matches!(events[0], EngineEvent::Ready));
        assert!(matches!(&events[1], EngineEvent::AcceptedRanges(r) if r.min_bitrate_kbps == 128));
        assert!(matches!(
            &events[2],
            EngineEvent::Status(s) if s.state == TransportState::Idle && s.server.is_none()
        ));
        assert!(matches!(events.last(), Some(EngineEvent::Shutdown)));
    }

    #[test]
    fn test_invalid_start_reports_error_without_connecting() {
        let (mut engine, _command_tx, event_rx) = engine();

        engine.handle_command(EngineCommand::Start {
            settings: StreamSettings {
                server_uri: "rtmp://localhost/live/key".to_string(),
                framerate: 60.0,
                ..Default::default()
            },
        });
        engine.stream_thread.take().unwrap().join().unwrap();

        let events: Vec<_> = event_rx.try_iter().collect();
        let errors: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                EngineEvent::StreamingError(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::Validation);
        assert!(!events
            .iter()
            .any(|event| matches!(event, EngineEvent::StateChanged { .. })));
        assert_eq!(engine.manager.state(), TransportState::Idle);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.status_interval, Duration::from_secs(1));
        assert_eq!(config.camera_modes, CameraModes::default());
    }
}
