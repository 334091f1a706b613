//! StreamCam command-line publisher.
//!
//! Streams a raw Annex B H.264 file to an RTMP server through the engine,
//! standing in for a live camera.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use streamcam_engine::{create_engine, EngineConfig, FrameSink, Offer};
use streamcam_ipc::{
    command_channel, event_channel, EngineCommand, EngineEvent, Resolution, StreamSettings,
    StreamingError, TransportState,
};

mod source;

use source::FileSource;

#[derive(Parser)]
#[command(name = "streamcam")]
#[command(author, version, about = "Publish an H.264 stream to an RTMP server", long_about = None)]
struct Cli {
    /// Server URI: rtmp://host[:port]/app/streamKey
    #[arg(value_name = "SERVER_URI")]
    server: String,

    /// Raw Annex B H.264 file to publish
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Frame width
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Frame height
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Frames per second
    #[arg(long, default_value_t = 30.0)]
    fps: f32,

    /// Advertised bitrate in kbps
    #[arg(long, default_value_t = 2500)]
    bitrate: u32,

    /// Replay the file until the stream fails
    #[arg(long = "loop")]
    looping: bool,

    /// Print status snapshots as JSON lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn settings(&self) -> StreamSettings {
        StreamSettings {
            server_uri: self.server.clone(),
            resolution: Resolution::new(self.width, self.height),
            bitrate_kbps: self.bitrate,
            framerate: self.fps,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let source = FileSource::open(&cli.input, cli.fps, cli.looping)?;
    info!(input = %cli.input.display(), access_units = source.len(), "Loaded input");

    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();

    let (mut engine, frames) = create_engine(command_rx, event_tx, EngineConfig::default())
        .context("Failed to create engine")?;
    let engine_thread = thread::Builder::new()
        .name("streamcam-engine".to_string())
        .spawn(move || engine.run())
        .context("Failed to spawn engine thread")?;

    let mut outcome = publish(&cli, source, &command_tx, &frames, &event_rx);

    command_tx
        .send(EngineCommand::Shutdown)
        .map_err(|e| anyhow!("Failed to send command: {}", e))?;
    for event in event_rx.iter() {
        if matches!(event, EngineEvent::Shutdown) {
            break;
        }
        if let Err(e) = report(&event, cli.json) {
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }

    engine_thread
        .join()
        .map_err(|_| anyhow!("Engine thread panicked"))?;
    outcome
}

/// Start the session and feed it frames at the source's pace.
fn publish(
    cli: &Cli,
    source: FileSource,
    command_tx: &Sender<EngineCommand>,
    frames: &FrameSink,
    event_rx: &Receiver<EngineEvent>,
) -> Result<()> {
    command_tx
        .send(EngineCommand::Start {
            settings: cli.settings(),
        })
        .map_err(|e| anyhow!("Failed to send command: {}", e))?;
    wait_for_publishing(event_rx, cli.json)?;

    let interval = Duration::from_secs_f64(1.0 / f64::from(cli.fps));
    let started = Instant::now();
    let mut queue_drops: u64 = 0;

    for (index, frame) in source.enumerate() {
        let due = started + interval.mul_f64(index as f64);
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }

        match frames.offer(frame) {
            Offer::Queued => {}
            Offer::Dropped => {
                queue_drops += 1;
                debug!(index, "Frame queue full, frame skipped");
            }
            Offer::Disconnected => break,
        }

        for event in event_rx.try_iter() {
            report(&event, cli.json)?;
        }
    }

    info!(queue_drops, "Input finished");
    command_tx
        .send(EngineCommand::Stop)
        .map_err(|e| anyhow!("Failed to send command: {}", e))?;
    Ok(())
}

fn wait_for_publishing(event_rx: &Receiver<EngineEvent>, json: bool) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match event_rx.recv_timeout(remaining) {
            Ok(EngineEvent::StateChanged {
                current: TransportState::Publishing,
                ..
            }) => {
                info!("Publishing");
                return Ok(());
            }
            Ok(event) => report(&event, json)?,
            Err(RecvTimeoutError::Timeout) => bail!("Timed out waiting for the server"),
            Err(RecvTimeoutError::Disconnected) => bail!("Engine stopped unexpectedly"),
        }
    }
}

/// Log or print one event. A streaming error ends the run.
fn report(event: &EngineEvent, json: bool) -> Result<()> {
    match event {
        EngineEvent::Status(status) if json => {
            println!("{}", serde_json::to_string(status)?);
        }
        EngineEvent::Status(status) => {
            info!(
                "{} | {} | {} | {} | {}",
                status.server_line(),
                status.video_line(),
                status.audio_line(),
                status.dropped_line(),
                status.uptime_line()
            );
        }
        EngineEvent::StateChanged { previous, current } => {
            debug!(previous = %previous.name(), current = %current.name(), "State changed");
        }
        EngineEvent::PerformanceWarning(warning) => {
            warn!(?warning, "Performance warning");
        }
        EngineEvent::StreamingError(error) => {
            bail!("{}: {}", StreamingError::TITLE, error.message);
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_maps_onto_settings() {
        let cli = Cli::try_parse_from([
            "streamcam",
            "rtmp://example.com/live/key",
            "--input",
            "camera.h264",
            "--width",
            "640",
            "--height",
            "480",
            "--fps",
            "15",
            "--loop",
        ])
        .unwrap();

        let settings = cli.settings();
        assert_eq!(settings.server_uri, "rtmp://example.com/live/key");
        assert_eq!(settings.resolution, Resolution::new(640, 480));
        assert_eq!(settings.framerate, 15.0);
        assert_eq!(settings.bitrate_kbps, 2500);
        assert!(cli.looping);
        assert!(!cli.json);
    }

    #[test]
    fn test_input_is_required() {
        assert!(Cli::try_parse_from(["streamcam", "rtmp://example.com/live/key"]).is_err());
    }

    #[test]
    fn test_streaming_error_ends_run() {
        let event = EngineEvent::StreamingError(StreamingError::new(
            streamcam_ipc::ErrorCategory::RemoteClosed,
            "Socket error! example.com closed the connection.",
        ));

        let err = report(&event, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Streaming error: Socket error! example.com closed the connection."
        );
        assert!(report(&EngineEvent::Ready, false).is_ok());
    }
}
