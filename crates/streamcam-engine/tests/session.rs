//! Session lifecycle against an in-process RTMP server.

use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use std::sync::Arc;

use streamcam_engine::{ConnectionManager, FeedError, FeedOutcome, FrameSink, Offer, StartError};
use streamcam_ipc::{
    CameraModes, EngineEvent, ErrorCategory, Resolution, StreamSettings, TransportState,
    WarningType,
};
use streamcam_test_utils::{refused_addr, StubBehavior, StubRtmpServer};
use streamcam_transport::{DropReason, EncodedFrame, TransportConfig, TransportError};

const KEY_FRAME: &[u8] = &[
    0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F, 0xAC, //
    0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80, //
    0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21,
];
const DELTA_FRAME: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x02, 0x03];

fn settings(uri: String) -> StreamSettings {
    StreamSettings {
        server_uri: uri,
        ..Default::default()
    }
}

fn manager(config: TransportConfig) -> (ConnectionManager, Receiver<EngineEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let manager = ConnectionManager::new(config, CameraModes::default()).with_events(tx);
    (manager, rx)
}

fn streaming_errors(events: &[EngineEvent]) -> Vec<ErrorCategory> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::StreamingError(e) => Some(e.category),
            _ => None,
        })
        .collect()
}

fn entered(events: &[EngineEvent], state: TransportState) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, EngineEvent::StateChanged { current, .. } if *current == state))
        .count()
}

#[tokio::test]
async fn test_boundary_settings_reach_publishing() {
    let server = StubRtmpServer::spawn(StubBehavior::Publish).await.unwrap();
    let (manager, _events) = manager(TransportConfig::default());

    let mut cases = vec![(128, 15.0), (36_000, 30.0)];
    cases.extend(
        CameraModes::default()
            .resolutions
            .iter()
            .map(|_| (2500, 30.0)),
    );

    for (i, (bitrate_kbps, framerate)) in cases.into_iter().enumerate() {
        let resolutions = CameraModes::default().resolutions;
        let resolution = resolutions[i % resolutions.len()];
        let handle = manager
            .start_session(StreamSettings {
                resolution,
                bitrate_kbps,
                framerate,
                ..settings(server.uri("live", "key"))
            })
            .await
            .unwrap();

        assert_eq!(manager.state(), TransportState::Publishing);
        let status = manager.status();
        assert_eq!(status.resolution, Some(resolution));
        assert_eq!(status.bitrate_kbps, bitrate_kbps);

        manager.stop_session(handle).await.unwrap();
        assert_eq!(manager.state(), TransportState::Idle);
    }
}

#[tokio::test]
async fn test_out_of_range_settings_never_connect() {
    let server = StubRtmpServer::spawn(StubBehavior::Publish).await.unwrap();
    let (manager, events) = manager(TransportConfig::default());

    for settings in [
        StreamSettings {
            bitrate_kbps: 36_001,
            ..settings(server.uri("live", "key"))
        },
        StreamSettings {
            framerate: 14.9,
            ..settings(server.uri("live", "key"))
        },
        StreamSettings {
            resolution: Resolution::new(1, 1),
            ..settings(server.uri("live", "key"))
        },
    ] {
        let err = manager.start_session(settings).await.unwrap_err();
        assert!(matches!(err, StartError::Validation(_)));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().connections, 0);
    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(streaming_errors(&events), vec![ErrorCategory::Validation; 3]);
    assert_eq!(entered(&events, TransportState::Connecting), 0);
}

#[tokio::test]
async fn test_frames_before_key_frame_are_dropped() {
    let server = StubRtmpServer::spawn(StubBehavior::Publish).await.unwrap();
    let (manager, _events) = manager(TransportConfig::default());
    let handle = manager
        .start_session(settings(server.uri("live", "key")))
        .await
        .unwrap();

    let outcomes = [
        manager.feed(handle, EncodedFrame::video(0, DELTA_FRAME, false)).await,
        manager.feed(handle, EncodedFrame::video(33, DELTA_FRAME, false)).await,
        manager.feed(handle, EncodedFrame::video(66, KEY_FRAME, true)).await,
        manager.feed(handle, EncodedFrame::video(100, DELTA_FRAME, false)).await,
    ];
    assert_eq!(
        outcomes,
        [
            Ok(FeedOutcome::Dropped(DropReason::AwaitingKeyFrame)),
            Ok(FeedOutcome::Dropped(DropReason::AwaitingKeyFrame)),
            Ok(FeedOutcome::Sent),
            Ok(FeedOutcome::Sent),
        ]
    );

    let status = manager.status();
    assert_eq!(status.frames_submitted, 4);
    assert_eq!(status.dropped_frames, 2);
    assert_eq!(status.dropped_percent, 50.0);
    assert_eq!(status.dropped_line(), "Dropped frames: 2 (50.0%)");

    assert!(
        server
            .wait_for(Duration::from_secs(5), |s| s.video_messages == 3)
            .await
    );
    assert_eq!(server.stats().video_timestamps, vec![0, 0, 34]);

    manager.stop_session(handle).await.unwrap();
}

#[tokio::test]
async fn test_second_session_is_refused_while_live() {
    let server = StubRtmpServer::spawn(StubBehavior::Publish).await.unwrap();
    let (manager, _events) = manager(TransportConfig::default());
    let handle = manager
        .start_session(settings(server.uri("live", "key")))
        .await
        .unwrap();

    let err = manager
        .start_session(settings(server.uri("live", "other")))
        .await
        .unwrap_err();
    assert_eq!(err, StartError::AlreadyStreaming);

    manager.stop_session(handle).await.unwrap();
    let next = manager
        .start_session(settings(server.uri("live", "other")))
        .await
        .unwrap();
    assert_ne!(next, handle);
    manager.stop_session(next).await.unwrap();
}

#[tokio::test]
async fn test_connection_refused_is_reported_once() {
    let (manager, events) = manager(TransportConfig::default());
    let addr = refused_addr();

    let err = manager
        .start_session(settings(format!("rtmp://{}/live/key", addr)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StartError::Transport(TransportError::ConnectionRefused { .. })
    ));
    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(streaming_errors(&events), vec![ErrorCategory::ConnectionRefused]);
    assert_eq!(entered(&events, TransportState::Failed), 1);
    assert_eq!(manager.state(), TransportState::Idle);

    let status = manager.status();
    let last_error = status.last_error.unwrap();
    assert_eq!(last_error.message, "Socket error! 127.0.0.1 refused connection.");
    assert!(manager.active_session().is_none());
}

#[tokio::test]
async fn test_remote_close_fails_exactly_once() {
    let server = StubRtmpServer::spawn(StubBehavior::CloseAfterPublish)
        .await
        .unwrap();
    let (manager, events) = manager(TransportConfig::default());
    let handle = manager
        .start_session(settings(server.uri("live", "key")))
        .await
        .unwrap();

    let mut terminal = None;
    for i in 0..300u64 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let frame = if i == 0 {
            EncodedFrame::video(0, KEY_FRAME, true)
        } else {
            EncodedFrame::video(i * 33, DELTA_FRAME, false)
        };
        if let Err(e) = manager.feed(handle, frame).await {
            terminal = Some(e);
            break;
        }
    }

    assert!(matches!(
        terminal,
        Some(FeedError::Terminal(TransportError::RemoteClosed { .. }))
    ));
    assert_eq!(
        manager
            .feed(handle, EncodedFrame::video(99_999, DELTA_FRAME, false))
            .await,
        Err(FeedError::SessionEnded)
    );
    manager.stop_session(handle).await.unwrap();

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(streaming_errors(&events), vec![ErrorCategory::RemoteClosed]);
    assert_eq!(entered(&events, TransportState::Failed), 1);
    assert_eq!(manager.state(), TransportState::Idle);
    assert!(manager.is_ended(handle));
}

#[tokio::test]
async fn test_stop_during_blocked_write_is_prompt() {
    let server = StubRtmpServer::spawn(StubBehavior::StallAfterPublish)
        .await
        .unwrap();
    let config = TransportConfig {
        write_budget: Duration::from_secs(60),
        write_stall_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let (manager, events) = manager(config);
    let handle = manager
        .start_session(settings(server.uri("live", "key")))
        .await
        .unwrap();

    // Far more than loopback socket buffers hold.
    let mut frame = KEY_FRAME.to_vec();
    frame.resize(KEY_FRAME.len() + 15 * 1024 * 1024, 0x55);

    let started = Instant::now();
    let feeding = manager.feed(handle, EncodedFrame::video(0, frame, true));
    let stopping = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop_session(handle).await
    };
    let (fed, stopped) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(feeding, stopping)
    })
    .await
    .expect("stop did not interrupt the write");

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(fed, Err(FeedError::SessionEnded));
    assert_eq!(stopped, Ok(()));
    assert_eq!(manager.state(), TransportState::Idle);

    let events: Vec<_> = events.try_iter().collect();
    assert!(streaming_errors(&events).is_empty());
    assert_eq!(manager.status().dropped_frames, 1);
}

#[tokio::test]
async fn test_backpressure_drops_until_next_key_frame() {
    let server = StubRtmpServer::spawn(StubBehavior::StallAfterPublish)
        .await
        .unwrap();
    let config = TransportConfig {
        high_water_mark: 64 * 1024,
        write_budget: Duration::from_millis(50),
        write_stall_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let (manager, events) = manager(config);
    let handle = manager
        .start_session(settings(server.uri("live", "key")))
        .await
        .unwrap();

    // Accepted into an empty buffer, but far more than loopback socket
    // buffers take while the server is not reading.
    let mut big = KEY_FRAME.to_vec();
    big.resize(KEY_FRAME.len() + 15 * 1024 * 1024, 0x55);
    assert_eq!(
        manager.feed(handle, EncodedFrame::video(0, big, true)).await,
        Ok(FeedOutcome::Sent)
    );

    let outcomes = [
        manager.feed(handle, EncodedFrame::video(33, DELTA_FRAME, false)).await,
        manager.feed(handle, EncodedFrame::video(66, DELTA_FRAME, false)).await,
        manager.feed(handle, EncodedFrame::video(100, KEY_FRAME, true)).await,
    ];
    assert_eq!(
        outcomes,
        [
            Ok(FeedOutcome::Backpressure),
            Ok(FeedOutcome::Dropped(DropReason::AwaitingKeyFrame)),
            Ok(FeedOutcome::Backpressure),
        ]
    );

    let status = manager.status();
    assert_eq!(status.frames_submitted, 4);
    assert_eq!(status.frames_flushed, 1);
    assert_eq!(status.dropped_frames, 3);
    assert_eq!(status.state, TransportState::Publishing);
    assert_eq!(status.buffer_fullness_percent, 100.0);
    assert!(manager
        .health()
        .unwrap()
        .check_warnings()
        .iter()
        .any(|w| matches!(w, WarningType::NetworkCongestion { .. })));

    manager.stop_session(handle).await.unwrap();
    assert_eq!(manager.state(), TransportState::Idle);
    let events: Vec<_> = events.try_iter().collect();
    assert!(streaming_errors(&events).is_empty());
}

#[tokio::test]
async fn test_full_frame_queue_counts_as_dropped() {
    let server = StubRtmpServer::spawn(StubBehavior::Publish).await.unwrap();
    let (manager, _events) = manager(TransportConfig::default());
    let manager = Arc::new(manager);
    let handle = manager
        .start_session(settings(server.uri("live", "key")))
        .await
        .unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let sink = FrameSink::new(tx, Arc::clone(&manager));
    assert_eq!(sink.offer(EncodedFrame::video(0, KEY_FRAME, true)), Offer::Queued);
    assert_eq!(sink.offer(EncodedFrame::video(33, DELTA_FRAME, false)), Offer::Dropped);
    assert_eq!(sink.offer(EncodedFrame::video(66, DELTA_FRAME, false)), Offer::Dropped);

    let queued = rx.try_recv().unwrap();
    assert_eq!(manager.feed(handle, queued).await, Ok(FeedOutcome::Sent));

    let status = manager.status();
    assert_eq!(status.frames_submitted, 3);
    assert_eq!(status.video_frames, 3);
    assert_eq!(status.dropped_frames, 2);
    assert_eq!(status.dropped_line(), "Dropped frames: 2 (66.7%)");

    manager.stop_session(handle).await.unwrap();
    assert_eq!(sink.offer(EncodedFrame::video(100, DELTA_FRAME, false)), Offer::Queued);
    assert_eq!(sink.offer(EncodedFrame::video(133, DELTA_FRAME, false)), Offer::Dropped);
    assert_eq!(manager.status().dropped_frames, 2);
}
