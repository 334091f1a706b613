//! In-process RTMP server for end-to-end tests.
//!
//! Binds `127.0.0.1:0`, accepts connections in the background and answers
//! them with a real `rml_rtmp` server session. What happens after the
//! publish request depends on the [`StubBehavior`].

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the server does with a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubBehavior {
    /// Accept the connection and the publish, then count media forever.
    Publish,
    /// Accept the publish, then close the socket after a short delay.
    CloseAfterPublish,
    /// Accept the publish, then stop reading while holding the socket open.
    StallAfterPublish,
    /// Reject the connect request.
    RejectConnection,
    /// Accept the connection but refuse the publish with a bad stream name.
    RejectPublish,
    /// Accept TCP but never answer the handshake.
    Unresponsive,
}

/// What the server has observed so far.
#[derive(Debug, Clone, Default)]
pub struct StubStats {
    pub connections: usize,
    pub app: Option<String>,
    pub stream_key: Option<String>,
    pub published: bool,
    pub metadata_received: usize,
    pub video_messages: usize,
    pub audio_messages: usize,
    /// Payloads of every video message, in arrival order.
    pub video_payloads: Vec<Vec<u8>>,
    /// Timestamps of every video message, in arrival order.
    pub video_timestamps: Vec<u32>,
}

/// Test harness for an RTMP ingest server.
pub struct StubRtmpServer {
    addr: SocketAddr,
    stats: Arc<Mutex<StubStats>>,
    _handle: JoinHandle<()>,
}

impl StubRtmpServer {
    /// Spawn a server on a random local port.
    pub async fn spawn(behavior: StubBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow!("Failed to bind stub server: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow!("Failed to get local address: {}", e))?;

        let stats = Arc::new(Mutex::new(StubStats::default()));
        let shared = Arc::clone(&stats);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    break;
                };
                shared.lock().connections += 1;
                tracing::debug!(%peer, "Stub server accepted connection");

                let stats = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = serve(socket, behavior, stats).await {
                        tracing::debug!(error = %e, "Stub connection ended");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            stats,
            _handle: handle,
        })
    }

    /// Socket address the server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Publish URI for `app` and `stream_key` on this server.
    pub fn uri(&self, app: &str, stream_key: &str) -> String {
        format!("rtmp://{}/{}/{}", self.addr, app, stream_key)
    }

    /// Snapshot of what the server has seen.
    pub fn stats(&self) -> StubStats {
        self.stats.lock().clone()
    }

    /// Poll until `predicate` holds or `limit` passes.
    pub async fn wait_for(&self, limit: Duration, predicate: impl Fn(&StubStats) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if predicate(&self.stats.lock()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for StubRtmpServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

/// A local address nothing is listening on.
pub fn refused_addr() -> SocketAddr {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn serve(
    mut socket: TcpStream,
    behavior: StubBehavior,
    stats: Arc<Mutex<StubStats>>,
) -> Result<()> {
    if behavior == StubBehavior::Unresponsive {
        std::future::pending::<()>().await;
    }

    let leftover = handshake(&mut socket).await?;

    let (mut session, initial) = ServerSession::new(ServerSessionConfig::new())
        .map_err(|e| anyhow!("Server session creation failed: {:?}", e))?;
    let mut pending: VecDeque<ServerSessionResult> = initial.into();
    if !leftover.is_empty() {
        pending.extend(
            session
                .handle_input(&leftover)
                .map_err(|e| anyhow!("{:?}", e))?,
        );
    }

    let mut buf = vec![0u8; 4096];
    loop {
        let mut published = false;
        while let Some(result) = pending.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    socket.write_all(&packet.bytes).await?;
                }
                ServerSessionResult::RaisedEvent(event) => {
                    published |= handle_event(&mut session, event, behavior, &stats, &mut pending)?;
                }
                _ => {}
            }
        }

        if published {
            match behavior {
                StubBehavior::CloseAfterPublish => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    return Ok(());
                }
                StubBehavior::StallAfterPublish => {
                    std::future::pending::<()>().await;
                }
                _ => {}
            }
        }

        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        pending.extend(
            session
                .handle_input(&buf[..n])
                .map_err(|e| anyhow!("{:?}", e))?,
        );
    }
}

/// Returns true once the publish request has been accepted.
fn handle_event(
    session: &mut ServerSession,
    event: ServerSessionEvent,
    behavior: StubBehavior,
    stats: &Mutex<StubStats>,
    pending: &mut VecDeque<ServerSessionResult>,
) -> Result<bool> {
    match event {
        ServerSessionEvent::ConnectionRequested {
            request_id,
            app_name,
            ..
        } => {
            stats.lock().app = Some(app_name);
            let results = if behavior == StubBehavior::RejectConnection {
                session.reject_request(request_id, "NetConnection.Connect.Rejected", "Not allowed")
            } else {
                session.accept_request(request_id)
            };
            pending.extend(results.map_err(|e| anyhow!("{:?}", e))?);
        }
        ServerSessionEvent::PublishStreamRequested {
            request_id,
            stream_key,
            ..
        } => {
            if behavior == StubBehavior::RejectPublish {
                stats.lock().stream_key = Some(stream_key);
                pending.extend(
                    session
                        .reject_request(request_id, "NetStream.Publish.BadName", "Stream key in use")
                        .map_err(|e| anyhow!("{:?}", e))?,
                );
                return Ok(false);
            }

            {
                let mut stats = stats.lock();
                stats.stream_key = Some(stream_key);
                stats.published = true;
            }
            pending.extend(
                session
                    .accept_request(request_id)
                    .map_err(|e| anyhow!("{:?}", e))?,
            );
            return Ok(true);
        }
        ServerSessionEvent::StreamMetadataChanged { .. } => {
            stats.lock().metadata_received += 1;
        }
        ServerSessionEvent::VideoDataReceived {
            data, timestamp, ..
        } => {
            let mut stats = stats.lock();
            stats.video_messages += 1;
            stats.video_payloads.push(data.to_vec());
            stats.video_timestamps.push(timestamp.value);
        }
        ServerSessionEvent::AudioDataReceived { .. } => {
            stats.lock().audio_messages += 1;
        }
        _ => {}
    }
    Ok(false)
}

async fn handshake(socket: &mut TcpStream) -> Result<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Server);
    let mut buf = vec![0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(anyhow!("Client closed during handshake"));
        }

        match handshake
            .process_bytes(&buf[..n])
            .map_err(|e| anyhow!("Handshake failed: {:?}", e))?
        {
            HandshakeProcessResult::InProgress { response_bytes } => {
                socket.write_all(&response_bytes).await?;
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                socket.write_all(&response_bytes).await?;
                return Ok(remaining_bytes);
            }
        }
    }
}
