//! RTMP publishing transport.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::FutureExt;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use streamcam_ipc::{RtmpEndpoint, TransportState};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::chunk::MuxChunk;
use crate::config::TransportConfig;
use crate::connection::StateHandle;
use crate::error::TransportError;
use crate::TransportResult;

const READ_BUFFER_SIZE: usize = 4096;

/// An established connection.
struct Link<S> {
    stream: S,
    /// Absent only for links built directly around a test stream.
    session: Option<ClientSession>,
    host: String,
}

/// RTMP client that publishes one stream over one connection.
///
/// Media is accepted as pre-built [`MuxChunk`]s. Writes never block longer
/// than the configured write budget: whatever the socket does not take is
/// kept in an outbound buffer and resumed on the next call. Every await
/// also watches the cancellation token, so a stop request interrupts a
/// connect or a stalled write promptly.
pub struct RtmpTransport<S = TcpStream> {
    config: TransportConfig,
    state: StateHandle,
    cancel: CancellationToken,
    link: Option<Link<S>>,
    outbound: BytesMut,
    last_progress: Instant,
    bytes_sent: Arc<AtomicU64>,
}

impl<S> RtmpTransport<S> {
    /// Create an idle transport.
    pub fn new(config: TransportConfig, state: StateHandle, cancel: CancellationToken) -> Self {
        Self {
            config,
            state,
            cancel,
            link: None,
            outbound: BytesMut::new(),
            last_progress: Instant::now(),
            bytes_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current transport state.
    pub fn state(&self) -> TransportState {
        self.state.current()
    }

    /// Token that cancels in-flight operations.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Outbound buffer fullness relative to the high-water mark (0-100).
    pub fn buffer_fullness(&self) -> f32 {
        let hwm = self.config.high_water_mark.max(1) as f32;
        (self.outbound.len() as f32 / hwm * 100.0).min(100.0)
    }

    /// Shared handle on the count of bytes written to the socket.
    pub fn bytes_sent_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_sent)
    }

    /// Leave `Failed` or `Idle` and enter `Connecting`.
    fn begin_connect(&mut self) -> TransportResult<()> {
        if self.state.current() == TransportState::Failed {
            self.state.transition(TransportState::Idle)?;
        }
        self.state.transition(TransportState::Connecting)?;
        self.outbound.clear();
        Ok(())
    }

    /// Record a fatal error: drop the socket and move to `Failed`.
    fn settle<T>(&mut self, result: TransportResult<T>) -> TransportResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(error = %err, "Transport failed");
                self.link = None;
                self.outbound.clear();
                if self.state.current() != TransportState::Failed {
                    let _ = self.state.transition(TransportState::Failed);
                }
            }
        }
        result
    }
}

impl RtmpTransport<TcpStream> {
    /// Connect to `uri` and negotiate publishing.
    pub async fn connect(&mut self, uri: &str) -> TransportResult<()> {
        let endpoint =
            RtmpEndpoint::parse(uri).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        self.connect_to(&endpoint).await
    }

    /// Connect to a parsed endpoint and negotiate publishing.
    ///
    /// On success the state is `Publishing`; on a socket or protocol error
    /// it is `Failed`. A transport left `Failed` by an earlier attempt
    /// restarts from `Idle`.
    #[instrument(name = "rtmp_connect", skip(self, endpoint), fields(endpoint = %endpoint))]
    pub async fn connect_to(&mut self, endpoint: &RtmpEndpoint) -> TransportResult<()> {
        self.begin_connect()?;
        info!(host = %endpoint.host, port = endpoint.port, app = %endpoint.app, "Connecting to RTMP server");

        let opened = guarded(
            &self.cancel,
            self.config.connect_timeout,
            &endpoint.host,
            open_socket(endpoint),
        )
        .await;
        let stream = self.settle(opened)?;

        let negotiated = self.negotiate(stream, endpoint).await;
        self.settle(negotiated)
    }
}

impl<S> RtmpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Negotiate publishing over an already connected stream.
    #[instrument(name = "rtmp_connect_stream", skip(self, stream, endpoint), fields(endpoint = %endpoint))]
    pub async fn connect_stream(&mut self, stream: S, endpoint: &RtmpEndpoint) -> TransportResult<()> {
        self.begin_connect()?;
        let negotiated = self.negotiate(stream, endpoint).await;
        self.settle(negotiated)
    }

    async fn negotiate(&mut self, mut stream: S, endpoint: &RtmpEndpoint) -> TransportResult<()> {
        let host = endpoint.host.as_str();
        self.state.transition(TransportState::Handshaking)?;

        let leftover = guarded(
            &self.cancel,
            self.config.handshake_timeout,
            host,
            perform_handshake(&mut stream, host),
        )
        .await?;
        debug!("Handshake complete, creating RTMP session");

        let mut session_config = ClientSessionConfig::new();
        session_config.chunk_size = self.config.chunk_size;
        session_config.tc_url = Some(endpoint.tc_url());
        let (mut session, initial) = ClientSession::new(session_config)
            .map_err(|e| TransportError::Protocol(format!("Session creation failed: {:?}", e)))?;

        let mut outbound = Vec::new();
        collect_responses(initial, &mut outbound, &mut |_| None)?;
        if !leftover.is_empty() {
            let results = session
                .handle_input(&leftover)
                .map_err(|e| TransportError::Protocol(format!("Session input error: {:?}", e)))?;
            collect_responses(results, &mut outbound, &mut |_| None)?;
        }

        debug!(app = %endpoint.app, "Requesting RTMP connection");
        let request = session
            .request_connection(endpoint.app.clone())
            .map_err(|e| TransportError::Protocol(format!("Connection request failed: {:?}", e)))?;
        collect_responses(vec![request], &mut outbound, &mut |_| None)?;

        guarded(
            &self.cancel,
            self.config.negotiation_timeout,
            host,
            await_event(&mut stream, &mut session, host, outbound, |event| match event {
                ClientSessionEvent::ConnectionRequestAccepted => Some(Ok(())),
                ClientSessionEvent::ConnectionRequestRejected { description } => {
                    Some(Err(TransportError::Rejected(description.clone())))
                }
                _ => None,
            }),
        )
        .await?;
        debug!("Connection accepted by server");

        debug!(stream_key = %endpoint.stream_key, "Requesting publish");
        let request = session
            .request_publishing(endpoint.stream_key.clone(), PublishRequestType::Live)
            .map_err(|e| TransportError::Protocol(format!("Publish request failed: {:?}", e)))?;
        let mut outbound = Vec::new();
        collect_responses(vec![request], &mut outbound, &mut |_| None)?;

        guarded(
            &self.cancel,
            self.config.negotiation_timeout,
            host,
            await_event(&mut stream, &mut session, host, outbound, |event| match event {
                ClientSessionEvent::PublishRequestAccepted => Some(Ok(())),
                ClientSessionEvent::UnhandleableOnStatusCode { code } if is_publish_refusal(code) => {
                    Some(Err(TransportError::Rejected(code.clone())))
                }
                _ => None,
            }),
        )
        .await?;

        self.link = Some(Link {
            stream,
            session: Some(session),
            host: host.to_string(),
        });
        self.state.transition(TransportState::Publishing)?;

        info!("RTMP connection established and publishing started");
        Ok(())
    }

    /// Queue and write one chunk.
    pub async fn send_chunk(&mut self, chunk: &MuxChunk) -> TransportResult<()> {
        self.send_chunks(std::slice::from_ref(chunk)).await
    }

    /// Queue and write the chunks of one frame.
    ///
    /// Either every chunk is queued or none is: if the frame does not fit
    /// under the high-water mark, [`TransportError::Backpressure`] is
    /// returned and nothing is queued. A frame larger than the mark is
    /// accepted when the buffer is empty. Bytes the socket does not take
    /// within the write budget stay queued for the next call.
    pub async fn send_chunks(&mut self, chunks: &[MuxChunk]) -> TransportResult<()> {
        if !self.state.current().is_publishing() || self.link.is_none() {
            return Err(TransportError::NotPublishing);
        }

        let result = self.queue_and_flush(chunks).await;
        self.settle(result)
    }

    /// Write as much of the outbound buffer as the write budget allows.
    pub async fn flush(&mut self) -> TransportResult<()> {
        if !self.state.current().is_publishing() || self.link.is_none() {
            return Err(TransportError::NotPublishing);
        }

        let result = self.flush_pending().await;
        self.settle(result)
    }

    async fn queue_and_flush(&mut self, chunks: &[MuxChunk]) -> TransportResult<()> {
        self.drain_inbound()?;

        let needed: usize = chunks.iter().map(MuxChunk::encoded_len).sum();
        if !self.outbound.is_empty() && self.outbound.len() + needed > self.config.high_water_mark {
            self.flush_pending().await?;
            if !self.outbound.is_empty()
                && self.outbound.len() + needed > self.config.high_water_mark
            {
                return Err(TransportError::Backpressure {
                    buffered: self.outbound.len(),
                });
            }
        }

        if self.outbound.is_empty() {
            self.last_progress = Instant::now();
        }
        for chunk in chunks {
            chunk.encode(&mut self.outbound);
        }

        self.flush_pending().await
    }

    /// Feed whatever the server sent (acks, pings, status) through the
    /// session without waiting. End of stream means the server hung up.
    fn drain_inbound(&mut self) -> TransportResult<()> {
        let Self { link, outbound, .. } = self;
        let Some(link) = link.as_mut() else {
            return Err(TransportError::NotPublishing);
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let polled = link.stream.read(&mut buf).now_or_never();
            match polled {
                None => return Ok(()),
                Some(Ok(0)) => {
                    return Err(TransportError::RemoteClosed {
                        host: link.host.clone(),
                    })
                }
                Some(Ok(n)) => {
                    let Some(session) = link.session.as_mut() else {
                        continue;
                    };
                    let results = session.handle_input(&buf[..n]).map_err(|e| {
                        TransportError::Protocol(format!("Session input error: {:?}", e))
                    })?;
                    for result in results {
                        match result {
                            ClientSessionResult::OutboundResponse(packet) => {
                                outbound.extend_from_slice(&packet.bytes)
                            }
                            ClientSessionResult::RaisedEvent(event) => {
                                trace!(?event, "Session event while publishing")
                            }
                            _ => {}
                        }
                    }
                }
                Some(Err(e)) => return Err(TransportError::from_io(e, &link.host)),
            }
        }
    }

    async fn flush_pending(&mut self) -> TransportResult<()> {
        let Self {
            config,
            cancel,
            link,
            outbound,
            last_progress,
            bytes_sent,
            ..
        } = self;
        let Some(link) = link.as_mut() else {
            return Err(TransportError::NotPublishing);
        };

        let deadline = Instant::now() + config.write_budget;
        while !outbound.is_empty() {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = tokio::time::timeout_at(deadline, link.stream.write(&outbound[..])) => result,
            };

            match written {
                Err(_elapsed) => break,
                Ok(Ok(0)) => {
                    return Err(TransportError::RemoteClosed {
                        host: link.host.clone(),
                    })
                }
                Ok(Ok(n)) => {
                    outbound.advance(n);
                    *last_progress = Instant::now();
                    bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                }
                Ok(Err(e)) => return Err(TransportError::from_io(e, &link.host)),
            }
        }

        if !outbound.is_empty() && last_progress.elapsed() > config.write_stall_timeout {
            return Err(TransportError::ConnectionTimeout {
                host: link.host.clone(),
            });
        }

        Ok(())
    }

    /// Tear the connection down and return to `Idle`.
    ///
    /// Pending bytes get one write budget to drain unless the transport was
    /// cancelled, in which case the socket is dropped immediately.
    #[instrument(name = "rtmp_close", skip(self))]
    pub async fn close(&mut self) {
        let current = self.state.current();
        if current == TransportState::Idle {
            return;
        }

        if current.is_publishing() && !self.cancel.is_cancelled() && !self.outbound.is_empty() {
            if let Err(e) = self.flush_pending().await {
                debug!(error = %e, "Final flush failed");
            }
        }

        if let Err(e) = self.state.transition(TransportState::Closing) {
            warn!(error = %e, "Unexpected state during close");
        }

        if let Some(mut link) = self.link.take() {
            if !self.cancel.is_cancelled() {
                let _ = tokio::time::timeout(self.config.write_budget, link.stream.shutdown()).await;
            }
        }
        self.outbound.clear();

        if let Err(e) = self.state.transition(TransportState::Idle) {
            warn!(error = %e, "Unexpected state during close");
        }
        info!(
            bytes_sent = self.bytes_sent.load(Ordering::Relaxed),
            "RTMP connection closed"
        );
    }
}

/// Run `fut` bounded by `limit` and the cancellation token.
async fn guarded<F, T>(
    cancel: &CancellationToken,
    limit: Duration,
    host: &str,
    fut: F,
) -> TransportResult<T>
where
    F: Future<Output = TransportResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::ConnectionTimeout { host: host.to_string() }),
        },
    }
}

/// Any publish status other than a start means the server refused the stream
/// (`NetStream.Publish.BadName`, `NetStream.Publish.Denied`, ...).
fn is_publish_refusal(code: &str) -> bool {
    code.starts_with("NetStream.Publish.") && !code.ends_with(".Start")
}

/// Resolve and connect, trying each resolved address in turn.
async fn open_socket(endpoint: &RtmpEndpoint) -> TransportResult<TcpStream> {
    let host = endpoint.host.as_str();
    let addrs: Vec<_> = lookup_host((host, endpoint.port))
        .await
        .map_err(|_| TransportError::HostNotFound {
            host: host.to_string(),
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| TransportError::from_io(e, host))?;
                debug!(%addr, "TCP connection established");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "TCP connect failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => TransportError::from_io(e, host),
        None => TransportError::HostNotFound {
            host: host.to_string(),
        },
    })
}

/// Run the client side of the handshake. Returns bytes received past its
/// end.
async fn perform_handshake<S>(stream: &mut S, host: &str) -> TransportResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(PeerType::Client);
    let p0_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| TransportError::Protocol(format!("Handshake generation failed: {:?}", e)))?;
    stream
        .write_all(&p0_p1)
        .await
        .map_err(|e| TransportError::from_io(e, host))?;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::from_io(e, host))?;
        if n == 0 {
            return Err(TransportError::RemoteClosed {
                host: host.to_string(),
            });
        }

        let result = handshake
            .process_bytes(&buf[..n])
            .map_err(|e| TransportError::Protocol(format!("Handshake failed: {:?}", e)))?;
        match result {
            HandshakeProcessResult::InProgress { response_bytes } => {
                if !response_bytes.is_empty() {
                    stream
                        .write_all(&response_bytes)
                        .await
                        .map_err(|e| TransportError::from_io(e, host))?;
                }
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                if !response_bytes.is_empty() {
                    stream
                        .write_all(&response_bytes)
                        .await
                        .map_err(|e| TransportError::from_io(e, host))?;
                }
                return Ok(remaining_bytes);
            }
        }
    }
}

/// Append outbound packets to `outbound` and run events through `matcher`.
/// Returns the first verdict the matcher gives.
fn collect_responses(
    results: Vec<ClientSessionResult>,
    outbound: &mut Vec<u8>,
    matcher: &mut dyn FnMut(&ClientSessionEvent) -> Option<TransportResult<()>>,
) -> TransportResult<Option<TransportResult<()>>> {
    let mut verdict = None;
    for result in results {
        match result {
            ClientSessionResult::OutboundResponse(packet) => {
                outbound.extend_from_slice(&packet.bytes);
            }
            ClientSessionResult::RaisedEvent(event) => {
                if verdict.is_none() {
                    verdict = matcher(&event);
                }
                if verdict.is_none() {
                    trace!(?event, "Received event");
                }
            }
            _ => {}
        }
    }
    Ok(verdict)
}

/// Write `pending`, then read until `matcher` accepts or rejects an event.
async fn await_event<S, M>(
    stream: &mut S,
    session: &mut ClientSession,
    host: &str,
    mut pending: Vec<u8>,
    mut matcher: M,
) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: FnMut(&ClientSessionEvent) -> Option<TransportResult<()>>,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        if !pending.is_empty() {
            stream
                .write_all(&pending)
                .await
                .map_err(|e| TransportError::from_io(e, host))?;
            pending.clear();
        }

        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::from_io(e, host))?;
        if n == 0 {
            return Err(TransportError::RemoteClosed {
                host: host.to_string(),
            });
        }

        let results = session
            .handle_input(&buf[..n])
            .map_err(|e| TransportError::Protocol(format!("Session input error: {:?}", e)))?;
        if let Some(verdict) = collect_responses(results, &mut pending, &mut matcher)? {
            if !pending.is_empty() {
                stream
                    .write_all(&pending)
                    .await
                    .map_err(|e| TransportError::from_io(e, host))?;
            }
            return verdict;
        }
    }
}
