//! Manager-side representation of one connected agent tunnel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use uuid::Uuid;

use arcane_core::{
    Delivery, Headers, PendingRequests, TUNNEL_STREAM_HEADER, TunnelChannel, TunnelError,
    TunnelMessage, TunnelPayload, TunnelResult,
};

/// Safety cap applied when a caller supplies no deadline of its own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded wait applied when delivering streaming frame types to a slow
/// consumer before the frame is dropped.
pub const STREAM_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Response-buffer capacity per pending request, in frames.
const PENDING_FRAME_CAPACITY: usize = 64;

/// An HTTP request to forward over a tunnel.
#[derive(Debug, Clone)]
pub struct TunnelHttpRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// A complete HTTP response accumulated from tunnel frames.
#[derive(Debug, Clone)]
pub struct TunnelHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// One live agent tunnel: the channel, its pending-request table, and the
/// heartbeat bookkeeping the registry sweeps on.
///
/// Created by the transport accept path, owned by the registry entry,
/// destroyed on close or registry eviction.
pub struct AgentTunnel {
    environment_id: String,
    channel: Arc<dyn TunnelChannel>,
    pending: PendingRequests,
    connected_at: Instant,
    last_heartbeat: parking_lot::Mutex<Instant>,
}

impl AgentTunnel {
    pub fn new(environment_id: impl Into<String>, channel: Arc<dyn TunnelChannel>) -> Self {
        let now = Instant::now();
        Self {
            environment_id: environment_id.into(),
            channel,
            pending: PendingRequests::new(),
            connected_at: now,
            last_heartbeat: parking_lot::Mutex::new(now),
        }
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// The underlying duplex channel.
    pub fn channel(&self) -> &Arc<dyn TunnelChannel> {
        &self.channel
    }

    /// Closes the tunnel. Pending waiters resolve through their own
    /// deadlines; new sends fail with [`TunnelError::Closed`].
    pub async fn close(&self) {
        self.channel.close().await;
    }

    /// Records a heartbeat from the agent.
    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Time since the last heartbeat, used by the stale sweep.
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Number of in-flight requests on this tunnel.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Delivers a complete `response` envelope to its waiter without
    /// blocking the receive loop.
    pub fn deliver_response(&self, message: TunnelMessage) -> Delivery {
        self.pending.deliver(message)
    }

    /// Delivers a streaming frame (`stream-data`, `stream-end`, `ws-data`,
    /// `ws-close`) with a bounded wait for slow consumers.
    pub async fn deliver_stream_frame(&self, message: TunnelMessage) -> Delivery {
        self.pending
            .deliver_within(message, STREAM_DELIVERY_TIMEOUT)
            .await
    }

    /// Registers a fresh stream id and returns its frame receiver. Used by
    /// the proxy's WebSocket path; the caller must `finish_stream` when
    /// done.
    pub fn open_stream(&self) -> (String, tokio::sync::mpsc::Receiver<TunnelMessage>) {
        let id = Uuid::new_v4().to_string();
        let rx = self.pending.insert(&id, PENDING_FRAME_CAPACITY);
        (id, rx)
    }

    /// Drops the pending entry for a stream opened with `open_stream`.
    pub fn finish_stream(&self, id: &str) {
        self.pending.remove(id);
    }

    /// Sends a raw envelope on the tunnel.
    pub async fn send(&self, message: &TunnelMessage) -> TunnelResult<()> {
        self.channel.send(message).await
    }

    /// Forwards one HTTP request and accumulates its response.
    ///
    /// The pending entry is registered before the send so no frame can
    /// race past the waiter. A `response` envelope carrying the internal
    /// streaming marker is followed by `stream-data` frames until
    /// `stream-end`; HEAD, 204, and 304 terminate on the header frame
    /// alone. The marker header is stripped before the response is
    /// exposed.
    pub async fn send_request(
        &self,
        request: TunnelHttpRequest,
        timeout: Option<Duration>,
    ) -> TunnelResult<TunnelHttpResponse> {
        let id = Uuid::new_v4().to_string();
        let mut rx = self.pending.insert(&id, PENDING_FRAME_CAPACITY);

        let head = request.method.eq_ignore_ascii_case("HEAD");
        let envelope = TunnelMessage::reply(
            id.clone(),
            TunnelPayload::Request {
                method: request.method,
                path: request.path,
                query: request.query,
                headers: request.headers,
                body: request.body,
            },
        );
        if let Err(err) = self.channel.send(&envelope).await {
            self.pending.remove(&id);
            return Err(err);
        }
        trace!(request_id = %id, environment_id = %self.environment_id, "tunnel request sent");

        let deadline = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let result = tokio::time::timeout(deadline, async {
            let first = rx.recv().await.ok_or(TunnelError::Closed)?;
            let (status, mut headers, mut body) = match first.payload {
                TunnelPayload::Response {
                    status,
                    headers,
                    body,
                } => (status, headers, body),
                other => {
                    return Err(TunnelError::Codec(format!(
                        "expected response frame, got {}",
                        other.kind()
                    )));
                }
            };

            let streaming = headers.remove(TUNNEL_STREAM_HEADER).is_some();
            let body_less = head || status == 204 || status == 304;
            if streaming && !body_less {
                loop {
                    let frame = rx.recv().await.ok_or(TunnelError::Closed)?;
                    match frame.payload {
                        TunnelPayload::StreamData { body: chunk } => {
                            body.extend_from_slice(&chunk);
                        }
                        TunnelPayload::StreamEnd => break,
                        other => {
                            debug!(
                                request_id = %frame.id,
                                kind = other.kind(),
                                "unexpected frame in response stream"
                            );
                        }
                    }
                }
            }

            Ok(TunnelHttpResponse {
                status,
                headers,
                body,
            })
        })
        .await;

        self.pending.remove(&id);
        match result {
            Ok(response) => response,
            Err(_) => Err(TunnelError::Timeout),
        }
    }
}
