//! Agent side of the tunnel: dials the manager, serves forwarded requests
//! against the local handler, and bridges proxied WebSockets.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arcane_core::{
    AGENT_TOKEN_HEADER, API_KEY_HEADER, Headers, TunnelChannel, TunnelMessage, TunnelPayload,
    TunnelResult, WsFrameKind, without_ws_handshake,
};
use arcane_transport::{connect_agent_ws, connect_rpc, register_agent};

use crate::events;
use crate::recorder::{ResponseMode, ResponseRecorder};
use crate::tunnel::TunnelHttpRequest;

/// Sleep between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Interval between heartbeats; a failed send closes the tunnel so the
/// reconnect loop takes over.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-stream queue of frames headed for the local socket.
const WS_STREAM_QUEUE: usize = 64;

/// Which wire the agent dials, or both in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Rpc,
    Websocket,
    /// Try RPC first, fall back to WebSocket on connection failure.
    Auto,
}

/// Connection settings for the agent tunnel client.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Manager WebSocket endpoint, e.g. `wss://manager/api/environments/local/tunnel/connect`.
    pub manager_ws_url: String,
    /// Manager RPC listener, `host:port`.
    pub manager_rpc_addr: String,
    /// Agent token presented at registration.
    pub token: String,
    pub transport: TransportMode,
    /// The agent's own HTTP listen address; wildcard hosts map to
    /// localhost when dialing proxied WebSockets.
    pub local_listen_addr: String,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}

/// Executes tunneled requests against the node's own HTTP surface.
///
/// The runtime injects an implementation backed by its router; the agent
/// never constructs HTTP plumbing of its own for forwarded calls.
#[async_trait::async_trait]
pub trait LocalHandler: Send + Sync {
    async fn execute(&self, request: TunnelHttpRequest, recorder: &ResponseRecorder);
}

struct WsStreamHandle {
    frames: mpsc::Sender<(WsFrameKind, Vec<u8>)>,
    cancel: CancellationToken,
}

/// Maintains one tunnel to the manager, reconnecting forever until
/// cancelled.
pub struct AgentTunnelClient {
    config: AgentConfig,
    handler: Arc<dyn LocalHandler>,
    streams: DashMap<String, WsStreamHandle>,
}

impl AgentTunnelClient {
    pub fn new(config: AgentConfig, handler: Arc<dyn LocalHandler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            streams: DashMap::new(),
        })
    }

    /// Runs the connect/serve/reconnect loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.connect().await {
                Ok((channel, mode)) => {
                    info!(mode = ?mode, "tunnel connected to manager");
                    events::set_active_tunnel(Arc::clone(&channel));
                    self.serve(Arc::clone(&channel), mode, &cancel).await;
                    events::clear_active_tunnel();
                    channel.close().await;
                    self.abort_streams();
                    info!("tunnel disconnected");
                }
                Err(err) => {
                    warn!(error = %err, "tunnel connect failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        self.abort_streams();
    }

    async fn connect(&self) -> TunnelResult<(Arc<dyn TunnelChannel>, ResponseMode)> {
        match self.config.transport {
            TransportMode::Rpc => self.connect_rpc().await,
            TransportMode::Websocket => self.connect_ws().await,
            TransportMode::Auto => match self.connect_rpc().await {
                Ok(connected) => Ok(connected),
                Err(err) => {
                    warn!(error = %err, "rpc transport unavailable, falling back to websocket");
                    self.connect_ws().await
                }
            },
        }
    }

    async fn connect_rpc(&self) -> TunnelResult<(Arc<dyn TunnelChannel>, ResponseMode)> {
        let channel = connect_rpc(&self.config.manager_rpc_addr).await?;
        let environment_id = register_agent(&channel, &self.config.token).await?;
        debug!(environment_id = %environment_id, "registered over rpc");
        Ok((Arc::new(channel), ResponseMode::Streaming))
    }

    async fn connect_ws(&self) -> TunnelResult<(Arc<dyn TunnelChannel>, ResponseMode)> {
        let channel = connect_agent_ws(&self.config.manager_ws_url, &self.config.token).await?;
        Ok((Arc::new(channel), ResponseMode::Buffered))
    }

    async fn serve(
        self: &Arc<Self>,
        channel: Arc<dyn TunnelChannel>,
        mode: ResponseMode,
        cancel: &CancellationToken,
    ) {
        let heartbeat = {
            let channel = Arc::clone(&channel);
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = channel.send(&TunnelMessage::heartbeat()).await {
                        debug!(error = %err, "heartbeat failed, closing tunnel");
                        channel.close().await;
                        break;
                    }
                }
            })
        };

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                received = channel.receive() => match received {
                    Ok(message) => message,
                    Err(err) => {
                        if channel.is_expected_receive_error(&err) {
                            debug!("tunnel receive loop ended");
                        } else {
                            warn!(error = %err, "tunnel receive failed");
                        }
                        break;
                    }
                },
            };
            self.dispatch(&channel, mode, message).await;
        }

        heartbeat.abort();
    }

    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        channel: &Arc<dyn TunnelChannel>,
        mode: ResponseMode,
        message: TunnelMessage,
    ) {
        let id = message.id;
        match message.payload {
            TunnelPayload::Request {
                method,
                path,
                query,
                headers,
                body,
            } => {
                let request = TunnelHttpRequest {
                    method,
                    path,
                    query,
                    headers,
                    body,
                };
                let handler = Arc::clone(&self.handler);
                let recorder = ResponseRecorder::new(Arc::clone(channel), id, mode);
                tokio::spawn(async move {
                    handler.execute(request, &recorder).await;
                    if let Err(err) = recorder.close().await {
                        debug!(error = %err, "response close not delivered");
                    }
                });
            }
            TunnelPayload::WsStart {
                path,
                query,
                headers,
            } => {
                let client = Arc::clone(self);
                let channel = Arc::clone(channel);
                tokio::spawn(async move {
                    client.bridge_local_ws(channel, id, path, query, headers).await;
                });
            }
            TunnelPayload::WsData { kind, payload } => {
                if let Some(stream) = self.streams.get(&id) {
                    if stream.frames.try_send((kind, payload)).is_err() {
                        debug!(stream_id = %id, "ws frame dropped on backpressure");
                    }
                } else {
                    debug!(stream_id = %id, "ws frame for unknown stream");
                }
            }
            TunnelPayload::WsClose => {
                if let Some((_, stream)) = self.streams.remove(&id) {
                    stream.cancel.cancel();
                }
            }
            TunnelPayload::HeartbeatAck => {}
            TunnelPayload::RegisterResponse { .. } => {}
            other => {
                warn!(kind = other.kind(), "unexpected envelope on agent tunnel, dropping");
            }
        }
    }

    /// Dials the node's own WebSocket endpoint for a tunneled `ws-start`
    /// and pumps frames in both directions until either side closes.
    async fn bridge_local_ws(
        self: Arc<Self>,
        channel: Arc<dyn TunnelChannel>,
        stream_id: String,
        path: String,
        query: String,
        headers: Headers,
    ) {
        let authority = local_ws_authority(&self.config.local_listen_addr);
        let url = if query.is_empty() {
            format!("ws://{authority}{path}")
        } else {
            format!("ws://{authority}{path}?{query}")
        };

        let mut request = match url.clone().into_client_request() {
            Ok(request) => request,
            Err(err) => {
                warn!(url = %url, error = %err, "invalid local websocket url");
                let _ = channel
                    .send(&TunnelMessage::reply(stream_id, TunnelPayload::WsClose))
                    .await;
                return;
            }
        };
        // Local handshake headers replace the remote ones; the agent's own
        // auth is injected so the local auth layer accepts the dial.
        let mut forwarded = without_ws_handshake(&headers);
        forwarded.insert(AGENT_TOKEN_HEADER.to_string(), self.config.token.clone());
        forwarded.insert(API_KEY_HEADER.to_string(), self.config.token.clone());
        for (name, value) in &forwarded {
            let Ok(name) = name.parse::<tokio_tungstenite::tungstenite::http::HeaderName>() else {
                continue;
            };
            let Ok(value) = value.parse() else { continue };
            request.headers_mut().insert(name, value);
        }

        let socket = match connect_async(request).await {
            Ok((socket, _)) => socket,
            Err(err) => {
                warn!(url = %url, error = %err, "local websocket dial failed");
                let _ = channel
                    .send(&TunnelMessage::reply(stream_id, TunnelPayload::WsClose))
                    .await;
                return;
            }
        };
        debug!(stream_id = %stream_id, url = %url, "local websocket bridged");

        let (frames_tx, mut frames_rx) = mpsc::channel::<(WsFrameKind, Vec<u8>)>(WS_STREAM_QUEUE);
        let cancel = CancellationToken::new();
        self.streams.insert(
            stream_id.clone(),
            WsStreamHandle {
                frames: frames_tx,
                cancel: cancel.clone(),
            },
        );

        let (mut sink, mut source) = socket.split();

        // Tunnel -> local socket.
        let writer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = frames_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    let message = match frame {
                        (WsFrameKind::Text, payload) => {
                            match String::from_utf8(payload) {
                                Ok(text) => WsMessage::Text(text.into()),
                                Err(_) => {
                                    debug!("dropping non-utf8 text frame");
                                    continue;
                                }
                            }
                        }
                        (WsFrameKind::Binary, payload) => WsMessage::Binary(payload.into()),
                    };
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                cancel.cancel();
                let _ = sink.close().await;
            })
        };

        // Local socket -> tunnel. This side owns teardown.
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = source.next() => frame,
            };
            let (kind, payload) = match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    (WsFrameKind::Text, text.as_bytes().to_vec())
                }
                Some(Ok(WsMessage::Binary(payload))) => (WsFrameKind::Binary, payload.to_vec()),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(stream_id = %stream_id, error = %err, "local websocket read failed");
                    break;
                }
            };
            let envelope =
                TunnelMessage::reply(stream_id.clone(), TunnelPayload::WsData { kind, payload });
            if channel.send(&envelope).await.is_err() {
                break;
            }
        }

        cancel.cancel();
        writer.abort();
        self.streams.remove(&stream_id);
        let _ = channel
            .send(&TunnelMessage::reply(stream_id, TunnelPayload::WsClose))
            .await;
    }

    fn abort_streams(&self) {
        self.streams.retain(|_, stream| {
            stream.cancel.cancel();
            false
        });
    }

    /// Number of live proxied WebSocket streams.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}

/// Maps the agent's listen address to a dialable local authority;
/// wildcard hosts become `localhost`.
fn local_ws_authority(addr: &str) -> String {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (addr, None),
    };
    let host = match host {
        "" | "0.0.0.0" | "::" | "[::]" => "localhost",
        other => other,
    };
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
