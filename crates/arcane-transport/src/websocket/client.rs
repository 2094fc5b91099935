//! Envelope channel over a client-dialed (tungstenite) WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arcane_core::{AGENT_TOKEN_HEADER, TunnelChannel, TunnelError, TunnelMessage, TunnelResult};

use super::DEFAULT_WRITE_DEADLINE;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The agent's side of a WebSocket tunnel dialed out to the manager.
pub struct ClientWsChannel {
    sink: Mutex<SplitSink<WsStream, Message>>,
    source: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    write_deadline: Duration,
}

/// Dials `url` (`ws://` or `wss://`) presenting `token` in the agent auth
/// header.
pub async fn connect_agent_ws(url: &str, token: &str) -> TunnelResult<ClientWsChannel> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TunnelError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let value = token
        .parse()
        .map_err(|_| TunnelError::ConnectionFailed {
            url: url.to_string(),
            reason: "agent token is not a valid header value".to_string(),
        })?;
    request.headers_mut().insert(AGENT_TOKEN_HEADER, value);

    let (stream, _response) =
        connect_async(request)
            .await
            .map_err(|e| TunnelError::ConnectionFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
    Ok(ClientWsChannel::new(stream))
}

impl ClientWsChannel {
    pub fn new(stream: WsStream) -> Self {
        let (sink, source) = stream.split();
        Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            write_deadline: DEFAULT_WRITE_DEADLINE,
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    async fn next_frame(&self) -> TunnelResult<TunnelMessage> {
        let mut source = self.source.lock().await;
        loop {
            let frame = match source.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    self.mark_closed();
                    return Err(classify_receive_error(err));
                }
                None => {
                    self.mark_closed();
                    return Err(TunnelError::Closed);
                }
            };
            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| TunnelError::Codec(e.to_string()));
                }
                Message::Binary(_) => {
                    warn!("ignoring binary frame on tunnel websocket");
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(frame) => {
                    self.mark_closed();
                    return Err(classify_close(frame));
                }
            }
        }
    }
}

#[async_trait]
impl TunnelChannel for ClientWsChannel {
    async fn send(&self, message: &TunnelMessage) -> TunnelResult<()> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let text = serde_json::to_string(message).map_err(|e| TunnelError::Codec(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.write_deadline, sink.send(Message::Text(text.into()))).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.mark_closed();
                Err(TunnelError::SendFailed(err.to_string()))
            }
            Err(_) => {
                self.mark_closed();
                Err(TunnelError::SendFailed("write deadline exceeded".into()))
            }
        }
    }

    async fn receive(&self) -> TunnelResult<TunnelMessage> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TunnelError::Closed),
            frame = self.next_frame() => frame,
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "tunnel closed".into(),
        };
        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "close frame not delivered");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn classify_receive_error(err: WsError) -> TunnelError {
    match &err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TunnelError::Closed,
        WsError::Io(io) if arcane_core::is_expected_teardown_message(&io.to_string()) => {
            TunnelError::Closed
        }
        _ => {
            let message = err.to_string();
            if arcane_core::is_expected_teardown_message(&message) {
                TunnelError::Closed
            } else {
                TunnelError::ReceiveFailed(message)
            }
        }
    }
}

/// Close codes {normal, going-away, no-status} are ordinary teardown.
fn classify_close(frame: Option<CloseFrame>) -> TunnelError {
    match frame {
        None => TunnelError::Closed,
        Some(frame)
            if matches!(
                frame.code,
                CloseCode::Normal | CloseCode::Away | CloseCode::Status
            ) =>
        {
            TunnelError::Closed
        }
        Some(frame) => {
            TunnelError::ReceiveFailed(format!("close code {}: {}", frame.code, frame.reason))
        }
    }
}
