//! Envelope channel over a server-accepted (axum) WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arcane_core::{TunnelChannel, TunnelError, TunnelMessage, TunnelResult};

use super::DEFAULT_WRITE_DEADLINE;

/// One agent tunnel accepted at the manager's `tunnel/connect` endpoint.
///
/// Sends are serialized under the sink mutex; receives have a single
/// reader. `close` is idempotent and unblocks a pending `receive`.
pub struct ServerWsChannel {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    source: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    write_deadline: Duration,
}

impl ServerWsChannel {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, source) = socket.split();
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
                    let message = err.to_string();
                    if arcane_core::is_expected_teardown_message(&message) {
                        return Err(TunnelError::Closed);
                    }
                    return Err(TunnelError::ReceiveFailed(message));
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
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    self.mark_closed();
                    return Err(classify_close(frame));
                }
            }
        }
    }
}

#[async_trait]
impl TunnelChannel for ServerWsChannel {
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
            code: close_code::NORMAL,
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

/// Close codes {normal, going-away, no-status} are ordinary teardown.
fn classify_close(frame: Option<CloseFrame>) -> TunnelError {
    match frame {
        None => TunnelError::Closed,
        Some(frame)
            if matches!(
                frame.code,
                close_code::NORMAL | close_code::AWAY | close_code::STATUS
            ) =>
        {
            TunnelError::Closed
        }
        Some(frame) => {
            TunnelError::ReceiveFailed(format!("close code {}: {}", frame.code, frame.reason))
        }
    }
}
