//! Interactive terminal bridge: one WebSocket, one exec session.

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use tracing::{debug, trace};

use crate::source::ExecSession;

/// Pipes the session's output to the socket as binary frames and the
/// socket's text/binary frames to stdin, until either side ends. Closing
/// the socket drops stdin, which ends the process's input.
pub async fn serve_exec(socket: WebSocket, session: ExecSession) {
    let ExecSession { stdin, mut output } = session;
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            chunk = output.recv() => {
                let Some(chunk) = chunk else {
                    // Process ended; complete the close handshake.
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "session ended".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                };
                if sink.send(Message::Binary(chunk.into())).await.is_err() {
                    break;
                }
            }
            inbound = source.next() => {
                let payload = match inbound {
                    Some(Ok(Message::Binary(payload))) => payload.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        trace!(error = %err, "terminal socket read failed");
                        break;
                    }
                };
                if stdin.send(payload).await.is_err() {
                    debug!("exec stdin closed");
                    break;
                }
            }
        }
    }
}
