//! Reader/writer pair tying one WebSocket subscriber to a hub.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use tracing::{debug, trace};

use arcane_core::StreamResult;

use crate::hub::{Frame, Hub};

/// Deadline for each socket write; a stuck peer is disconnected.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

impl Frame {
    fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(payload) => Message::Binary(payload.into()),
            Frame::Ping => Message::Ping(Vec::new().into()),
        }
    }
}

/// Registers `socket` on `hub` and pumps frames until the client leaves.
///
/// The writer drains the client's bounded queue onto the socket under a
/// write deadline; queue close (eviction or hub teardown) makes it send a
/// close frame and exit. The reader exists only to detect disconnects:
/// any read error or close unregisters the client. Returns once both
/// halves are done, leaving no worker behind.
pub async fn serve_subscriber(socket: WebSocket, hub: Arc<Hub>) -> StreamResult<()> {
    let client = hub.register().await?;
    let client_id = client.id;
    let (mut sink, mut source) = socket.split();

    let writer = tokio::spawn(async move {
        let mut frames = client.frames;
        while let Some(frame) = frames.recv().await {
            let send = sink.send(frame.into_message());
            match tokio::time::timeout(WRITE_DEADLINE, send).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    trace!(client_id, error = %err, "subscriber write failed");
                    return;
                }
                Err(_) => {
                    debug!(client_id, "subscriber write deadline exceeded");
                    return;
                }
            }
        }
        // Queue closed: the hub evicted us or shut down. Say goodbye.
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "stream ended".into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    });

    // Reads only detect disconnects; inbound payloads are not part of the
    // fan-out contract.
    while let Some(received) = source.next().await {
        match received {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                trace!(client_id, error = %err, "subscriber read failed");
                break;
            }
        }
    }

    hub.unregister(client_id);
    let _ = writer.await;
    Ok(())
}
