//! Envelope channel over a length-prefixed binary stream.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use arcane_core::{TunnelChannel, TunnelError, TunnelMessage, TunnelResult};

/// Largest envelope accepted on the wire. Request and response bodies are
/// buffered upstream, so a frame is bounded by the proxy's body cap.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

/// One duplex RPC stream carrying bincode-encoded envelopes.
///
/// `close` cancels the private token, which unblocks an in-flight
/// `receive` on either side of the connection.
pub struct FramedChannel<S> {
    sink: Mutex<SplitSink<FramedStream<S>, Bytes>>,
    source: Mutex<SplitStream<FramedStream<S>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        let (sink, source) = Framed::new(stream, codec).split();
        Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    async fn next_frame(&self) -> TunnelResult<TunnelMessage> {
        let mut source = self.source.lock().await;
        match source.next().await {
            Some(Ok(frame)) => {
                bincode::deserialize(&frame).map_err(|e| TunnelError::Codec(e.to_string()))
            }
            Some(Err(err)) => {
                self.mark_closed();
                let message = err.to_string();
                if arcane_core::is_expected_teardown_message(&message) {
                    Err(TunnelError::Closed)
                } else {
                    Err(TunnelError::ReceiveFailed(message))
                }
            }
            None => {
                self.mark_closed();
                Err(TunnelError::Closed)
            }
        }
    }
}

#[async_trait]
impl<S> TunnelChannel for FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&self, message: &TunnelMessage) -> TunnelResult<()> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let encoded = bincode::serialize(message).map_err(|e| TunnelError::Codec(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        sink.send(Bytes::from(encoded)).await.map_err(|err| {
            self.mark_closed();
            TunnelError::SendFailed(err.to_string())
        })
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
        if let Err(err) = sink.close().await {
            debug!(error = %err, "rpc stream close failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
