//! Response recorder the agent writes tunneled request results into.
//!
//! Mirrors an HTTP response writer: headers are buffered until the first
//! body write (or an explicit [`ResponseRecorder::write_header`]), then a
//! `response` envelope is flushed. In streaming mode every subsequent
//! write emits a `stream-data` envelope and `close` emits the terminal
//! `stream-end`; in buffered mode the whole body travels in the single
//! `response` envelope sent at close.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use arcane_core::{
    Headers, TUNNEL_STREAM_HEADER, TunnelChannel, TunnelError, TunnelMessage, TunnelPayload,
    TunnelResult,
};

/// How the recorder ships the body back over the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// One `response` envelope carrying the complete body. Used on the
    /// WebSocket transport.
    Buffered,
    /// `response` header frame (tagged with the internal streaming
    /// marker), then `stream-data` frames, then `stream-end`. Used on the
    /// RPC transport so bodies can be forwarded incrementally.
    Streaming,
}

struct RecorderState {
    status: u16,
    headers: Headers,
    header_sent: bool,
    buffer: Vec<u8>,
    closed: bool,
}

/// Serialized writer for one tunneled request's response.
pub struct ResponseRecorder {
    channel: Arc<dyn TunnelChannel>,
    request_id: String,
    mode: ResponseMode,
    state: Mutex<RecorderState>,
}

impl ResponseRecorder {
    pub fn new(channel: Arc<dyn TunnelChannel>, request_id: impl Into<String>, mode: ResponseMode) -> Self {
        Self {
            channel,
            request_id: request_id.into(),
            mode,
            state: Mutex::new(RecorderState {
                status: 200,
                headers: Headers::new(),
                header_sent: false,
                buffer: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Sets the status code. Ignored once the header frame has gone out.
    pub async fn set_status(&self, status: u16) {
        let mut state = self.state.lock().await;
        if state.header_sent {
            debug!(request_id = %self.request_id, "status set after header flush, ignored");
            return;
        }
        state.status = status;
    }

    /// Adds a response header. Ignored once the header frame has gone out.
    pub async fn insert_header(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut state = self.state.lock().await;
        if state.header_sent {
            debug!(request_id = %self.request_id, "header set after header flush, ignored");
            return;
        }
        state.headers.insert(name.into().to_ascii_lowercase(), value.into());
    }

    /// Flushes the header frame explicitly. In buffered mode this only
    /// freezes status and headers.
    pub async fn write_header(&self) -> TunnelResult<()> {
        let mut state = self.state.lock().await;
        self.flush_header(&mut state).await
    }

    /// Appends body bytes, flushing the header frame first if needed.
    pub async fn write(&self, chunk: &[u8]) -> TunnelResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TunnelError::Closed);
        }
        self.flush_header(&mut state).await?;
        match self.mode {
            ResponseMode::Buffered => {
                state.buffer.extend_from_slice(chunk);
                Ok(())
            }
            ResponseMode::Streaming => {
                self.channel
                    .send(&TunnelMessage::reply(
                        self.request_id.clone(),
                        TunnelPayload::StreamData {
                            body: chunk.to_vec(),
                        },
                    ))
                    .await
            }
        }
    }

    /// Terminates the response. Idempotent: the terminal frame is sent at
    /// most once.
    pub async fn close(&self) -> TunnelResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        match self.mode {
            ResponseMode::Buffered => {
                let body = std::mem::take(&mut state.buffer);
                state.header_sent = true;
                self.channel
                    .send(&TunnelMessage::reply(
                        self.request_id.clone(),
                        TunnelPayload::Response {
                            status: state.status,
                            headers: state.headers.clone(),
                            body,
                        },
                    ))
                    .await
            }
            ResponseMode::Streaming => {
                self.flush_header(&mut state).await?;
                self.channel
                    .send(&TunnelMessage::reply(
                        self.request_id.clone(),
                        TunnelPayload::StreamEnd,
                    ))
                    .await
            }
        }
    }

    async fn flush_header(&self, state: &mut RecorderState) -> TunnelResult<()> {
        if state.header_sent {
            return Ok(());
        }
        state.header_sent = true;
        if self.mode == ResponseMode::Buffered {
            // The header travels with the final response envelope.
            return Ok(());
        }
        let mut headers = state.headers.clone();
        headers.insert(TUNNEL_STREAM_HEADER.to_string(), "1".to_string());
        self.channel
            .send(&TunnelMessage::reply(
                self.request_id.clone(),
                TunnelPayload::Response {
                    status: state.status,
                    headers,
                    body: Vec::new(),
                },
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChannel;

    #[tokio::test]
    async fn streaming_emits_header_chunks_and_terminal() {
        let channel = MockChannel::new();
        let recorder = ResponseRecorder::new(channel.clone(), "req-9", ResponseMode::Streaming);
        recorder.set_status(201).await;
        recorder.insert_header("Content-Type", "application/json").await;
        recorder.write(b"{\"a\"").await.unwrap();
        recorder.write(b":1}").await.unwrap();
        recorder.close().await.unwrap();

        assert_eq!(
            channel.sent_kinds(),
            vec!["response", "stream-data", "stream-data", "stream-end"]
        );
        let sent = channel.sent.lock();
        assert!(sent.iter().all(|m| m.id == "req-9"));
        match &sent[0].payload {
            TunnelPayload::Response { status, headers, body } => {
                assert_eq!(*status, 201);
                assert_eq!(headers.get(TUNNEL_STREAM_HEADER).map(String::as_str), Some("1"));
                assert_eq!(headers.get("content-type").map(String::as_str), Some("application/json"));
                assert!(body.is_empty());
            }
            other => panic!("expected response, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let channel = MockChannel::new();
        let recorder = ResponseRecorder::new(channel.clone(), "req-9", ResponseMode::Streaming);
        recorder.write(b"x").await.unwrap();
        recorder.close().await.unwrap();
        recorder.close().await.unwrap();
        assert_eq!(
            channel.sent_kinds(),
            vec!["response", "stream-data", "stream-end"]
        );
    }

    #[tokio::test]
    async fn buffered_mode_sends_one_complete_response() {
        let channel = MockChannel::new();
        let recorder = ResponseRecorder::new(channel.clone(), "req-3", ResponseMode::Buffered);
        recorder.set_status(404).await;
        recorder.write(b"not ").await.unwrap();
        recorder.write(b"found").await.unwrap();
        recorder.close().await.unwrap();

        assert_eq!(channel.sent_kinds(), vec!["response"]);
        match &channel.last_sent().unwrap().payload {
            TunnelPayload::Response { status, headers, body } => {
                assert_eq!(*status, 404);
                assert_eq!(body, b"not found");
                assert!(!headers.contains_key(TUNNEL_STREAM_HEADER));
            }
            other => panic!("expected response, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let channel = MockChannel::new();
        let recorder = ResponseRecorder::new(channel, "req-1", ResponseMode::Streaming);
        recorder.close().await.unwrap();
        assert!(matches!(
            recorder.write(b"late").await,
            Err(TunnelError::Closed)
        ));
    }

    #[tokio::test]
    async fn empty_streaming_response_still_sends_header_and_end() {
        let channel = MockChannel::new();
        let recorder = ResponseRecorder::new(channel.clone(), "req-5", ResponseMode::Streaming);
        recorder.set_status(204).await;
        recorder.close().await.unwrap();
        assert_eq!(channel.sent_kinds(), vec!["response", "stream-end"]);
    }
}
