//! Log delivery pipeline: raw text passthrough, per-message JSON, or
//! debounced JSON batches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::hub::{Frame, Hub};
use crate::logs::{LogMessage, LogNormalizer};

/// Output encoding for a log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Per-stream delivery options parsed from the subscriber's query.
#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    pub format: LogFormat,
    pub batched: bool,
    /// Flush when a batch reaches this many entries.
    pub max_batch: usize,
    /// Flush a non-empty batch after this long without reaching
    /// `max_batch`.
    pub debounce: Duration,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            batched: false,
            max_batch: 50,
            debounce: Duration::from_millis(400),
        }
    }
}

/// Spawns the pipeline task feeding `hub` from `lines`.
///
/// The task ends when the line channel closes or `cancel` fires; in both
/// cases buffered batch entries are flushed once before exit.
pub fn spawn_log_pipeline(
    lines: mpsc::Receiver<String>,
    hub: Arc<Hub>,
    options: LogStreamOptions,
    container_id: Option<String>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match (options.format, options.batched) {
            (LogFormat::Text, _) => run_text(lines, hub, cancel).await,
            (LogFormat::Json, false) => {
                run_json(lines, hub, LogNormalizer::new(container_id), cancel).await
            }
            (LogFormat::Json, true) => {
                run_batched(
                    lines,
                    hub,
                    LogNormalizer::new(container_id),
                    options,
                    cancel,
                )
                .await
            }
        }
    })
}

async fn run_text(mut lines: mpsc::Receiver<String>, hub: Arc<Hub>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.recv() => {
                let Some(line) = line else { break };
                if hub.broadcast(Frame::Text(line)).is_err() {
                    trace!("text log frame dropped");
                }
            }
        }
    }
}

async fn run_json(
    mut lines: mpsc::Receiver<String>,
    hub: Arc<Hub>,
    mut normalizer: LogNormalizer,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.recv() => {
                let Some(line) = line else { break };
                let Some(message) = normalizer.normalize(&line) else { continue };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if hub.broadcast(Frame::Text(text)).is_err() {
                            trace!(seq = message.seq, "json log frame dropped");
                        }
                    }
                    Err(err) => debug!(error = %err, "log message not serializable"),
                }
            }
        }
    }
}

/// Batcher state machine: a single task owning the buffer, with
/// channel-driven transitions. Flushes on max-batch, on debounce expiry
/// with buffered items, on input close, and on cancellation; the last
/// two flush whatever is buffered before exiting.
async fn run_batched(
    mut lines: mpsc::Receiver<String>,
    hub: Arc<Hub>,
    mut normalizer: LogNormalizer,
    options: LogStreamOptions,
    cancel: CancellationToken,
) {
    let max_batch = options.max_batch.max(1);
    let mut buffer: Vec<LogMessage> = Vec::with_capacity(max_batch);

    loop {
        let received = if buffer.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.recv() => line,
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(options.debounce) => {
                    flush(&hub, &mut buffer);
                    continue;
                }
                line = lines.recv() => line,
            }
        };

        match received {
            Some(line) => {
                if let Some(message) = normalizer.normalize(&line) {
                    buffer.push(message);
                    if buffer.len() >= max_batch {
                        flush(&hub, &mut buffer);
                    }
                }
            }
            None => break,
        }
    }

    flush(&hub, &mut buffer);
}

fn flush(hub: &Hub, buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }
    match serde_json::to_string(&buffer) {
        Ok(text) => {
            if hub.broadcast(Frame::Text(text)).is_err() {
                trace!(entries = buffer.len(), "log batch dropped");
            }
        }
        Err(err) => debug!(error = %err, "log batch not serializable"),
    }
    buffer.clear();
}
