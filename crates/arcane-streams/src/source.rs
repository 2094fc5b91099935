//! Seams to the container runtime. Docker/Compose invocation is an
//! external collaborator; the streaming plane only sees these traits.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use arcane_core::StreamResult;

/// What a log stream reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Container(String),
    Project(String),
}

/// Source-side options for a log stream, parsed from the subscriber's
/// query string.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub follow: bool,
    pub tail: String,
    pub since: Option<String>,
    pub timestamps: bool,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            follow: true,
            tail: "100".to_string(),
            since: None,
            timestamps: false,
        }
    }
}

/// Streams raw log lines into `lines` until the source ends or `cancel`
/// fires.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn stream_logs(
        &self,
        target: LogTarget,
        query: LogQuery,
        lines: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> StreamResult<()>;
}

/// Streams live resource snapshots for one container as JSON values.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn stream_stats(
        &self,
        container_id: &str,
        snapshots: mpsc::Sender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> StreamResult<()>;
}

/// A running interactive exec session inside a container.
pub struct ExecSession {
    /// Bytes written here reach the process's stdin.
    pub stdin: mpsc::Sender<Vec<u8>>,
    /// Combined stdout/stderr of the process.
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Starts interactive exec sessions.
#[async_trait]
pub trait ExecStarter: Send + Sync {
    async fn start(&self, container_id: &str, shell: &str) -> StreamResult<ExecSession>;
}

/// Cheap container-runtime liveness probe backing `system/health`.
#[async_trait]
pub trait RuntimePing: Send + Sync {
    async fn ping(&self) -> bool;
}
