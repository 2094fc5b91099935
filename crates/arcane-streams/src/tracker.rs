//! Live-connection tracker: per-kind atomic counters plus metadata for
//! every open streaming socket.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

/// The streaming endpoints the tracker distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    ProjectLogs,
    ContainerLogs,
    ContainerStats,
    ContainerExec,
    SystemStats,
}

impl StreamKind {
    const ALL: [StreamKind; 5] = [
        StreamKind::ProjectLogs,
        StreamKind::ContainerLogs,
        StreamKind::ContainerStats,
        StreamKind::ContainerExec,
        StreamKind::SystemStats,
    ];

    fn index(self) -> usize {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(0)
    }
}

/// Metadata for one live streaming connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Assigned on register when empty.
    pub id: String,
    pub kind: StreamKind,
    pub environment_id: String,
    pub resource_id: String,
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Set on register when missing.
    pub started_at: Option<DateTime<Utc>>,
}

/// Point-in-time counts per stream kind.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCounts {
    pub project_logs: u64,
    pub container_logs: u64,
    pub container_stats: u64,
    pub container_exec: u64,
    pub system_stats: u64,
}

/// Process-wide tracker of live streaming connections.
#[derive(Default)]
pub struct ConnectionTracker {
    counters: [AtomicU64; 5],
    connections: Mutex<HashMap<String, ConnectionInfo>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, assigning an id and start time when the
    /// caller left them empty. Returns the connection id.
    pub fn register(&self, mut info: ConnectionInfo) -> String {
        if info.id.is_empty() {
            info.id = Uuid::new_v4().to_string();
        }
        if info.started_at.is_none() {
            info.started_at = Some(Utc::now());
        }
        let id = info.id.clone();
        self.counters[info.kind.index()].fetch_add(1, Ordering::SeqCst);
        self.connections.lock().insert(id.clone(), info);
        id
    }

    /// Removes a connection and decrements its kind's counter.
    pub fn unregister(&self, id: &str) {
        if let Some(info) = self.connections.lock().remove(id) {
            self.counters[info.kind.index()].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Snapshot of the per-kind counters.
    pub fn snapshot(&self) -> StreamCounts {
        StreamCounts {
            project_logs: self.count(StreamKind::ProjectLogs),
            container_logs: self.count(StreamKind::ContainerLogs),
            container_stats: self.count(StreamKind::ContainerStats),
            container_exec: self.count(StreamKind::ContainerExec),
            system_stats: self.count(StreamKind::SystemStats),
        }
    }

    pub fn count(&self, kind: StreamKind) -> u64 {
        self.counters[kind.index()].load(Ordering::SeqCst)
    }

    /// Copies of all live connection records.
    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.connections.lock().values().cloned().collect()
    }

    /// Live connections from one client address, all kinds.
    pub fn active_for_ip(&self, client_ip: &str) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|info| info.client_ip == client_ip)
            .count()
    }

    /// Live connections of one kind from one client address; backs the
    /// per-IP concurrency limit on `system/stats`.
    pub fn active_for(&self, client_ip: &str, kind: StreamKind) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|info| info.client_ip == client_ip && info.kind == kind)
            .count()
    }
}

static GLOBAL_TRACKER: LazyLock<ConnectionTracker> = LazyLock::new(ConnectionTracker::new);

/// The process-wide tracker singleton.
pub fn global_tracker() -> &'static ConnectionTracker {
    &GLOBAL_TRACKER
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(kind: StreamKind, ip: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: String::new(),
            kind,
            environment_id: "env-1".into(),
            resource_id: "c1".into(),
            client_ip: ip.into(),
            user_id: None,
            user_agent: None,
            started_at: None,
        }
    }

    #[test]
    fn register_assigns_id_and_start_time() {
        let tracker = ConnectionTracker::new();
        let id = tracker.register(info(StreamKind::ContainerLogs, "10.0.0.1"));
        assert!(!id.is_empty());
        let listed = tracker.list();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].started_at.is_some());
        assert_eq!(tracker.count(StreamKind::ContainerLogs), 1);
    }

    #[test]
    fn unregister_decrements_the_matching_counter() {
        let tracker = ConnectionTracker::new();
        let logs = tracker.register(info(StreamKind::ContainerLogs, "10.0.0.1"));
        let stats = tracker.register(info(StreamKind::ContainerStats, "10.0.0.1"));
        tracker.unregister(&logs);
        let counts = tracker.snapshot();
        assert_eq!(counts.container_logs, 0);
        assert_eq!(counts.container_stats, 1);
        tracker.unregister(&stats);
        assert_eq!(tracker.list().len(), 0);
    }

    #[test]
    fn per_ip_count_backs_the_rate_limit() {
        let tracker = ConnectionTracker::new();
        for _ in 0..5 {
            tracker.register(info(StreamKind::SystemStats, "10.0.0.9"));
        }
        tracker.register(info(StreamKind::SystemStats, "10.0.0.8"));
        assert_eq!(tracker.active_for_ip("10.0.0.9"), 5);
        assert_eq!(tracker.active_for_ip("10.0.0.8"), 1);
        assert_eq!(tracker.count(StreamKind::SystemStats), 6);
    }

    #[test]
    fn unknown_id_unregister_is_a_no_op() {
        let tracker = ConnectionTracker::new();
        tracker.register(info(StreamKind::ProjectLogs, "10.0.0.1"));
        tracker.unregister("ghost");
        assert_eq!(tracker.count(StreamKind::ProjectLogs), 1);
    }
}
