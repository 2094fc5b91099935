//! Live-stream endpoints: logs, container stats, terminals, and system
//! stats, each backed by an on-demand fan-out hub.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use arcane_streams::{
    ConnectionInfo, Hub, HubConfig, LogFormat, LogQuery, LogStreamOptions, LogTarget, StreamKind,
    serve_exec, serve_subscriber, spawn_log_pipeline, spawn_stats_pump, spawn_system_stats,
};

use super::AppState;

/// On-demand hubs keyed by stream identity. A hub exists while it has
/// subscribers; when the last one leaves, its `on_empty` hook removes the
/// entry and cancels the owner context that keeps the producers alive.
pub struct StreamHubs {
    config: HubConfig,
    entries: Mutex<HashMap<String, Arc<Hub>>>,
}

impl StreamHubs {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the hub for `key`, creating it (and its producer graph,
    /// via `init`) on first use. The owner context handed to `init` is
    /// deliberately detached from any request context: streams outlive
    /// the upgrade request that started them.
    pub fn get_or_create<F>(self: &Arc<Self>, key: &str, init: F) -> Arc<Hub>
    where
        F: FnOnce(Arc<Hub>, CancellationToken),
    {
        let mut entries = self.entries.lock();
        if let Some(hub) = entries.get(key) {
            return Arc::clone(hub);
        }

        let owner = CancellationToken::new();
        let weak = Arc::downgrade(self);
        let removal_key = key.to_string();
        let owner_for_empty = owner.clone();
        let (hub, _run) = Hub::spawn(self.config, move || {
            if let Some(hubs) = weak.upgrade() {
                hubs.entries.lock().remove(&removal_key);
            }
            owner_for_empty.cancel();
        });
        entries.insert(key.to_string(), Arc::clone(&hub));
        drop(entries);

        init(Arc::clone(&hub), owner);
        hub
    }

    /// Number of live hubs.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Query options shared by the two log endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsParams {
    pub follow: bool,
    pub tail: String,
    pub since: Option<String>,
    pub timestamps: bool,
    pub format: String,
    pub batched: bool,
}

impl Default for LogsParams {
    fn default() -> Self {
        Self {
            follow: true,
            tail: "100".to_string(),
            since: None,
            timestamps: false,
            format: "text".to_string(),
            batched: false,
        }
    }
}

impl LogsParams {
    fn stream_options(&self, state: &AppState) -> LogStreamOptions {
        LogStreamOptions {
            format: if self.format.eq_ignore_ascii_case("json") {
                LogFormat::Json
            } else {
                LogFormat::Text
            },
            batched: self.batched,
            max_batch: state.config.streams.max_batch,
            debounce: state.config.streams.debounce(),
        }
    }

    fn source_query(&self) -> LogQuery {
        LogQuery {
            follow: self.follow,
            tail: self.tail.clone(),
            since: self.since.clone(),
            timestamps: self.timestamps,
        }
    }
}

pub async fn project_logs(
    State(state): State<AppState>,
    Path((_env_id, project_id)): Path<(String, String)>,
    Query(params): Query<LogsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    serve_log_stream(
        state,
        LogTarget::Project(project_id),
        StreamKind::ProjectLogs,
        params,
        addr,
        headers,
        ws,
    )
}

pub async fn container_logs(
    State(state): State<AppState>,
    Path((_env_id, container_id)): Path<(String, String)>,
    Query(params): Query<LogsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    serve_log_stream(
        state,
        LogTarget::Container(container_id),
        StreamKind::ContainerLogs,
        params,
        addr,
        headers,
        ws,
    )
}

fn serve_log_stream(
    state: AppState,
    target: LogTarget,
    kind: StreamKind,
    params: LogsParams,
    addr: SocketAddr,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let (resource_id, container_id) = match &target {
        LogTarget::Container(id) => (id.clone(), Some(id.clone())),
        LogTarget::Project(id) => (id.clone(), None),
    };
    let key = format!(
        "{kind:?}:{resource_id}:{}:{}:{}:{}",
        params.format, params.batched, params.tail, params.timestamps
    );
    let options = params.stream_options(&state);
    let query = params.source_query();
    let logs = Arc::clone(&state.logs);
    let hub = state.hubs.get_or_create(&key, move |hub, owner| {
        let (lines_tx, lines_rx) = mpsc::channel::<String>(256);
        spawn_log_pipeline(lines_rx, Arc::clone(&hub), options, container_id, owner.clone());
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(err) = logs.stream_logs(target, query, lines_tx, owner).await {
                debug!(error = %err, "log source ended");
            }
        });
    });

    let connection_id = state.tracker.register(connection_info(
        kind,
        &state,
        resource_id,
        addr,
        &headers,
    ));
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = serve_subscriber(socket, hub).await {
            debug!(error = %err, "log subscriber ended early");
        }
        state.tracker.unregister(&connection_id);
    })
}

pub async fn container_stats(
    State(state): State<AppState>,
    Path((_env_id, container_id)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let key = format!("container-stats:{container_id}");
    let stats = Arc::clone(&state.stats);
    let hub = state.hubs.get_or_create(&key, {
        let container_id = container_id.clone();
        move |hub, owner| {
            let (snapshots_tx, snapshots_rx) = mpsc::channel(64);
            spawn_stats_pump(snapshots_rx, hub, owner.clone());
            tokio::spawn(async move {
                if let Err(err) = stats.stream_stats(&container_id, snapshots_tx, owner).await {
                    debug!(error = %err, "stats source ended");
                }
            });
        }
    });

    let connection_id = state.tracker.register(connection_info(
        StreamKind::ContainerStats,
        &state,
        container_id,
        addr,
        &headers,
    ));
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = serve_subscriber(socket, hub).await {
            debug!(error = %err, "stats subscriber ended early");
        }
        state.tracker.unregister(&connection_id);
    })
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TerminalParams {
    pub shell: String,
}

impl Default for TerminalParams {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }
}

pub async fn container_terminal(
    State(state): State<AppState>,
    Path((_env_id, container_id)): Path<(String, String)>,
    Query(params): Query<TerminalParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match state.exec.start(&container_id, &params.shell).await {
        Ok(session) => session,
        Err(err) => {
            warn!(container_id = %container_id, error = %err, "exec start failed");
            return (StatusCode::BAD_GATEWAY, err.to_string()).into_response();
        }
    };

    let connection_id = state.tracker.register(connection_info(
        StreamKind::ContainerExec,
        &state,
        container_id,
        addr,
        &headers,
    ));
    ws.on_upgrade(move |socket| async move {
        serve_exec(socket, session).await;
        state.tracker.unregister(&connection_id);
    })
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SystemStatsParams {
    /// Broadcast interval in seconds.
    pub interval: u64,
}

impl Default for SystemStatsParams {
    fn default() -> Self {
        Self { interval: 2 }
    }
}

pub async fn system_stats(
    State(state): State<AppState>,
    Path(_env_id): Path<String>,
    Query(params): Query<SystemStatsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let client_ip = addr.ip().to_string();
    let limit = state.config.streams.max_stats_connections_per_ip;
    if state.tracker.active_for(&client_ip, StreamKind::SystemStats) >= limit {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "too many concurrent system stats connections",
        )
            .into_response();
    }

    let interval = Duration::from_secs(params.interval.max(1));
    let key = format!("system-stats:{}", interval.as_secs());
    let collector = Arc::clone(&state.system_stats);
    let hub = state.hubs.get_or_create(&key, move |hub, owner| {
        spawn_system_stats(collector, hub, interval, owner);
    });

    let connection_id = state.tracker.register(connection_info(
        StreamKind::SystemStats,
        &state,
        String::new(),
        addr,
        &headers,
    ));
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = serve_subscriber(socket, hub).await {
            debug!(error = %err, "system stats subscriber ended early");
        }
        state.tracker.unregister(&connection_id);
    })
}

fn connection_info(
    kind: StreamKind,
    state: &AppState,
    resource_id: String,
    addr: SocketAddr,
    headers: &HeaderMap,
) -> ConnectionInfo {
    ConnectionInfo {
        id: String::new(),
        kind,
        environment_id: state.config.node.environment_id.clone(),
        resource_id,
        client_ip: addr.ip().to_string(),
        user_id: None,
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        started_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hubs_are_shared_by_key_and_removed_on_empty() {
        let hubs = Arc::new(StreamHubs::new(HubConfig::default()));
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let make = |hubs: &Arc<StreamHubs>| {
            let created = Arc::clone(&created);
            hubs.get_or_create("logs:c1:text", move |_hub, _owner| {
                created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
        };
        let first = make(&hubs);
        let second = make(&hubs);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(hubs.len(), 1);

        // Last subscriber leaving empties the hub and removes the entry.
        let client = first.register().await.unwrap();
        first.unregister(client.id);
        for _ in 0..200 {
            if hubs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(hubs.is_empty());
    }

    #[test]
    fn log_params_defaults_match_the_contract() {
        let params = LogsParams::default();
        assert!(params.follow);
        assert_eq!(params.tail, "100");
        assert_eq!(params.format, "text");
        assert!(!params.batched);
        assert_eq!(TerminalParams::default().shell, "/bin/sh");
        assert_eq!(SystemStatsParams::default().interval, 2);
    }
}
