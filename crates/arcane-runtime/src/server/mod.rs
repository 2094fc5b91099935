//! HTTP surface of a node: route wiring, the tunnel accept endpoint, and
//! the health probe. Every route lives under `/api/environments/{env_id}/`;
//! the proxy layer intercepts requests whose environment is not this node.

mod proxy_layer;
mod streams;

pub use proxy_layer::split_environment_path;
pub use streams::StreamHubs;

use std::sync::Arc;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::info;

use arcane_core::{EnvironmentLookup, TokenResolver, TunnelChannel};
use arcane_edge::{EdgeProxy, SessionValidator, TunnelCallbacks, TunnelRegistry, serve_tunnel};
use arcane_streams::{
    ConnectionTracker, ExecStarter, LogSource, RuntimePing, StatsSource, SystemStatsCollector,
    global_tracker,
};
use arcane_transport::ServerWsChannel;

use crate::config::ArcaneConfig;

/// External collaborators a node is wired with. Persistence, auth policy,
/// and container-runtime invocation all arrive through these seams.
pub struct NodeServices {
    pub environments: Arc<dyn EnvironmentLookup>,
    pub validator: Arc<dyn SessionValidator>,
    pub resolver: Arc<dyn TokenResolver>,
    pub callbacks: Arc<dyn TunnelCallbacks>,
    pub logs: Arc<dyn LogSource>,
    pub stats: Arc<dyn StatsSource>,
    pub exec: Arc<dyn ExecStarter>,
    pub runtime_ping: Arc<dyn RuntimePing>,
}

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcaneConfig>,
    pub logs: Arc<dyn LogSource>,
    pub stats: Arc<dyn StatsSource>,
    pub exec: Arc<dyn ExecStarter>,
    pub runtime_ping: Arc<dyn RuntimePing>,
    pub resolver: Arc<dyn TokenResolver>,
    pub callbacks: Arc<dyn TunnelCallbacks>,
    pub registry: Arc<TunnelRegistry>,
    pub proxy: Arc<EdgeProxy>,
    pub hubs: Arc<StreamHubs>,
    pub system_stats: Arc<SystemStatsCollector>,
    pub tracker: &'static ConnectionTracker,
}

impl AppState {
    pub fn new(
        config: ArcaneConfig,
        services: NodeServices,
        registry: Arc<TunnelRegistry>,
    ) -> Self {
        let proxy = Arc::new(EdgeProxy::new(
            config.node.environment_id.clone(),
            Arc::clone(&services.environments),
            Arc::clone(&services.validator),
            Arc::clone(&registry),
        ));
        let hubs = Arc::new(StreamHubs::new(arcane_streams::HubConfig {
            broadcast_capacity: config.streams.broadcast_capacity,
            client_queue: config.streams.client_queue,
        }));
        Self {
            config: Arc::new(config),
            logs: services.logs,
            stats: services.stats,
            exec: services.exec,
            runtime_ping: services.runtime_ping,
            resolver: services.resolver,
            callbacks: services.callbacks,
            registry,
            proxy,
            hubs,
            system_stats: Arc::new(SystemStatsCollector::new()),
            tracker: global_tracker(),
        }
    }
}

/// Builds the node's router. The proxy layer wraps every route and the
/// fallback, so requests for other environments never reach the local
/// handlers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/environments/{env_id}/ws/projects/{project_id}/logs",
            get(streams::project_logs),
        )
        .route(
            "/api/environments/{env_id}/ws/containers/{container_id}/logs",
            get(streams::container_logs),
        )
        .route(
            "/api/environments/{env_id}/ws/containers/{container_id}/stats",
            get(streams::container_stats),
        )
        .route(
            "/api/environments/{env_id}/ws/containers/{container_id}/terminal",
            get(streams::container_terminal),
        )
        .route(
            "/api/environments/{env_id}/ws/system/stats",
            get(streams::system_stats),
        )
        .route("/api/environments/{env_id}/system/health", get(health))
        .route("/api/environments/{env_id}/tunnel/connect", get(tunnel_connect))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proxy_layer::proxy_layer,
        ))
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Cheap liveness probe: ok only while the container runtime answers.
async fn health(State(state): State<AppState>) -> StatusCode {
    if state.runtime_ping.ping().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Agent-initiated duplex endpoint for the WebSocket tunnel transport.
/// The token arrives in either agent auth header; resolution happens
/// before the upgrade so bad tokens get a plain 401.
async fn tunnel_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = agent_token_from_headers(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing agent token").into_response();
    };
    let Some(environment_id) = state.resolver.resolve(&token).await else {
        return (StatusCode::UNAUTHORIZED, "invalid agent token").into_response();
    };
    info!(environment_id = %environment_id, "agent tunnel upgrading");
    ws.on_upgrade(move |socket| async move {
        let channel: Arc<dyn TunnelChannel> = Arc::new(ServerWsChannel::new(socket));
        serve_tunnel(environment_id, channel, state.registry, state.callbacks).await;
    })
}

fn agent_token_from_headers(headers: &HeaderMap) -> Option<String> {
    [arcane_core::AGENT_TOKEN_HEADER, arcane_core::API_KEY_HEADER]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}
