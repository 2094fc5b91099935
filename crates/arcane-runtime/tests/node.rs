//! End-to-end exercises of a node: local dispatch, proxy decisions, and a
//! full manager/agent round trip over the RPC tunnel transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use arcane_core::{
    Environment, EnvironmentLookup, StreamResult, TokenResolver,
};
use arcane_edge::{
    AgentConfig, AgentTunnelClient, EdgeProxy, NoopCallbacks, SessionValidator, TransportMode,
    TunnelRegistry, run_rpc_listener,
};
use arcane_runtime::{AppState, ArcaneConfig, NodeServices, RouterHandler, build_router};
use arcane_streams::{ExecSession, ExecStarter, LogQuery, LogSource, LogTarget, RuntimePing, StatsSource};

struct StaticEnvironments(HashMap<String, Environment>);

#[async_trait::async_trait]
impl EnvironmentLookup for StaticEnvironments {
    async fn lookup(&self, environment_id: &str) -> Option<Environment> {
        self.0.get(environment_id).cloned()
    }
}

struct AllowAll;

#[async_trait::async_trait]
impl SessionValidator for AllowAll {
    async fn validate(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

struct StaticTokens(HashMap<String, String>);

#[async_trait::async_trait]
impl TokenResolver for StaticTokens {
    async fn resolve(&self, token: &str) -> Option<String> {
        self.0.get(token).cloned()
    }
}

struct SilentLogs;

#[async_trait::async_trait]
impl LogSource for SilentLogs {
    async fn stream_logs(
        &self,
        _target: LogTarget,
        _query: LogQuery,
        _lines: tokio::sync::mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> StreamResult<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

struct SilentStats;

#[async_trait::async_trait]
impl StatsSource for SilentStats {
    async fn stream_stats(
        &self,
        _container_id: &str,
        _snapshots: tokio::sync::mpsc::Sender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> StreamResult<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

struct NoExec;

#[async_trait::async_trait]
impl ExecStarter for NoExec {
    async fn start(&self, _container_id: &str, _shell: &str) -> StreamResult<ExecSession> {
        Err(arcane_core::StreamError::SourceClosed("no runtime".into()))
    }
}

struct AlwaysUp;

#[async_trait::async_trait]
impl RuntimePing for AlwaysUp {
    async fn ping(&self) -> bool {
        true
    }
}

fn services(environments: Vec<Environment>, tokens: HashMap<String, String>) -> NodeServices {
    let map = environments
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect();
    NodeServices {
        environments: Arc::new(StaticEnvironments(map)),
        validator: Arc::new(AllowAll),
        resolver: Arc::new(StaticTokens(tokens)),
        callbacks: Arc::new(NoopCallbacks),
        logs: Arc::new(SilentLogs),
        stats: Arc::new(SilentStats),
        exec: Arc::new(NoExec),
        runtime_ping: Arc::new(AlwaysUp),
    }
}

fn node_config(environment_id: &str) -> ArcaneConfig {
    let mut config = ArcaneConfig::default();
    config.node.environment_id = environment_id.to_string();
    config
}

fn state_with(
    environment_id: &str,
    environments: Vec<Environment>,
    tokens: HashMap<String, String>,
    registry: Arc<TunnelRegistry>,
) -> AppState {
    AppState::new(node_config(environment_id), services(environments, tokens), registry)
}

#[tokio::test]
async fn local_health_request_is_not_proxied() {
    let state = state_with("self", vec![], HashMap::new(), Arc::new(TunnelRegistry::new()));
    let router = build_router(state);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/environments/self/system/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_remote_environment_is_404_from_the_proxy() {
    let state = state_with("self", vec![], HashMap::new(), Arc::new(TunnelRegistry::new()));
    let router = build_router(state);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/environments/ghost/containers/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("ghost"));
}

#[tokio::test]
async fn management_paths_stay_on_the_manager() {
    let environment = Environment {
        id: "E".into(),
        api_url: "http://127.0.0.1:1".into(),
        access_token: "tok".into(),
        enabled: true,
    };
    let state = state_with(
        "self",
        vec![environment],
        HashMap::new(),
        Arc::new(TunnelRegistry::new()),
    );
    let router = build_router(state);

    // No local route serves this path, so a pass-through lands on the
    // plain 404 fallback instead of a proxy error or a forwarded call.
    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/environments/E/heartbeat")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert!(body.is_empty());
}

/// Full round trip: a manager accepts an agent over the RPC transport,
/// and a proxied health request travels tunnel -> agent router -> tunnel.
#[tokio::test]
async fn remote_request_travels_the_tunnel() {
    // Manager side.
    let registry = Arc::new(TunnelRegistry::new());
    let tokens = HashMap::from([("agent-token".to_string(), "agent-env".to_string())]);
    let rpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rpc_addr = rpc_listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(run_rpc_listener(
        rpc_listener,
        Arc::new(StaticTokens(tokens.clone())),
        Arc::clone(&registry),
        Arc::new(NoopCallbacks),
        cancel.clone(),
    ));

    // Agent side: its own router answers the forwarded request.
    let agent_state = state_with(
        "local",
        vec![],
        HashMap::new(),
        Arc::new(TunnelRegistry::new()),
    );
    let agent_router = build_router(agent_state);
    let agent = AgentTunnelClient::new(
        AgentConfig {
            manager_ws_url: String::new(),
            manager_rpc_addr: rpc_addr.to_string(),
            token: "agent-token".into(),
            transport: TransportMode::Rpc,
            local_listen_addr: "127.0.0.1:0".into(),
            reconnect_delay: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
        },
        RouterHandler::new(agent_router),
    );
    tokio::spawn(agent.run(cancel.clone()));

    // Wait until the tunnel registers.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.get("agent-env").is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "tunnel never registered"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Manager proxy forwards over the live tunnel.
    let environments = vec![Environment {
        id: "agent-env".into(),
        api_url: "http://unused.invalid".into(),
        access_token: "agent-token".into(),
        enabled: true,
    }];
    let map = environments
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect();
    let proxy = EdgeProxy::new(
        "manager",
        Arc::new(StaticEnvironments(map)),
        Arc::new(AllowAll),
        Arc::clone(&registry),
    );
    let response = proxy
        .forward_http(
            "agent-env",
            "system/health",
            Request::builder()
                .uri("/api/environments/agent-env/system/health")
                .header("connection", "keep-alive")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    cancel.cancel();
}
