//! Edge-aware proxy: decides whether a call for an environment is served
//! locally, over the environment's live tunnel, or by a direct HTTP hop,
//! and forwards bodies, headers, and WebSocket upgrades accordingly.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, warn};

use arcane_core::{
    Environment, EnvironmentLookup, Headers, LOCAL_ENVIRONMENT_ALIAS, ProxyError,
    TUNNEL_STREAM_HEADER, TunnelError, TunnelMessage, TunnelPayload, WsFrameKind,
    inject_agent_token, is_hop_by_hop, without_ws_handshake,
};

use crate::registry::TunnelRegistry;
use crate::tunnel::{AgentTunnel, TunnelHttpRequest};

/// Direct-hop client timeout. Some container operations stream for a long
/// time, so this is generous.
pub const DIRECT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Largest request body copied into memory for tunnel forwarding.
pub const MAX_PROXY_BODY: usize = 64 * 1024 * 1024;

/// Paths that address the manager's own records about an environment and
/// are therefore never forwarded to it.
pub const MANAGEMENT_PATHS: [&str; 9] = [
    "test",
    "heartbeat",
    "sync",
    "deployment",
    "pair",
    "version",
    "settings",
    "job-schedules",
    "jobs",
];

/// Validates the calling session before anything is forwarded.
///
/// Authentication policy is an external collaborator; the proxy only
/// enforces the verdict.
#[async_trait::async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, headers: &HeaderMap) -> bool;
}

/// The request-level dispatcher at the manager edge.
pub struct EdgeProxy {
    local_environment_id: String,
    environments: Arc<dyn EnvironmentLookup>,
    validator: Arc<dyn SessionValidator>,
    registry: Arc<TunnelRegistry>,
    http: reqwest::Client,
}

impl EdgeProxy {
    pub fn new(
        local_environment_id: impl Into<String>,
        environments: Arc<dyn EnvironmentLookup>,
        validator: Arc<dyn SessionValidator>,
        registry: Arc<TunnelRegistry>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DIRECT_REQUEST_TIMEOUT)
            .build()
            .expect("failed to create HTTP client");
        Self {
            local_environment_id: local_environment_id.into(),
            environments,
            validator,
            registry,
            http,
        }
    }

    /// Whether `environment_id` names this node itself.
    pub fn is_local(&self, environment_id: &str) -> bool {
        environment_id == self.local_environment_id
            || environment_id == LOCAL_ENVIRONMENT_ALIAS
    }

    /// Whether `remainder` (the path after the environment prefix) targets
    /// the manager's own records rather than the environment.
    pub fn is_management_path(remainder: &str) -> bool {
        let first = remainder
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or("");
        MANAGEMENT_PATHS.contains(&first)
    }

    /// Whether a request for this environment and path leaves the node.
    pub fn should_forward(&self, environment_id: &str, remainder: &str) -> bool {
        !self.is_local(environment_id) && !Self::is_management_path(remainder)
    }

    async fn resolve(&self, environment_id: &str) -> Result<Environment, ProxyError> {
        let environment = self
            .environments
            .lookup(environment_id)
            .await
            .ok_or_else(|| ProxyError::EnvironmentNotFound(environment_id.to_string()))?;
        if !environment.enabled {
            return Err(ProxyError::EnvironmentDisabled(environment_id.to_string()));
        }
        Ok(environment)
    }

    /// Forwards one HTTP request to `environment_id`, preferring its live
    /// tunnel over a direct hop. The caller has already decided via
    /// [`EdgeProxy::should_forward`] that the request leaves this node.
    pub async fn forward_http(
        &self,
        environment_id: &str,
        remainder: &str,
        request: Request,
    ) -> Response {
        if !self.validator.validate(request.headers()).await {
            return error_response(&ProxyError::Unauthorized);
        }
        let environment = match self.resolve(environment_id).await {
            Ok(environment) => environment,
            Err(err) => return error_response(&err),
        };

        match self.registry.get(environment_id) {
            Some(tunnel) => {
                match self
                    .tunnel_http(&tunnel, &environment, remainder, request)
                    .await
                {
                    Ok(response) => response,
                    Err(err) => error_response(&err),
                }
            }
            None => match self.direct_http(&environment, remainder, request).await {
                Ok(response) => response,
                Err(err) => error_response(&err),
            },
        }
    }

    async fn tunnel_http(
        &self,
        tunnel: &Arc<AgentTunnel>,
        environment: &Environment,
        remainder: &str,
        request: Request,
    ) -> Result<Response, ProxyError> {
        let method = request.method().as_str().to_string();
        let query = request.uri().query().unwrap_or("").to_string();
        let mut headers = headers_to_map(request.headers());
        headers.retain(|name, _| !is_hop_by_hop(name));
        inject_agent_token(&mut headers, &environment.access_token);

        let body = axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY)
            .await
            .map_err(|e| ProxyError::Upstream(format!("request body: {e}")))?;

        // The agent's own router expects its local environment prefix.
        let path = format!(
            "/api/environments/{}/{}",
            LOCAL_ENVIRONMENT_ALIAS,
            remainder.trim_start_matches('/')
        );

        let response = tunnel
            .send_request(
                TunnelHttpRequest {
                    method,
                    path,
                    query,
                    headers,
                    body: body.to_vec(),
                },
                None,
            )
            .await
            .map_err(|err| match err {
                TunnelError::Timeout => ProxyError::Timeout,
                other => ProxyError::Tunnel(other),
            })?;

        let mut builder = Response::builder()
            .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY));
        for (name, value) in &response.headers {
            if is_hop_by_hop(name) || name == TUNNEL_STREAM_HEADER {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }
        builder
            .body(Body::from(response.body))
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }

    async fn direct_http(
        &self,
        environment: &Environment,
        remainder: &str,
        request: Request,
    ) -> Result<Response, ProxyError> {
        let url = format!(
            "{}/api/environments/{}/{}",
            environment.api_url.trim_end_matches('/'),
            LOCAL_ENVIRONMENT_ALIAS,
            remainder.trim_start_matches('/')
        );
        let url = match request.uri().query() {
            Some(query) => format!("{url}?{query}"),
            None => url,
        };

        let method = request.method().clone();
        let mut headers = HeaderMap::new();
        for (name, value) in request.headers() {
            if !is_hop_by_hop(name.as_str()) {
                headers.insert(name.clone(), value.clone());
            }
        }
        if let Ok(token) = HeaderValue::from_str(&environment.access_token) {
            headers.insert(arcane_core::AGENT_TOKEN_HEADER, token.clone());
            headers.insert(arcane_core::API_KEY_HEADER, token);
        }

        let body = axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY)
            .await
            .map_err(|e| ProxyError::Upstream(format!("request body: {e}")))?;

        let upstream = self
            .http
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProxyError::Timeout
                } else {
                    ProxyError::Upstream(err.to_string())
                }
            })?;

        let mut builder = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name.as_str()) {
                builder = builder.header(name.clone(), value.clone());
            }
        }
        // Streaming the upstream body chunk by chunk keeps long-running
        // operations (pulls, log dumps) flowing to the caller promptly.
        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }

    /// Forwards a WebSocket upgrade to `environment_id`. Resolution and
    /// auth run before the upgrade completes so failures surface as plain
    /// HTTP statuses.
    pub async fn forward_ws(
        &self,
        environment_id: &str,
        remainder: &str,
        query: Option<String>,
        headers: HeaderMap,
        client_ip: Option<String>,
        upgrade: WebSocketUpgrade,
    ) -> Response {
        if !self.validator.validate(&headers).await {
            return error_response(&ProxyError::Unauthorized);
        }
        let environment = match self.resolve(environment_id).await {
            Ok(environment) => environment,
            Err(err) => return error_response(&err),
        };

        let remainder = remainder.trim_start_matches('/').to_string();
        let query = query.unwrap_or_default();

        match self.registry.get(environment_id) {
            Some(tunnel) => {
                let mut forwarded = without_ws_handshake(&headers_to_map(&headers));
                forwarded.retain(|name, _| !is_hop_by_hop(name));
                inject_agent_token(&mut forwarded, &environment.access_token);
                upgrade.on_upgrade(move |socket| {
                    tunnel_ws(socket, tunnel, remainder, query, forwarded)
                })
            }
            None => {
                let environment = environment.clone();
                upgrade.on_upgrade(move |socket| {
                    direct_ws(socket, environment, remainder, query, client_ip)
                })
            }
        }
    }
}

/// Pumps one caller WebSocket through an agent tunnel stream.
async fn tunnel_ws(
    socket: WebSocket,
    tunnel: Arc<AgentTunnel>,
    remainder: String,
    query: String,
    headers: Headers,
) {
    let (stream_id, mut frames) = tunnel.open_stream();
    let start = TunnelMessage::reply(
        stream_id.clone(),
        TunnelPayload::WsStart {
            path: format!("/api/environments/{LOCAL_ENVIRONMENT_ALIAS}/{remainder}"),
            query,
            headers,
        },
    );
    if let Err(err) = tunnel.send(&start).await {
        warn!(error = %err, "ws-start not delivered");
        tunnel.finish_stream(&stream_id);
        return;
    }

    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                match frame.payload {
                    TunnelPayload::WsData { kind, payload } => {
                        let message = match kind {
                            WsFrameKind::Text => match String::from_utf8(payload) {
                                Ok(text) => AxumMessage::Text(text.into()),
                                Err(_) => continue,
                            },
                            WsFrameKind::Binary => AxumMessage::Binary(payload.into()),
                        };
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    TunnelPayload::WsClose => break,
                    other => debug!(kind = other.kind(), "unexpected frame on ws stream"),
                }
            }
            inbound = source.next() => {
                let (kind, payload) = match inbound {
                    Some(Ok(AxumMessage::Text(text))) => {
                        (WsFrameKind::Text, text.as_bytes().to_vec())
                    }
                    Some(Ok(AxumMessage::Binary(payload))) => {
                        (WsFrameKind::Binary, payload.to_vec())
                    }
                    Some(Ok(AxumMessage::Ping(_) | AxumMessage::Pong(_))) => continue,
                    Some(Ok(AxumMessage::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(error = %err, "caller websocket read failed");
                        break;
                    }
                };
                let envelope = TunnelMessage::reply(
                    stream_id.clone(),
                    TunnelPayload::WsData { kind, payload },
                );
                if tunnel.send(&envelope).await.is_err() {
                    break;
                }
            }
        }
    }

    tunnel.finish_stream(&stream_id);
    let _ = tunnel
        .send(&TunnelMessage::reply(stream_id, TunnelPayload::WsClose))
        .await;
}

/// Transparent WebSocket proxy straight to the environment's own API.
async fn direct_ws(
    socket: WebSocket,
    environment: Environment,
    remainder: String,
    query: String,
    client_ip: Option<String>,
) {
    let scheme = if environment.api_url.starts_with("https://") {
        "wss"
    } else {
        "ws"
    };
    let base = environment
        .api_url
        .trim_end_matches('/')
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let mut url = format!(
        "{scheme}://{base}/api/environments/{LOCAL_ENVIRONMENT_ALIAS}/{remainder}"
    );
    if !query.is_empty() {
        url = format!("{url}?{query}");
    }

    let mut request = match url.clone().into_client_request() {
        Ok(request) => request,
        Err(err) => {
            warn!(url = %url, error = %err, "invalid upstream websocket url");
            return;
        }
    };
    if let Ok(token) = environment.access_token.parse::<HeaderValue>() {
        request
            .headers_mut()
            .insert(arcane_core::AGENT_TOKEN_HEADER, token.clone());
        request.headers_mut().insert(arcane_core::API_KEY_HEADER, token);
    }
    if let Some(ip) = client_ip.and_then(|ip| ip.parse::<HeaderValue>().ok()) {
        request.headers_mut().insert("x-forwarded-for", ip);
    }

    let upstream = match connect_async(request).await {
        Ok((upstream, _)) => upstream,
        Err(err) => {
            warn!(url = %url, error = %err, "upstream websocket dial failed");
            return;
        }
    };

    let (mut caller_sink, mut caller_source) = socket.split();
    let (mut upstream_sink, mut upstream_source) = upstream.split();
    loop {
        tokio::select! {
            inbound = caller_source.next() => {
                let message = match inbound {
                    Some(Ok(AxumMessage::Text(text))) => {
                        TungsteniteMessage::Text(text.as_str().to_string().into())
                    }
                    Some(Ok(AxumMessage::Binary(payload))) => {
                        TungsteniteMessage::Binary(payload)
                    }
                    Some(Ok(AxumMessage::Ping(_) | AxumMessage::Pong(_))) => continue,
                    Some(Ok(AxumMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                };
                if upstream_sink.send(message).await.is_err() {
                    break;
                }
            }
            outbound = upstream_source.next() => {
                let message = match outbound {
                    Some(Ok(TungsteniteMessage::Text(text))) => {
                        AxumMessage::Text(text.as_str().to_string().into())
                    }
                    Some(Ok(TungsteniteMessage::Binary(payload))) => {
                        AxumMessage::Binary(payload)
                    }
                    Some(Ok(
                        TungsteniteMessage::Ping(_)
                        | TungsteniteMessage::Pong(_)
                        | TungsteniteMessage::Frame(_),
                    )) => continue,
                    Some(Ok(TungsteniteMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                };
                if caller_sink.send(message).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = upstream_sink.close().await;
    let _ = caller_sink.close().await;
}

fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

/// Flattens an http header map to the envelope representation: lowercase
/// names, one value each, non-UTF-8 values skipped.
fn headers_to_map(headers: &HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use arcane_core::API_KEY_HEADER;

    use super::*;
    use crate::test_support::MockChannel;

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

    struct DenyAll;

    #[async_trait::async_trait]
    impl SessionValidator for DenyAll {
        async fn validate(&self, _headers: &HeaderMap) -> bool {
            false
        }
    }

    fn environment(id: &str, enabled: bool) -> Environment {
        Environment {
            id: id.to_string(),
            api_url: "http://agent.example:3552".to_string(),
            access_token: "env-token".to_string(),
            enabled,
        }
    }

    fn proxy_with(
        validator: Arc<dyn SessionValidator>,
        registry: Arc<TunnelRegistry>,
        environments: Vec<Environment>,
    ) -> EdgeProxy {
        let map = environments
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        EdgeProxy::new(
            "self",
            Arc::new(StaticEnvironments(map)),
            validator,
            registry,
        )
    }

    fn get_request(path: &str) -> Request {
        Request::builder()
            .method("GET")
            .uri(path)
            .header("connection", "keep-alive")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn local_and_management_requests_are_not_forwarded() {
        let proxy = proxy_with(Arc::new(AllowAll), Arc::new(TunnelRegistry::new()), vec![]);
        assert!(!proxy.should_forward("self", "containers"));
        assert!(!proxy.should_forward("local", "containers"));
        assert!(!proxy.should_forward("E", "heartbeat"));
        assert!(!proxy.should_forward("E", "job-schedules/next"));
        assert!(proxy.should_forward("E", "containers/json"));
        assert!(proxy.should_forward("E", "system/health"));
    }

    #[tokio::test]
    async fn unauthenticated_caller_gets_401_before_any_forwarding() {
        let registry = Arc::new(TunnelRegistry::new());
        let proxy = proxy_with(
            Arc::new(DenyAll),
            Arc::clone(&registry),
            vec![environment("E", true)],
        );
        let response = proxy
            .forward_http("E", "containers", get_request("/api/environments/E/containers"))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_environment_is_404_disabled_is_400() {
        let proxy = proxy_with(
            Arc::new(AllowAll),
            Arc::new(TunnelRegistry::new()),
            vec![environment("D", false)],
        );
        let response = proxy
            .forward_http("missing", "containers", get_request("/x"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = proxy.forward_http("D", "containers", get_request("/x")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tunneled_request_rewrites_path_and_injects_token() {
        let registry = Arc::new(TunnelRegistry::new());
        let channel = MockChannel::new();
        let tunnel = Arc::new(AgentTunnel::new("E", channel.clone()));
        registry.register(Arc::clone(&tunnel)).await;

        let proxy = proxy_with(
            Arc::new(AllowAll),
            Arc::clone(&registry),
            vec![environment("E", true)],
        );

        // Answer the forwarded envelope as the agent would.
        let responder = {
            let channel = channel.clone();
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move {
                let sent = loop {
                    if let Some(message) = channel.last_sent() {
                        break message;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                };
                let TunnelPayload::Request { path, headers, .. } = &sent.payload else {
                    panic!("expected request envelope, got {}", sent.kind());
                };
                assert_eq!(path, "/api/environments/local/system/health");
                assert_eq!(
                    headers.get(API_KEY_HEADER).map(String::as_str),
                    Some("env-token")
                );
                // Hop-by-hop headers never cross the tunnel.
                assert!(!headers.contains_key("connection"));
                tunnel.deliver_response(TunnelMessage::reply(
                    sent.id,
                    TunnelPayload::Response {
                        status: 200,
                        headers: Headers::new(),
                        body: b"ok".to_vec(),
                    },
                ));
            })
        };

        let response = proxy
            .forward_http(
                "E",
                "system/health",
                get_request("/api/environments/E/system/health"),
            )
            .await;
        responder.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn closed_tunnel_falls_back_to_direct_path() {
        let registry = Arc::new(TunnelRegistry::new());
        let channel = MockChannel::new();
        let tunnel = Arc::new(AgentTunnel::new("E", channel.clone()));
        registry.register(Arc::clone(&tunnel)).await;
        tunnel.close().await;

        // With the tunnel closed the registry yields nothing and the proxy
        // dials api_url directly; the unreachable host surfaces as 502.
        let proxy = proxy_with(
            Arc::new(AllowAll),
            Arc::clone(&registry),
            vec![Environment {
                api_url: "http://127.0.0.1:1".to_string(),
                ..environment("E", true)
            }],
        );
        let response = proxy
            .forward_http("E", "system/health", get_request("/x"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
