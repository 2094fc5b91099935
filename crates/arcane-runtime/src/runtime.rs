//! Node orchestration: binds the listeners, wires the tunnel plane, and
//! handles shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arcane_edge::{
    AgentConfig, AgentTunnelClient, LocalHandler, ResponseRecorder, TunnelHttpRequest,
    default_registry, run_rpc_listener, spawn_registry_sweep,
};

use crate::config::ArcaneConfig;
use crate::error::RuntimeResult;
use crate::server::{AppState, NodeServices, build_router};

/// A configured node, ready to run.
pub struct ArcaneRuntime {
    state: AppState,
    shutdown: CancellationToken,
}

impl ArcaneRuntime {
    /// Wires the node against the process-default tunnel registry.
    pub fn new(config: ArcaneConfig, services: NodeServices) -> Self {
        let state = AppState::new(config, services, default_registry());
        Self {
            state,
            shutdown: CancellationToken::new(),
        }
    }

    /// The node's router; exposed so embedders and tests can drive it
    /// without binding a socket.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Token cancelled when the runtime shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until interrupted. Initializes logging at the configured
    /// level, then spawns the registry sweep, the RPC tunnel listener
    /// (manager mode), and the agent tunnel client (agent mode) as
    /// configured.
    pub async fn run(&self) -> RuntimeResult<()> {
        let config = Arc::clone(&self.state.config);
        if !crate::logging::try_init(&config.logging) {
            debug!("tracing subscriber already installed, keeping it");
        }
        let listener = TcpListener::bind(&config.node.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, environment_id = %config.node.environment_id, "node listening");

        spawn_registry_sweep(Arc::clone(&self.state.registry), self.shutdown.clone());

        if !config.tunnel.rpc_listen_addr.trim().is_empty() {
            let rpc_listener = TcpListener::bind(&config.tunnel.rpc_listen_addr).await?;
            tokio::spawn(run_rpc_listener(
                rpc_listener,
                Arc::clone(&self.state.resolver),
                Arc::clone(&self.state.registry),
                Arc::clone(&self.state.callbacks),
                self.shutdown.clone(),
            ));
        }

        if config.tunnel.enabled {
            let agent = AgentTunnelClient::new(
                AgentConfig {
                    manager_ws_url: config.tunnel.manager_ws_url.clone(),
                    manager_rpc_addr: config.tunnel.manager_rpc_addr.clone(),
                    token: config.tunnel.token.clone(),
                    transport: config.tunnel.transport.into(),
                    local_listen_addr: config.node.listen_addr.clone(),
                    reconnect_delay: arcane_edge::agent::RECONNECT_DELAY,
                    heartbeat_interval: arcane_edge::agent::HEARTBEAT_INTERVAL,
                },
                RouterHandler::new(self.router()),
            );
            tokio::spawn(agent.run(self.shutdown.clone()));
        }

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        tokio::select! {
            served = axum::serve(listener, app) => served?,
            _ = self.shutdown.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                self.shutdown.cancel();
            }
        }

        self.state.registry.close_all().await;
        Ok(())
    }
}

/// Executes tunneled requests against the node's own router, streaming
/// the response body into the recorder chunk by chunk.
pub struct RouterHandler {
    router: Router,
}

impl RouterHandler {
    pub fn new(router: Router) -> Arc<Self> {
        Arc::new(Self { router })
    }
}

#[async_trait::async_trait]
impl LocalHandler for RouterHandler {
    async fn execute(&self, request: TunnelHttpRequest, recorder: &ResponseRecorder) {
        let uri = if request.query.is_empty() {
            request.path.clone()
        } else {
            format!("{}?{}", request.path, request.query)
        };
        let mut builder = axum::http::Request::builder()
            .method(request.method.as_str())
            .uri(uri);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let http_request = match builder.body(Body::from(request.body)) {
            Ok(http_request) => http_request,
            Err(err) => {
                warn!(error = %err, "tunneled request not reconstructable");
                recorder.set_status(400).await;
                let _ = recorder.write(err.to_string().as_bytes()).await;
                return;
            }
        };

        let response = match tower::ServiceExt::oneshot(self.router.clone(), http_request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        };

        recorder.set_status(response.status().as_u16()).await;
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                recorder.insert_header(name.as_str(), value).await;
            }
        }
        let mut body = response.into_body().into_data_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    if recorder.write(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "local response body ended early");
                    break;
                }
            }
        }
    }
}
