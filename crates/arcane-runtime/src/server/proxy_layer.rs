//! Middleware that intercepts requests addressed to other environments
//! and hands them to the edge-aware proxy.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::{CONNECTION, UPGRADE};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::AppState;

pub async fn proxy_layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let Some((environment_id, remainder)) = split_environment_path(&path) else {
        return next.run(request).await;
    };
    if !state.proxy.should_forward(&environment_id, &remainder) {
        // Local environment or a management path: handled by this node.
        return next.run(request).await;
    }

    if is_websocket_upgrade(request.headers()) {
        let query = request.uri().query().map(str::to_string);
        let headers = request.headers().clone();
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string());
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => {
                state
                    .proxy
                    .forward_ws(&environment_id, &remainder, query, headers, client_ip, upgrade)
                    .await
            }
            Err(rejection) => rejection.into_response(),
        };
    }

    state
        .proxy
        .forward_http(&environment_id, &remainder, request)
        .await
}

/// Splits `/api/environments/{env_id}/rest...` into the environment id
/// and the remainder.
pub fn split_environment_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/api/environments/")?;
    match rest.split_once('/') {
        Some((environment_id, remainder)) if !environment_id.is_empty() => {
            Some((environment_id.to_string(), remainder.to_string()))
        }
        None if !rest.is_empty() => Some((rest.to_string(), String::new())),
        _ => None,
    }
}

/// Upgrade detection: an `Upgrade: websocket` header, or an `upgrade`
/// token in `Connection`.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
    upgrade || connection
}
