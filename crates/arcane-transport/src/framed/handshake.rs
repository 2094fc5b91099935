//! First-contact registration on the RPC transport.
//!
//! The agent's first frame is always `register{token}`; the manager answers
//! `register-response` and only then treats the stream as a tunnel. A first
//! frame of any other kind, or EOF, closes the stream as unauthenticated.

use std::time::Duration;

use tracing::{debug, info, warn};

use arcane_core::{
    AGENT_TOKEN_HEADER, API_KEY_HEADER, Headers, TokenResolver, TunnelChannel, TunnelError,
    TunnelMessage, TunnelPayload, TunnelResult, extract_agent_token,
};

/// How long either side waits for the registration exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Agent side: announces `token` and waits for the manager's verdict.
/// Returns the environment id the manager resolved for this agent.
pub async fn register_agent(channel: &dyn TunnelChannel, token: &str) -> TunnelResult<String> {
    let mut metadata = Headers::new();
    metadata.insert(AGENT_TOKEN_HEADER.to_string(), token.to_string());
    metadata.insert(API_KEY_HEADER.to_string(), token.to_string());
    channel
        .send(&TunnelMessage::new(TunnelPayload::Register {
            token: token.to_string(),
            metadata,
        }))
        .await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.receive())
        .await
        .map_err(|_| TunnelError::Timeout)??;
    match reply.payload {
        TunnelPayload::RegisterResponse {
            accepted: true,
            environment_id,
            ..
        } => {
            info!(environment_id = %environment_id, "agent registration accepted");
            Ok(environment_id)
        }
        TunnelPayload::RegisterResponse {
            accepted: false,
            error,
            ..
        } => Err(TunnelError::Unauthenticated(
            error.unwrap_or_else(|| "registration rejected".to_string()),
        )),
        other => Err(TunnelError::Unauthenticated(format!(
            "expected register-response, got {}",
            other.kind()
        ))),
    }
}

/// Manager side: consumes the first frame, resolves the token, and answers.
/// On success the channel is a live tunnel for the returned environment id;
/// on failure the channel is closed before the error is returned.
pub async fn accept_agent(
    channel: &dyn TunnelChannel,
    resolver: &dyn TokenResolver,
) -> TunnelResult<String> {
    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.receive()).await {
        Ok(Ok(message)) => message,
        Ok(Err(err)) => {
            debug!(error = %err, "stream ended before registration");
            channel.close().await;
            return Err(TunnelError::Unauthenticated(
                "stream ended before registration".to_string(),
            ));
        }
        Err(_) => {
            channel.close().await;
            return Err(TunnelError::Unauthenticated(
                "registration timed out".to_string(),
            ));
        }
    };

    let (token, metadata) = match first.payload {
        TunnelPayload::Register { token, metadata } => (token, metadata),
        other => {
            warn!(kind = other.kind(), "first frame was not a register");
            channel.close().await;
            return Err(TunnelError::Unauthenticated(format!(
                "expected register, got {}",
                other.kind()
            )));
        }
    };

    // The token may arrive in the message body or as metadata mirroring the
    // HTTP auth headers; both are trimmed.
    let token = Some(token.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| extract_agent_token(&metadata));

    let environment_id = match token {
        Some(ref token) => resolver.resolve(token).await,
        None => None,
    };

    match environment_id {
        Some(environment_id) => {
            channel
                .send(&TunnelMessage::reply(
                    first.id,
                    TunnelPayload::RegisterResponse {
                        accepted: true,
                        environment_id: environment_id.clone(),
                        error: None,
                    },
                ))
                .await?;
            info!(environment_id = %environment_id, "agent tunnel registered");
            Ok(environment_id)
        }
        None => {
            let _ = channel
                .send(&TunnelMessage::reply(
                    first.id,
                    TunnelPayload::RegisterResponse {
                        accepted: false,
                        environment_id: String::new(),
                        error: Some("invalid agent token".to_string()),
                    },
                ))
                .await;
            channel.close().await;
            Err(TunnelError::Unauthenticated("invalid agent token".into()))
        }
    }
}
