//! Unified error types for the Arcane edge plane.
//!
//! Transport-level errors live in [`TunnelError`]; the edge proxy maps its
//! own failures onto HTTP statuses via [`ProxyError::status`].

use thiserror::Error;

/// Errors that can occur on a tunnel connection.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// The connection was closed before or during the operation.
    #[error("tunnel connection closed")]
    Closed,

    /// Dialing the remote side failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectionFailed {
        /// The URL or address that failed to connect.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// The peer did not present a valid agent token.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// A frame could not be written.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// A frame could not be read.
    #[error("failed to receive frame: {0}")]
    ReceiveFailed(String),

    /// Encoding or decoding an envelope failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A pending request ran out of time.
    #[error("tunnel request timed out")]
    Timeout,

    /// The caller's context was cancelled while waiting.
    #[error("tunnel request cancelled")]
    Cancelled,

    /// Event publishing was attempted with no agent tunnel connected.
    #[error("no active tunnel")]
    NoActiveTunnel,
}

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors surfaced by the edge-aware proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The caller failed session validation.
    #[error("unauthorized")]
    Unauthorized,

    /// No environment with the requested id exists.
    #[error("environment '{0}' not found")]
    EnvironmentNotFound(String),

    /// The environment exists but is disabled.
    #[error("environment '{0}' is disabled")]
    EnvironmentDisabled(String),

    /// The upstream hop failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The upstream hop timed out.
    #[error("upstream timeout")]
    Timeout,

    /// A tunnel-level failure while forwarding.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl ProxyError {
    /// HTTP status the error maps to at the manager edge.
    pub fn status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::EnvironmentNotFound(_) => 404,
            Self::EnvironmentDisabled(_) => 400,
            Self::Timeout | Self::Tunnel(TunnelError::Timeout) => 504,
            Self::Upstream(_) | Self::Tunnel(_) => 502,
        }
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors from the streaming fan-out plane.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The upstream source ended or failed.
    #[error("stream source closed: {0}")]
    SourceClosed(String),

    /// The client socket went away.
    #[error("client socket closed")]
    SocketClosed,

    /// The hub rejected input because its broadcast queue was full.
    #[error("broadcast queue full")]
    Backpressure,
}

/// Result type for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_error_status_mapping() {
        assert_eq!(ProxyError::Unauthorized.status(), 401);
        assert_eq!(ProxyError::EnvironmentNotFound("e".into()).status(), 404);
        assert_eq!(ProxyError::EnvironmentDisabled("e".into()).status(), 400);
        assert_eq!(ProxyError::Timeout.status(), 504);
        assert_eq!(ProxyError::Tunnel(TunnelError::Timeout).status(), 504);
        assert_eq!(ProxyError::Tunnel(TunnelError::Closed).status(), 502);
        assert_eq!(ProxyError::Upstream("boom".into()).status(), 502);
    }
}
