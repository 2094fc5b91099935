//! # Arcane Core
//!
//! Message model and contracts shared by the Arcane edge plane: the tunnel
//! envelope carried by both wire transports, the channel contract they
//! implement, the proxy header policy, the environment model, and the
//! pending-request table the manager correlates responses through.

pub mod channel;
pub mod environment;
pub mod error;
pub mod headers;
pub mod message;
pub mod pending;

pub use channel::{TunnelChannel, is_expected_teardown_message};
pub use environment::{Environment, EnvironmentLookup, LOCAL_ENVIRONMENT_ALIAS, TokenResolver};
pub use error::{ProxyError, ProxyResult, StreamError, StreamResult, TunnelError, TunnelResult};
pub use headers::{
    AGENT_TOKEN_HEADER, API_KEY_HEADER, TUNNEL_STREAM_HEADER, extract_agent_token,
    inject_agent_token, is_hop_by_hop, is_ws_handshake, strip_hop_by_hop, without_ws_handshake,
};
pub use message::{EventPayload, Headers, TunnelMessage, TunnelPayload, WsFrameKind};
pub use pending::{Delivery, PendingRequests};
