//! Header policy applied when requests and responses cross a hop.
//!
//! Names are compared case-insensitively; envelope header maps keep
//! lowercase names so the policy functions can compare directly.

use crate::message::Headers;

/// Agent token header accepted at every tunnel edge.
pub const AGENT_TOKEN_HEADER: &str = "x-arcane-agent-token";

/// Alternative auth header, equivalent to [`AGENT_TOKEN_HEADER`].
pub const API_KEY_HEADER: &str = "x-api-key";

/// Internal marker set on tunneled responses whose body arrives as
/// stream-data frames. Stripped before the response is exposed.
pub const TUNNEL_STREAM_HEADER: &str = "x-arcane-tunnel-stream";

/// Hop-by-hop headers stripped in both directions when proxying.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Handshake headers filtered out when dialing a local WebSocket on behalf
/// of a tunneled `ws-start`; the local dial performs its own handshake.
pub const WS_HANDSHAKE_HEADERS: [&str; 5] = [
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "upgrade",
    "connection",
];

/// Whether `name` is a hop-by-hop header.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether `name` belongs to the WebSocket handshake.
pub fn is_ws_handshake(name: &str) -> bool {
    WS_HANDSHAKE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Removes every hop-by-hop header from `headers` in place.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    headers.retain(|name, _| !is_hop_by_hop(name));
}

/// Returns a copy of `headers` without WebSocket handshake headers.
pub fn without_ws_handshake(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !is_ws_handshake(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Injects the agent auth headers carrying `token`, overwriting any caller
/// supplied values so the receiving auth layer sees exactly one identity.
pub fn inject_agent_token(headers: &mut Headers, token: &str) {
    headers.insert(AGENT_TOKEN_HEADER.to_string(), token.to_string());
    headers.insert(API_KEY_HEADER.to_string(), token.to_string());
}

/// Extracts the agent token from either accepted auth header, trimmed.
pub fn extract_agent_token(headers: &Headers) -> Option<String> {
    [AGENT_TOKEN_HEADER, API_KEY_HEADER]
        .iter()
        .filter_map(|name| headers.get(*name))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_every_hop_by_hop_header() {
        let mut headers = Headers::new();
        headers.insert("connection".into(), "keep-alive".into());
        headers.insert("keep-alive".into(), "timeout=5".into());
        headers.insert("transfer-encoding".into(), "chunked".into());
        headers.insert("content-type".into(), "application/json".into());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn filters_handshake_headers_for_local_dial() {
        let mut headers = Headers::new();
        headers.insert("sec-websocket-key".into(), "abc".into());
        headers.insert("sec-websocket-version".into(), "13".into());
        headers.insert("upgrade".into(), "websocket".into());
        headers.insert("cookie".into(), "session=1".into());
        let filtered = without_ws_handshake(&headers);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("cookie"));
    }

    #[test]
    fn token_extraction_trims_and_falls_back() {
        let mut headers = Headers::new();
        headers.insert(API_KEY_HEADER.into(), "  token-2  ".into());
        assert_eq!(extract_agent_token(&headers).as_deref(), Some("token-2"));

        headers.insert(AGENT_TOKEN_HEADER.into(), "token-1".into());
        assert_eq!(extract_agent_token(&headers).as_deref(), Some("token-1"));

        headers.insert(AGENT_TOKEN_HEADER.into(), "   ".into());
        // Blank primary header falls through to the API key.
        assert_eq!(extract_agent_token(&headers).as_deref(), Some("token-2"));
    }

    #[test]
    fn inject_overwrites_caller_identity() {
        let mut headers = Headers::new();
        headers.insert(API_KEY_HEADER.into(), "spoofed".into());
        inject_agent_token(&mut headers, "real");
        assert_eq!(headers.get(AGENT_TOKEN_HEADER).unwrap(), "real");
        assert_eq!(headers.get(API_KEY_HEADER).unwrap(), "real");
    }
}
