//! The tunnel message envelope shared by both wire transports.
//!
//! A [`TunnelMessage`] pairs a correlation id with one of a closed set of
//! payload variants. The WebSocket transport serializes it as one JSON text
//! frame per envelope; the framed RPC transport carries the same type as one
//! bincode frame. Both wires round-trip to the identical in-memory value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header map carried inside envelopes. One value per name; names are kept
/// lowercase so lookups and round-trips are deterministic.
pub type Headers = BTreeMap<String, String>;

/// Body bytes, base64-encoded on human-readable wires and raw otherwise.
mod body {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            STANDARD
                .decode(text.as_bytes())
                .map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer)
        }
    }
}

/// A single envelope on a tunnel.
///
/// The `id` is generated by the sender of a request (or stream opener) and
/// must be echoed byte-for-byte by every response and stream frame that
/// answers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub id: String,
    pub payload: TunnelPayload,
}

/// The closed set of payload variants multiplexed on a tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelPayload {
    /// An HTTP request forwarded from the manager to an agent.
    Request {
        method: String,
        path: String,
        query: String,
        headers: Headers,
        #[serde(with = "body")]
        body: Vec<u8>,
    },
    /// An HTTP response, either complete or the header frame of a stream.
    Response {
        status: u16,
        headers: Headers,
        #[serde(with = "body")]
        body: Vec<u8>,
    },
    Heartbeat,
    HeartbeatAck,
    /// A chunk of a streaming response body.
    StreamData {
        #[serde(with = "body")]
        body: Vec<u8>,
    },
    /// Terminal frame of a streaming response.
    StreamEnd,
    /// Opens a proxied WebSocket on the agent.
    WsStart {
        path: String,
        query: String,
        headers: Headers,
    },
    /// One WebSocket frame in either direction.
    WsData {
        kind: WsFrameKind,
        #[serde(with = "body")]
        payload: Vec<u8>,
    },
    /// Closes a proxied WebSocket in either direction.
    WsClose,
    /// First message sent by an agent on either transport.
    Register {
        token: String,
        /// Metadata pairs mirroring the HTTP auth headers, lowercase names.
        metadata: Headers,
    },
    /// The manager's answer to `Register`.
    RegisterResponse {
        accepted: bool,
        environment_id: String,
        error: Option<String>,
    },
    /// An application event published by an agent.
    Event(EventPayload),
}

/// WebSocket frame kinds carried through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WsFrameKind {
    Text,
    Binary,
}

/// An application event forwarded over a tunnel.
///
/// Optional fields stay present on the wire (as nulls in JSON) so the
/// envelope round-trips identically through the non-self-describing
/// binary framing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    pub severity: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    /// Opaque JSON blob attached by the publisher.
    #[serde(default)]
    pub metadata: Option<String>,
}

impl TunnelMessage {
    /// Creates an envelope with a fresh correlation id.
    pub fn new(payload: TunnelPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
        }
    }

    /// Creates an envelope answering `id`, preserving it byte-for-byte.
    pub fn reply(id: impl Into<String>, payload: TunnelPayload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(TunnelPayload::Heartbeat)
    }

    pub fn heartbeat_ack(id: impl Into<String>) -> Self {
        Self::reply(id, TunnelPayload::HeartbeatAck)
    }

    /// Short name of the payload variant, for logging.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

impl TunnelPayload {
    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat-ack",
            Self::StreamData { .. } => "stream-data",
            Self::StreamEnd => "stream-end",
            Self::WsStart { .. } => "ws-start",
            Self::WsData { .. } => "ws-data",
            Self::WsClose => "ws-close",
            Self::Register { .. } => "register",
            Self::RegisterResponse { .. } => "register-response",
            Self::Event(_) => "event",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> TunnelMessage {
        let mut headers = Headers::new();
        headers.insert("accept".into(), "application/json".into());
        headers.insert("x-api-key".into(), "secret".into());
        TunnelMessage::new(TunnelPayload::Request {
            method: "POST".into(),
            path: "/api/environments/0/containers".into(),
            query: "all=true".into(),
            headers,
            body: vec![0, 159, 146, 150],
        })
    }

    #[test]
    fn json_round_trip_is_identical() {
        let msg = sample_request();
        let text = serde_json::to_string(&msg).unwrap();
        let back: TunnelMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn bincode_round_trip_is_identical() {
        let msg = sample_request();
        let bytes = bincode::serialize(&msg).unwrap();
        let back: TunnelMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn both_wires_agree_on_semantics() {
        let msg = TunnelMessage::new(TunnelPayload::Event(EventPayload {
            event_type: "container.start".into(),
            severity: "info".into(),
            title: "Container started".into(),
            description: "nginx came up".into(),
            resource_type: Some("container".into()),
            resource_id: Some("abc123".into()),
            resource_name: None,
            actor: None,
            metadata: Some(r#"{"image":"nginx:latest"}"#.into()),
        }));
        let via_json: TunnelMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        let via_bincode: TunnelMessage =
            bincode::deserialize(&bincode::serialize(&msg).unwrap()).unwrap();
        assert_eq!(via_json, via_bincode);
    }

    #[test]
    fn body_is_base64_on_json() {
        let msg = TunnelMessage::reply(
            "req-1",
            TunnelPayload::StreamData {
                body: b"hello".to_vec(),
            },
        );
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("aGVsbG8="), "expected base64 body in {text}");
    }

    #[test]
    fn reply_preserves_id() {
        let msg = sample_request();
        let reply = TunnelMessage::reply(
            msg.id.clone(),
            TunnelPayload::Response {
                status: 200,
                headers: Headers::new(),
                body: b"ok".to_vec(),
            },
        );
        assert_eq!(msg.id, reply.id);
    }
}
