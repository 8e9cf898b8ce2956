//! JSON frame schema and codec for the tunnel WebSocket.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, ErrorCode};

/// Hop-by-hop headers that must never cross the tunnel.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers stripped before forwarding to the agent.
const SENSITIVE: &[&str] = &["authorization", "cookie"];

/// One tunnel message, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    HttpRequest(RequestFrame),
    HttpResponse(ResponseFrame),
    Ping(Heartbeat),
    Pong(Heartbeat),
    Error(ErrorFrame),
}

/// HTTP request forwarded broker → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Bytes::is_empty", with = "body_base64")]
    pub body: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// HTTP response returned agent → broker; `id` echoes the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Bytes::is_empty", with = "body_base64")]
    pub body: Bytes,
}

/// Ping/pong payload. A pong echoes the ping id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: String,
    /// Sender clock, unix milliseconds.
    pub timestamp: u64,
}

/// Error frame; carries `id` when it answers a specific request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub code: ErrorCode,
    pub message: String,
    pub category: ErrorCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorFrame {
    /// Build an error frame for `code`; the category is derived.
    pub fn new(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            code,
            message: message.into(),
            category: code.category(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

impl Message {
    /// Request id this message correlates to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::HttpRequest(r) => Some(&r.id),
            Self::HttpResponse(r) => Some(&r.id),
            Self::Error(e) => e.id.as_deref(),
            Self::Ping(_) | Self::Pong(_) => None,
        }
    }
}

/// Decode failure. `FrameTooLarge` and `Malformed` close the session;
/// `UnknownType` is logged and the frame ignored.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtoError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Self::Malformed(_) => ErrorCode::BadFrame,
            Self::UnknownType(_) => ErrorCode::UnknownType,
        }
    }
}

const KNOWN_TYPES: &[&str] = &["http_request", "http_response", "ping", "pong", "error"];

/// Wall clock in unix milliseconds, for heartbeat timestamps.
pub fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serialize a message to its wire form.
pub fn encode(msg: &Message) -> String {
    serde_json::to_string(msg).expect("wire messages serialize to JSON")
}

/// Parse one wire frame, enforcing the frame-size limit.
pub fn decode(data: &[u8], max_frame_bytes: usize) -> Result<Message, ProtoError> {
    if data.len() > max_frame_bytes {
        return Err(ProtoError::FrameTooLarge {
            size: data.len(),
            max: max_frame_bytes,
        });
    }
    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| ProtoError::Malformed(e.to_string()))?;
    let ty = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtoError::Malformed("missing type field".to_owned()))?;
    if !KNOWN_TYPES.contains(&ty) {
        return Err(ProtoError::UnknownType(ty.to_owned()));
    }
    serde_json::from_value(value).map_err(|e| ProtoError::Malformed(e.to_string()))
}

/// Lowercase keys and drop hop-by-hop plus sensitive headers from an
/// inbound request before it crosses the tunnel.
pub fn sanitize_request_headers<'a, I>(headers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter_map(|(k, v)| {
            let k = k.to_ascii_lowercase();
            if HOP_BY_HOP.contains(&k.as_str()) || SENSITIVE.contains(&k.as_str()) {
                None
            } else {
                Some((k, v.to_owned()))
            }
        })
        .collect()
}

/// Lowercase keys and drop hop-by-hop headers from a response.
pub fn sanitize_response_headers<'a, I>(headers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter_map(|(k, v)| {
            let k = k.to_ascii_lowercase();
            if HOP_BY_HOP.contains(&k.as_str()) {
                None
            } else {
                Some((k, v.to_owned()))
            }
        })
        .collect()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_FRAME_BYTES;

    fn request() -> Message {
        Message::HttpRequest(RequestFrame {
            id: "r1".to_owned(),
            method: "POST".to_owned(),
            path: "/v1/chat/completions".to_owned(),
            headers: HashMap::from([("content-type".to_owned(), "application/json".to_owned())]),
            body: Bytes::from_static(b"{\"model\":\"local\"}"),
            timeout_ms: Some(15_000),
        })
    }

    #[test]
    fn round_trips_every_variant() {
        let messages = vec![
            request(),
            Message::HttpResponse(ResponseFrame {
                id: "r1".to_owned(),
                status: 200,
                headers: HashMap::from([("content-type".to_owned(), "text/plain".to_owned())]),
                body: Bytes::from_static(b"pong"),
            }),
            Message::Ping(Heartbeat {
                id: "p1".to_owned(),
                timestamp: 1_720_000_000_000,
            }),
            Message::Pong(Heartbeat {
                id: "p1".to_owned(),
                timestamp: 1_720_000_000_500,
            }),
            Message::Error(
                ErrorFrame::new(Some("r2".to_owned()), ErrorCode::UpstreamTimeout, "timed out")
                    .with_retry_after(5),
            ),
        ];
        for msg in messages {
            let wire = encode(&msg);
            let back = decode(wire.as_bytes(), DEFAULT_MAX_FRAME_BYTES).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn empty_body_is_absent_on_the_wire() {
        let msg = Message::HttpResponse(ResponseFrame {
            id: "r9".to_owned(),
            status: 204,
            headers: HashMap::new(),
            body: Bytes::new(),
        });
        let wire = encode(&msg);
        assert!(!wire.contains("\"body\""));
        let back = decode(wire.as_bytes(), DEFAULT_MAX_FRAME_BYTES).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn binary_body_survives_base64() {
        let raw: Vec<u8> = (0u8..=255).collect();
        let msg = Message::HttpResponse(ResponseFrame {
            id: "bin".to_owned(),
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from(raw.clone()),
        });
        let back = decode(encode(&msg).as_bytes(), DEFAULT_MAX_FRAME_BYTES).unwrap();
        match back {
            Message::HttpResponse(r) => assert_eq!(r.body.as_ref(), raw.as_slice()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn frame_size_limit_is_exact() {
        let wire = encode(&request());
        assert!(decode(wire.as_bytes(), wire.len()).is_ok());
        let err = decode(wire.as_bytes(), wire.len() - 1).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { .. }));
        assert_eq!(err.code(), ErrorCode::FrameTooLarge);
    }

    #[test]
    fn unknown_type_is_distinct_from_malformed() {
        let unknown = br#"{"type":"shutdown","id":"x"}"#;
        assert!(matches!(
            decode(unknown, DEFAULT_MAX_FRAME_BYTES),
            Err(ProtoError::UnknownType(t)) if t == "shutdown"
        ));
        assert!(matches!(
            decode(b"{not json", DEFAULT_MAX_FRAME_BYTES),
            Err(ProtoError::Malformed(_))
        ));
        assert!(matches!(
            decode(br#"{"type":"ping"}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn request_sanitizer_strips_hop_by_hop_and_sensitive() {
        let headers = sanitize_request_headers([
            ("Content-Type", "application/json"),
            ("Connection", "keep-alive"),
            ("Transfer-Encoding", "chunked"),
            ("Authorization", "Bearer secret"),
            ("Cookie", "session=1"),
            ("X-Custom", "kept"),
        ]);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["x-custom"], "kept");
    }

    #[test]
    fn response_sanitizer_keeps_set_cookie() {
        let headers = sanitize_response_headers([
            ("Set-Cookie", "a=b"),
            ("Keep-Alive", "timeout=5"),
            ("Upgrade", "h2c"),
        ]);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["set-cookie"], "a=b");
    }
}
