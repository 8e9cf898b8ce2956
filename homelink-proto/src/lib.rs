//! Wire protocol shared by the HomeLink broker and agent.
//!
//! Every tunnel message is one JSON object per WebSocket frame with a
//! top-level `type` tag. Bodies travel base64-encoded so binary payloads
//! survive the JSON framing.

pub mod error;
pub mod message;

pub use error::{ErrorCategory, ErrorCode};
pub use message::{
    decode, encode, sanitize_request_headers, sanitize_response_headers, ErrorFrame, Heartbeat,
    Message, ProtoError, RequestFrame, ResponseFrame,
};

/// Default maximum size of a single wire frame (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;
