//! Streamable HTTP server transport.
//!
//! One session endpoint speaks three verbs: POST submits a JSON-RPC request
//! and blocks for the matching response, GET attaches a Server-Sent-Events
//! stream, DELETE tears the session down. The [`session`] module holds the
//! multiplexer that makes this look like a persistent duplex connection to
//! the protocol engine; the [`axum`] module holds the HTTP handlers.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub mod axum;
pub mod normalize;
pub mod session;

pub use self::axum::{StreamableHttpServer, StreamableHttpService};
pub use self::normalize::{NormalizedRequest, normalize};
pub use self::session::{Session, SessionRegistry, SessionTransport};

/// Canonical session-id response/request header.
pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
/// Echo of the client-supplied legacy query token, for clients that can
/// read response headers after all.
pub const HEADER_LEGACY_SESSION_ID: &str = "Mcp-Legacy-Session-Id";
/// Query parameter carrying the legacy session token.
pub const QUERY_SESSION_ID: &str = "sessionId";

pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub const JSON_MIME_TYPE: &str = "application/json";

/// Control methods the boundary special-cases before a session exists.
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PING: &str = "ping";

pub const DEFAULT_AUTO_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Comment frame written the moment an SSE sink attaches, so the client can
/// tell the stream is live before any data arrives.
pub(crate) const SSE_COMMENT_CONNECTED: &[u8] = b": connected\n\n";
pub(crate) const SSE_COMMENT_PING: &[u8] = b":ping\n\n";

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// Encode one outbound payload as an SSE `data:` frame. Payload bytes that
/// are not valid UTF-8 are re-encoded as base64 so the frame stays well
/// formed.
pub(crate) fn sse_event_frame(payload: &[u8]) -> Bytes {
    use base64::Engine;
    match std::str::from_utf8(payload) {
        Ok(text) => Bytes::from(format!("data: {text}\n\n")),
        Err(_) => Bytes::from(format!(
            "data: {}\n\n",
            base64::engine::general_purpose::STANDARD.encode(payload)
        )),
    }
}

#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    pub bind: SocketAddr,
    /// The session endpoint path, e.g. `/mcp`.
    pub path: String,
    pub ct: CancellationToken,
    /// Interval for `:ping` comment frames on attached SSE streams; `None`
    /// disables keep-alive.
    pub sse_keep_alive: Option<Duration>,
}

impl StreamableHttpServerConfig {
    /// Config with a fresh cancellation token and the default keep-alive
    /// interval.
    pub fn new(bind: SocketAddr, path: impl Into<String>) -> Self {
        Self {
            bind,
            path: path.into(),
            ct: CancellationToken::new(),
            sse_keep_alive: Some(DEFAULT_AUTO_PING_INTERVAL),
        }
    }
}
