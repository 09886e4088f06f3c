use async_trait::async_trait;
use futures::Stream;

use crate::{error::TransportError, model::JsonRpcMessage};

pub mod stdio;
pub mod streamable_http_server;
pub use stdio::StdioTransport;

/// A trait representing a transport layer for JSON-RPC messages.
///
/// The inbound side is a stream of decoded envelopes (or decode failures);
/// the outbound side is a single write primitive. The protocol engine's run
/// loop is written against this trait, so the pipe transport and the
/// per-session HTTP adapter are interchangeable underneath it.
#[async_trait]
pub trait Transport: Stream<Item = Result<JsonRpcMessage, TransportError>> {
    /// Writes a JSON-RPC message to the transport.
    async fn write_message(&mut self, message: JsonRpcMessage) -> Result<(), TransportError>;
}
