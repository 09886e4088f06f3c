//! Session and transport layer for the Reminders MCP server.
//!
//! The business-logic handlers (reading and writing reminder lists) plug in
//! as a [`tower_service::Service`]; this crate supplies everything between
//! them and the client:
//!
//! - [`transport::StdioTransport`]: line-oriented pipe transport,
//! - [`transport::streamable_http_server`]: the HTTP transport, one session
//!   endpoint speaking POST (request/response), GET (Server-Sent-Events
//!   stream) and DELETE (teardown), multiplexed over per-client
//!   [`transport::streamable_http_server::Session`]s,
//! - [`Server`]: the per-connection protocol-engine run loop.

mod error;
pub use error::{BoxError, ServerError, SessionError, TransportError};

pub mod model;
pub mod server;
pub use server::Server;
pub mod transport;
pub use transport::{StdioTransport, Transport};
