//! The protocol-engine run loop.
//!
//! [`Server`] pulls inbound envelopes off a [`Transport`], dispatches each
//! request to the business-logic service, and writes the response back in
//! completion order. It is deliberately single-threaded-cooperative: one
//! request is in flight at a time, which is what lets the HTTP session layer
//! correlate responses to blocked callers by arrival order alone.

use tower_service::Service;

use crate::{
    error::{BoxError, ServerError, TransportError},
    model::{ErrorData, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, JsonRpcVersion2_0},
    transport::Transport,
};

/// Drives a business-logic service over a transport until the inbound side
/// is exhausted.
pub struct Server<S> {
    service: S,
}

impl<S> Server<S>
where
    S: Service<JsonRpcRequest, Response = JsonRpcResponse> + Send,
    S::Error: Into<BoxError>,
    S::Future: Send,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub async fn run<T>(self, mut transport: T) -> Result<(), ServerError>
    where
        T: Transport + Unpin,
    {
        use futures::StreamExt;
        let mut service = self.service;

        tracing::debug!("protocol engine started");
        while let Some(msg_result) = transport.next().await {
            match msg_result {
                Ok(JsonRpcMessage::Request(request)) => {
                    let id = request.id.clone();
                    tracing::debug!(request_id = %id, method = %request.method, "dispatching request");

                    let response = match service.call(request).await {
                        Ok(response) => response,
                        Err(e) => {
                            let message = e.into().to_string();
                            tracing::error!(request_id = %id, error = %message, "request handler failed");
                            JsonRpcResponse {
                                jsonrpc: JsonRpcVersion2_0,
                                id,
                                result: None,
                                error: Some(ErrorData::internal_error(message)),
                            }
                        }
                    };

                    transport
                        .write_message(JsonRpcMessage::Response(response))
                        .await?;
                }
                Ok(_) => {
                    // Notifications and stray responses are transported but
                    // produce nothing on this loop.
                    tracing::debug!("skipping non-request message");
                }
                Err(e) => {
                    // Decode failures from line-oriented transports become
                    // well-formed error envelopes rather than loop failures.
                    let error = match &e {
                        TransportError::Json(_)
                        | TransportError::Utf8(_)
                        | TransportError::InvalidMessage(_) => ErrorData::parse_error(e.to_string()),
                        TransportError::Io(_) => ErrorData::internal_error(e.to_string()),
                    };
                    transport
                        .write_message(JsonRpcMessage::error(None, error))
                        .await?;
                }
            }
        }

        Ok(())
    }
}
