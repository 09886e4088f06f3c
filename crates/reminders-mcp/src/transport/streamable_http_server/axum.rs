//! Axum HTTP boundary for the streamable HTTP server transport.

use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_service::Service;
use tracing::Instrument;

use super::{
    EVENT_STREAM_MIME_TYPE, HEADER_LEGACY_SESSION_ID, HEADER_SESSION_ID, JSON_MIME_TYPE,
    METHOD_INITIALIZE, METHOD_PING, SSE_COMMENT_PING, StreamableHttpServerConfig,
    normalize::normalize,
    session::SessionRegistry,
};
use crate::{
    error::{BoxError, SessionError},
    model::{ErrorData, JsonRpcMessage, RequestId},
};

/// The HTTP-facing service: config, session registry, and the factory that
/// produces one fresh business-logic service per session.
pub struct StreamableHttpService<S> {
    pub config: StreamableHttpServerConfig,
    registry: Arc<SessionRegistry>,
    service_factory: Arc<dyn Fn() -> Result<S, io::Error> + Send + Sync>,
}

impl<S> Clone for StreamableHttpService<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            service_factory: self.service_factory.clone(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

impl<S> StreamableHttpService<S>
where
    S: Service<crate::model::JsonRpcRequest, Response = crate::model::JsonRpcResponse>
        + Send
        + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
{
    pub fn new(
        service_factory: impl Fn() -> Result<S, io::Error> + Send + Sync + 'static,
        config: StreamableHttpServerConfig,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            service_factory: Arc::new(service_factory),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Routes POST/GET/DELETE on the configured session endpoint.
    pub fn router(self) -> Router {
        let path = self.config.path.clone();
        let service = Arc::new(self);
        Router::new()
            .route(
                &path,
                get(Self::handle_get)
                    .post(Self::handle_post)
                    .delete(Self::handle_delete),
            )
            .with_state(service)
    }

    async fn handle_post(
        State(service): State<Arc<Self>>,
        Query(SessionQuery {
            session_id: query_token,
        }): Query<SessionQuery>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let normalized = match normalize(&body) {
            Ok(normalized) => normalized,
            Err(error) => {
                tracing::debug!(error = %error, "rejecting unparsable request body");
                return json_rpc_error_response(None, error);
            }
        };
        let Some(method) = normalized.method.clone() else {
            return json_rpc_error_response(
                Some(normalized.id),
                ErrorData::invalid_request("missing method"),
            );
        };

        let header_token = headers
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok());
        let query_token = query_token.as_deref();

        let session = match service
            .registry
            .resolve(header_token, query_token)
            .await
        {
            Some(session) => session,
            None if method == METHOD_PING => {
                // Keepalive probe from a client that polls before
                // initializing; answered without touching the registry.
                tracing::debug!("answering ping without a session");
                return json_message_response(
                    JsonRpcMessage::response(normalized.id, serde_json::json!({})),
                    None,
                    None,
                );
            }
            None if method != METHOD_INITIALIZE => {
                return json_rpc_error_response(
                    Some(normalized.id),
                    ErrorData::invalid_request("session not initialized"),
                );
            }
            None => {
                let engine = match (service.service_factory)() {
                    Ok(engine) => engine,
                    Err(e) => {
                        tracing::error!(error = %e, "service factory failed");
                        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create service")
                            .into_response();
                    }
                };
                match service.registry.create_session(engine, query_token).await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to start session");
                        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to start session")
                            .into_response();
                    }
                }
            }
        };

        if let Err(e) = session.submit(normalized.message).await {
            return session_error_response(e);
        }
        match session.next_response().await {
            Ok(message) => {
                json_message_response(message, Some(session.id().as_ref()), query_token)
            }
            Err(e) => session_error_response(e),
        }
    }

    async fn handle_get(State(service): State<Arc<Self>>, headers: HeaderMap) -> Response {
        let Some(session_token) = headers
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        else {
            return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
        };
        let Some(session) = service.registry.resolve(Some(session_token), None).await else {
            return (StatusCode::NOT_FOUND, "Session not found").into_response();
        };

        tracing::debug!(session_id = %session.id(), "GET request for SSE stream");

        let (tx, rx) = mpsc::unbounded_channel();
        if session.attach_stream(tx).await.is_err() {
            return (StatusCode::NOT_FOUND, "Session not found").into_response();
        }

        let keep_alive = service.config.sse_keep_alive;
        let stream = async_stream::stream! {
            let mut frames = UnboundedReceiverStream::new(rx);
            let mut keep_alive_timer = keep_alive.map(|duration| {
                tokio::time::interval_at(tokio::time::Instant::now() + duration, duration)
            });

            loop {
                tokio::select! {
                    frame = frames.next() => {
                        match frame {
                            Some(frame) => yield Ok::<_, io::Error>(frame),
                            None => break,
                        }
                    }
                    _ = async {
                        match keep_alive_timer.as_mut() {
                            Some(timer) => {
                                timer.tick().await;
                            }
                            None => {
                                std::future::pending::<()>().await;
                            }
                        }
                    } => {
                        yield Ok(Bytes::from_static(SSE_COMMENT_PING));
                    }
                }
            }
        };

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, EVENT_STREAM_MIME_TYPE)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header(HEADER_SESSION_ID, session.id().as_ref())
            .body(Body::from_stream(stream));
        match response {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "failed to build SSE response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    async fn handle_delete(
        State(service): State<Arc<Self>>,
        Query(SessionQuery {
            session_id: query_token,
        }): Query<SessionQuery>,
        headers: HeaderMap,
    ) -> Response {
        let header_token = headers
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok());

        match service
            .registry
            .close(header_token, query_token.as_deref())
            .await
        {
            Ok(session_id) => {
                tracing::debug!(session_id = %session_id, "session closed over HTTP");
                let response = Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .header(HEADER_SESSION_ID, session_id.as_ref())
                    .body(Body::empty());
                match response {
                    Ok(response) => response,
                    Err(_) => StatusCode::NO_CONTENT.into_response(),
                }
            }
            Err(_) => (StatusCode::NOT_FOUND, "Session not found").into_response(),
        }
    }
}

/// 200 response carrying a serialized JSON-RPC message, plus the session
/// headers when a session was involved.
fn json_message_response(
    message: JsonRpcMessage,
    session_id: Option<&str>,
    legacy_token: Option<&str>,
) -> Response {
    let body = serde_json::to_vec(&message).unwrap_or_else(|_| b"{}".to_vec());
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, JSON_MIME_TYPE);
    if let Some(session_id) = session_id {
        builder = builder.header(HEADER_SESSION_ID, session_id);
    }
    if let Some(token) = legacy_token {
        builder = builder.header(HEADER_LEGACY_SESSION_ID, token);
    }
    match builder.body(Body::from(body)) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "failed to build JSON response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Parse and protocol-misuse failures stay HTTP 200: the client always gets
/// a parseable JSON-RPC error envelope.
fn json_rpc_error_response(id: Option<RequestId>, error: ErrorData) -> Response {
    json_message_response(JsonRpcMessage::error(id, error), None, None)
}

/// Session-level failures surface at the HTTP layer, not as JSON-RPC errors.
fn session_error_response(error: SessionError) -> Response {
    match error {
        SessionError::ConnectionClosed
        | SessionError::NotFound
        | SessionError::NotStarted => (StatusCode::NOT_FOUND, "Session not found").into_response(),
        SessionError::Engine(message) => {
            tracing::error!(error = %message, "request failed on engine error");
            (StatusCode::INTERNAL_SERVER_ERROR, "Protocol engine failed").into_response()
        }
        SessionError::AlreadyStarted => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Session already started").into_response()
        }
    }
}

/// A running streamable HTTP server bound to a local address.
pub struct StreamableHttpServer {
    pub config: StreamableHttpServerConfig,
    registry: Arc<SessionRegistry>,
}

impl StreamableHttpServer {
    /// Bind the configured address and serve the session endpoint until the
    /// cancellation token fires. The returned config carries the actual
    /// bound address (important when the port was 0).
    pub async fn serve_with_config<S, F>(
        mut config: StreamableHttpServerConfig,
        service_factory: F,
    ) -> io::Result<Self>
    where
        S: Service<crate::model::JsonRpcRequest, Response = crate::model::JsonRpcResponse>
            + Send
            + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send,
        F: Fn() -> Result<S, io::Error> + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        config.bind = listener.local_addr()?;

        let service = StreamableHttpService::new(service_factory, config.clone());
        let registry = service.registry().clone();
        let router = service.router();

        let ct = config.ct.child_token();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("streamable http server cancelled");
        });
        let bind = config.bind;
        tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "streamable http server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("streamable-http-server", bind_address = %bind)),
        );

        Ok(Self { config, registry })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }
}
