//! The session multiplexer.
//!
//! One [`Session`] per logical client: it owns the transport adapter the
//! protocol engine runs on, the pending-response and blocked-requester
//! queues that implement FIFO correlation, and the SSE buffer/sink pair.
//! The [`SessionRegistry`] maps canonical session ids and legacy aliases to
//! live sessions and arbitrates creation and eviction.
//!
//! Correlation is strictly by arrival order: an outbound message resumes the
//! oldest blocked requester, or queues as the oldest pending response. This
//! is correct because each client awaits one POST at a time; the multiplexer
//! does not match by request id.

use std::{
    collections::{HashMap, VecDeque},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_service::Service;

use super::{SSE_COMMENT_CONNECTED, SessionId, session_id, sse_event_frame};
use crate::{
    error::{BoxError, SessionError, TransportError},
    model::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse},
    server::Server,
    transport::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Started,
    Closed,
}

struct SessionInner {
    state: SessionState,
    inbound_tx: Option<mpsc::UnboundedSender<JsonRpcMessage>>,
    /// Outbound messages no requester was waiting for, oldest first.
    pending: VecDeque<JsonRpcMessage>,
    /// Requesters suspended in `next_response`, oldest first. Exactly one of
    /// `pending`/`waiters` is non-empty in steady state.
    waiters: VecDeque<oneshot::Sender<Result<JsonRpcMessage, SessionError>>>,
    /// Outbound messages not yet delivered to any SSE sink, oldest first.
    sse_buffer: VecDeque<JsonRpcMessage>,
    sink: Option<mpsc::UnboundedSender<Bytes>>,
    engine_error: Option<String>,
}

/// One logical client connection: a transport adapter, a protocol-engine
/// task, and the correlation state between them.
pub struct Session {
    id: SessionId,
    inner: Mutex<SessionInner>,
    ct: CancellationToken,
}

fn event_frame(message: &JsonRpcMessage) -> Bytes {
    let payload = serde_json::to_vec(message).unwrap_or_else(|_| b"{}".to_vec());
    sse_event_frame(&payload)
}

impl Session {
    pub(crate) fn new(id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                inbound_tx: None,
                pending: VecDeque::new(),
                waiters: VecDeque::new(),
                sse_buffer: VecDeque::new(),
                sink: None,
                engine_error: None,
            }),
            ct: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Connects the transport adapter and spawns the protocol engine's run
    /// loop as a background task. Called exactly once, by the registry.
    pub(crate) async fn start<S>(self: Arc<Self>, service: S) -> Result<(), SessionError>
    where
        S: Service<JsonRpcRequest, Response = JsonRpcResponse> + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send,
    {
        let transport = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Created => {}
                SessionState::Started => return Err(SessionError::AlreadyStarted),
                SessionState::Closed => return Err(SessionError::ConnectionClosed),
            }
            let (tx, rx) = mpsc::unbounded_channel();
            inner.inbound_tx = Some(tx);
            inner.state = SessionState::Started;
            SessionTransport {
                inbound: UnboundedReceiverStream::new(rx),
                session: self.clone(),
            }
        };

        let session = self.clone();
        let ct = self.ct.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ct.cancelled() => {
                    tracing::debug!(session_id = %session.id, "engine task cancelled");
                }
                result = Server::new(service).run(transport) => {
                    if let Err(e) = result {
                        session.engine_failed(e.to_string()).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Hands a normalized inbound message to the transport adapter's queue.
    /// Never blocks; always succeeds while the session is started.
    pub async fn submit(&self, message: JsonRpcMessage) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        match (inner.state, &inner.inbound_tx) {
            (SessionState::Started, Some(tx)) => {
                tx.send(message).map_err(|_| SessionError::ConnectionClosed)
            }
            (SessionState::Closed, _) => Err(SessionError::ConnectionClosed),
            _ => Err(SessionError::NotStarted),
        }
    }

    /// The correlation primitive: returns the oldest pending response
    /// immediately, or suspends until the next outbound message arrives.
    /// Resumes with an error if the session closes or the engine fails while
    /// waiting.
    pub async fn next_response(&self) -> Result<JsonRpcMessage, SessionError> {
        let rx = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return Err(SessionError::ConnectionClosed);
            }
            if let Some(message) = inner.pending.pop_front() {
                return Ok(message);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectionClosed),
        }
    }

    /// Installs `sink` as the SSE destination, replacing any previous one.
    /// Emits a comment frame, then replays the buffered backlog in order.
    /// Every future outbound message is mirrored to the sink in addition to
    /// the request/response path.
    pub async fn attach_stream(
        &self,
        sink: mpsc::UnboundedSender<Bytes>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(SessionError::ConnectionClosed);
        }
        if sink.send(Bytes::from_static(SSE_COMMENT_CONNECTED)).is_err() {
            // The stream was torn down before we got here; keep the backlog
            // for the next attach.
            tracing::debug!(session_id = %self.id, "SSE sink gone before attach");
            return Ok(());
        }
        while let Some(message) = inner.sse_buffer.pop_front() {
            if sink.send(event_frame(&message)).is_err() {
                inner.sse_buffer.push_front(message);
                return Ok(());
            }
        }
        inner.sink = Some(sink);
        tracing::debug!(session_id = %self.id, "SSE sink attached");
        Ok(())
    }

    /// Routing rule for engine-emitted messages, applied atomically per
    /// message: resume the oldest blocked requester or append to the pending
    /// queue, and independently mirror to the SSE path.
    async fn route_outbound(&self, message: JsonRpcMessage) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            tracing::debug!(session_id = %self.id, "dropping outbound message for closed session");
            return;
        }

        match inner.waiters.pop_front() {
            Some(waiter) => {
                // A requester that vanished still consumes the message;
                // redelivering to the next waiter would break FIFO pairing.
                if waiter.send(Ok(message.clone())).is_err() {
                    tracing::debug!(session_id = %self.id, "blocked requester went away before resume");
                }
            }
            None => inner.pending.push_back(message.clone()),
        }

        if let Some(sink) = inner.sink.take() {
            if sink.send(event_frame(&message)).is_ok() {
                inner.sink = Some(sink);
            } else {
                tracing::debug!(session_id = %self.id, "SSE sink detached, buffering");
                inner.sse_buffer.push_back(message);
            }
        } else {
            inner.sse_buffer.push_back(message);
        }
    }

    /// Records an engine run-loop failure and fails every currently blocked
    /// requester. The session stays open; the client issues an explicit
    /// close.
    async fn engine_failed(&self, error: String) {
        tracing::error!(session_id = %self.id, error = %error, "protocol engine terminated");
        let mut inner = self.inner.lock().await;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(Err(SessionError::Engine(error.clone())));
        }
        inner.engine_error = Some(error);
    }

    /// The last engine run-loop error, if any.
    pub async fn engine_error(&self) -> Option<String> {
        self.inner.lock().await.engine_error.clone()
    }

    /// Tears the session down: disconnects the adapter, stops the engine
    /// task, fails all blocked requesters, discards buffers, detaches the
    /// sink. Idempotent.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.inbound_tx = None;
            for waiter in inner.waiters.drain(..) {
                let _ = waiter.send(Err(SessionError::ConnectionClosed));
            }
            inner.pending.clear();
            inner.sse_buffer.clear();
            inner.sink = None;
        }
        self.ct.cancel();
        tracing::info!(session_id = %self.id, "session closed");
    }
}

/// The per-session transport adapter: bridges the inbound message queue and
/// the session's outbound routing into the duplex shape the protocol engine
/// expects.
pub struct SessionTransport {
    inbound: UnboundedReceiverStream<JsonRpcMessage>,
    session: Arc<Session>,
}

impl Stream for SessionTransport {
    type Item = Result<JsonRpcMessage, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_next_unpin(cx).map(|message| message.map(Ok))
    }
}

#[async_trait]
impl Transport for SessionTransport {
    async fn write_message(&mut self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.session.route_outbound(message).await;
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Arc<Session>>,
    aliases: HashMap<String, SessionId>,
}

impl RegistryState {
    fn lookup(&self, token: &str) -> Option<&Arc<Session>> {
        if let Some(session) = self.sessions.get(token) {
            return Some(session);
        }
        self.aliases
            .get(token)
            .and_then(|id| self.sessions.get(id))
    }

    fn canonical_id(&self, token: &str) -> Option<SessionId> {
        if let Some((id, _)) = self.sessions.get_key_value(token) {
            return Some(id.clone());
        }
        self.aliases
            .get(token)
            .filter(|id| self.sessions.contains_key(*id))
            .cloned()
    }
}

/// Maps session identifiers (and legacy client-supplied aliases) to live
/// sessions. One lock guards both maps, so lookups observe a consistent
/// snapshot.
#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header token first, then the query token; each checked against the
    /// canonical id space before the alias map.
    pub async fn resolve(
        &self,
        header: Option<&str>,
        query: Option<&str>,
    ) -> Option<Arc<Session>> {
        let state = self.state.read().await;
        [header, query]
            .into_iter()
            .flatten()
            .find_map(|token| state.lookup(token))
            .cloned()
    }

    /// Generates a fresh canonical id, starts a new session (fresh adapter,
    /// fresh engine), registers it, and records the alias if a query token
    /// was supplied. A start failure leaves no registry entry behind.
    pub async fn create_session<S>(
        &self,
        service: S,
        query_token: Option<&str>,
    ) -> Result<Arc<Session>, SessionError>
    where
        S: Service<JsonRpcRequest, Response = JsonRpcResponse> + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send,
    {
        let id = session_id();
        let session = Session::new(id.clone());
        session.clone().start(service).await?;

        let mut state = self.state.write().await;
        state.sessions.insert(id.clone(), session.clone());
        if let Some(token) = query_token {
            state.aliases.insert(token.to_owned(), id.clone());
        }
        tracing::info!(session_id = %id, "created session");
        Ok(session)
    }

    /// Removes and tears down the session the tokens resolve to, dropping
    /// every alias that pointed at it. Returns the canonical id of the
    /// closed session.
    pub async fn close(
        &self,
        header: Option<&str>,
        query: Option<&str>,
    ) -> Result<SessionId, SessionError> {
        let (id, session) = {
            let mut state = self.state.write().await;
            let Some(id) = [header, query]
                .into_iter()
                .flatten()
                .find_map(|token| state.canonical_id(token))
            else {
                return Err(SessionError::NotFound);
            };
            let Some(session) = state.sessions.remove(&id) else {
                return Err(SessionError::NotFound);
            };
            state.aliases.retain(|_, target| *target != id);
            (id, session)
        };
        session.close().await;
        Ok(id)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        time::Duration,
    };

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::model::{JsonRpcVersion2_0, RequestId};

    #[derive(Clone, Default)]
    struct Echo;

    impl Service<JsonRpcRequest> for Echo {
        type Response = JsonRpcResponse;
        type Error = BoxError;
        type Future = Pin<Box<dyn Future<Output = Result<JsonRpcResponse, BoxError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: JsonRpcRequest) -> Self::Future {
            Box::pin(async move {
                Ok(JsonRpcResponse {
                    jsonrpc: JsonRpcVersion2_0,
                    id: request.id,
                    result: Some(json!({"method": request.method})),
                    error: None,
                })
            })
        }
    }

    fn request(id: i64, method: &str) -> JsonRpcMessage {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id: RequestId::Number(id),
            method: method.to_string(),
            params: None,
        })
    }

    async fn started_session() -> Arc<Session> {
        let session = Session::new(session_id());
        session.clone().start(Echo).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_pending_queue_feeds_later_requesters_in_order() {
        let session = started_session().await;
        session.route_outbound(request(1, "a")).await;
        session.route_outbound(request(2, "b")).await;

        assert_eq!(session.next_response().await.unwrap(), request(1, "a"));
        assert_eq!(session.next_response().await.unwrap(), request(2, "b"));
    }

    #[tokio::test]
    async fn test_blocked_requester_is_resumed_by_next_outbound() {
        let session = started_session().await;
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.next_response().await })
        };
        // Let the requester enqueue itself before the message arrives.
        tokio::task::yield_now().await;
        session.route_outbound(request(9, "late")).await;

        let message = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message, request(9, "late"));
    }

    #[tokio::test]
    async fn test_late_attach_replays_buffered_messages_in_order() {
        let session = started_session().await;
        for i in 0..3 {
            session.route_outbound(request(i, "buffered")).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach_stream(tx).await.unwrap();

        let comment = rx.recv().await.unwrap();
        assert!(comment.starts_with(b":"));
        for i in 0..3 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame, event_frame(&request(i, "buffered")));
        }

        // New messages flow straight through, no duplicates of the backlog.
        session.route_outbound(request(7, "live")).await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, event_frame(&request(7, "live")));
    }

    #[tokio::test]
    async fn test_reattach_replaces_previous_sink() {
        let session = started_session().await;
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        session.attach_stream(first_tx).await.unwrap();
        let _ = first_rx.recv().await; // comment frame

        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        session.attach_stream(second_tx).await.unwrap();
        let _ = second_rx.recv().await; // comment frame

        session.route_outbound(request(1, "x")).await;
        assert_eq!(
            second_rx.recv().await.unwrap(),
            event_frame(&request(1, "x"))
        );
        // Consume the pending-response copy so it is not left dangling.
        let _ = session.next_response().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_blocked_requesters() {
        let session = started_session().await;
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.next_response().await })
        };
        tokio::task::yield_now().await;
        session.close().await;

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(SessionError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_gates_operations() {
        let session = started_session().await;
        session.close().await;
        session.close().await;

        assert_eq!(
            session.submit(request(1, "ping")).await,
            Err(SessionError::ConnectionClosed)
        );
        assert_eq!(
            session.next_response().await,
            Err(SessionError::ConnectionClosed)
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            session.attach_stream(tx).await,
            Err(SessionError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_submit_round_trips_through_the_engine() {
        let session = started_session().await;
        session.submit(request(4, "tasks/list")).await.unwrap();
        let response = timeout(Duration::from_secs(1), session.next_response())
            .await
            .unwrap()
            .unwrap();
        match response {
            JsonRpcMessage::Response(response) => {
                assert_eq!(response.id, RequestId::Number(4));
                assert_eq!(response.result, Some(json!({"method": "tasks/list"})));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_engine_failure_fails_waiters_but_leaves_session_open() {
        let session = started_session().await;
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.next_response().await })
        };
        tokio::task::yield_now().await;
        session.engine_failed("engine exploded".to_string()).await;

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(
            result,
            Err(SessionError::Engine("engine exploded".to_string()))
        );
        // The session is left open for the client to close explicitly.
        assert_eq!(
            session.engine_error().await,
            Some("engine exploded".to_string())
        );
        assert!(session.submit(request(1, "ping")).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let session = started_session().await;
        assert_eq!(
            session.clone().start(Echo).await,
            Err(SessionError::AlreadyStarted)
        );
    }

    #[tokio::test]
    async fn test_registry_resolves_canonical_and_alias_tokens() {
        let registry = SessionRegistry::new();
        let session = registry
            .create_session(Echo, Some("legacy-token"))
            .await
            .unwrap();
        let id = session.id().clone();

        assert!(registry.resolve(Some(&id), None).await.is_some());
        assert!(registry.resolve(None, Some(&id)).await.is_some());
        let via_alias = registry.resolve(None, Some("legacy-token")).await.unwrap();
        assert_eq!(via_alias.id(), &id);
        assert!(registry.resolve(Some("unknown"), None).await.is_none());
    }

    #[tokio::test]
    async fn test_registry_close_removes_canonical_entry_and_aliases() {
        let registry = SessionRegistry::new();
        let session = registry
            .create_session(Echo, Some("legacy-token"))
            .await
            .unwrap();
        let id = session.id().clone();

        let closed = registry.close(None, Some("legacy-token")).await.unwrap();
        assert_eq!(closed, id);
        assert!(registry.resolve(Some(&id), None).await.is_none());
        assert!(registry.resolve(None, Some("legacy-token")).await.is_none());
        assert_eq!(registry.session_count().await, 0);

        // Second close reports not-found, nothing worse.
        assert_eq!(
            registry.close(Some(&id), None).await,
            Err(SessionError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_registry_close_rejects_unrelated_tokens() {
        let registry = SessionRegistry::new();
        let _session = registry.create_session(Echo, None).await.unwrap();
        assert_eq!(
            registry.close(Some("unrelated"), None).await,
            Err(SessionError::NotFound)
        );
        assert_eq!(registry.session_count().await, 1);
    }
}
