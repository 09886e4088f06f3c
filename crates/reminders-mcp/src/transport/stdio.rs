use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{Future, Stream};
use pin_project::pin_project;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::Transport;
use crate::{error::TransportError, model::JsonRpcMessage};

/// A line-oriented pipe transport: one JSON-RPC message per `\n`-terminated
/// line, in both directions.
#[pin_project]
pub struct StdioTransport<R, W> {
    // BufReader on the underlying stream (stdin or similar) buffers data
    // across poll calls; each poll_next drains one line from it.
    #[pin]
    reader: BufReader<R>,
    #[pin]
    writer: W,
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            // 2MB buffer so a single oversized tool call still fits on one line.
            reader: BufReader::with_capacity(2 * 1024 * 1024, reader),
            writer,
        }
    }
}

impl<R, W> Stream for StdioTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    type Item = Result<JsonRpcMessage, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        let mut buf = Vec::new();

        let mut reader = this.reader.as_mut();
        let mut read_future = Box::pin(reader.read_until(b'\n', &mut buf));
        match read_future.as_mut().poll(cx) {
            Poll::Ready(Ok(0)) => Poll::Ready(None), // EOF
            Poll::Ready(Ok(_)) => {
                let line = match String::from_utf8(buf) {
                    Ok(line) => line,
                    Err(e) => return Poll::Ready(Some(Err(TransportError::Utf8(e)))),
                };
                // Log before decoding so truncated chunks that are not valid
                // JSON still show up in the trace.
                tracing::debug!(json = %line, "incoming message");

                let value = match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => value,
                    Err(e) => return Poll::Ready(Some(Err(TransportError::Json(e)))),
                };
                let Some(object) = value.as_object() else {
                    return Poll::Ready(Some(Err(TransportError::InvalidMessage(
                        "message must be a JSON object".into(),
                    ))));
                };
                if !object.get("jsonrpc").is_some_and(|v| *v == "2.0") {
                    return Poll::Ready(Some(Err(TransportError::InvalidMessage(
                        "missing or invalid jsonrpc version".into(),
                    ))));
                }

                match serde_json::from_value::<JsonRpcMessage>(value) {
                    Ok(message) => Poll::Ready(Some(Ok(message))),
                    Err(e) => Poll::Ready(Some(Err(TransportError::Json(e)))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(TransportError::Io(e)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, message: JsonRpcMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(&message)?;

        Pin::new(&mut self.writer).write_all(json.as_bytes()).await?;
        Pin::new(&mut self.writer).write_all(b"\n").await?;
        Pin::new(&mut self.writer).flush().await?;

        Ok(())
    }
}
