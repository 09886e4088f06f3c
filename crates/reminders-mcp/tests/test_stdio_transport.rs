use anyhow::Result;
use reminders_mcp::{Server, transport::StdioTransport};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

mod common;
use common::{TaskRouter, init_tracing};

struct PipeClient {
    lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

impl PipeClient {
    async fn send(&mut self, message: &Value) -> Result<()> {
        self.writer
            .write_all(format!("{message}\n").as_bytes())
            .await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Value> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow::anyhow!("pipe closed"))?;
        Ok(serde_json::from_str(&line)?)
    }
}

fn start_pipe_server() -> PipeClient {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_rd, server_wr) = tokio::io::split(server_io);
    tokio::spawn(async move {
        let _ = Server::new(TaskRouter)
            .run(StdioTransport::new(server_rd, server_wr))
            .await;
    });
    let (client_rd, writer) = tokio::io::split(client_io);
    PipeClient {
        lines: BufReader::new(client_rd).lines(),
        writer,
    }
}

#[tokio::test]
async fn test_pipe_round_trip() -> Result<()> {
    let mut client = start_pipe_server();

    client
        .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .await?;
    let response = client.recv().await?;
    assert_eq!(response["id"], json!(1));
    assert_eq!(
        response["result"]["serverInfo"]["name"],
        json!("reminders-mcp")
    );

    client
        .send(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .await?;
    assert_eq!(
        client.recv().await?,
        json!({"jsonrpc": "2.0", "id": 2, "result": {}})
    );
    Ok(())
}

#[tokio::test]
async fn test_pipe_malformed_line_gets_error_envelope() -> Result<()> {
    let mut client = start_pipe_server();

    client.writer.write_all(b"this is not json\n").await?;
    let response = client.recv().await?;
    assert_eq!(response["id"], Value::Null);
    assert_eq!(response["error"]["code"], json!(-32700));

    // The loop survives the bad line.
    client
        .send(&json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}))
        .await?;
    assert_eq!(
        client.recv().await?,
        json!({"jsonrpc": "2.0", "id": 3, "result": {}})
    );
    Ok(())
}

#[tokio::test]
async fn test_pipe_notifications_produce_no_response() -> Result<()> {
    let mut client = start_pipe_server();

    client
        .send(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await?;
    // The next response on the wire belongs to the request, not the
    // notification.
    client
        .send(&json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}))
        .await?;
    assert_eq!(
        client.recv().await?,
        json!({"jsonrpc": "2.0", "id": 4, "result": {}})
    );
    Ok(())
}
