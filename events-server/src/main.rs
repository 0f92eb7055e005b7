// Watchpoint event server
//
// Drives a debug session's watchpoints and listeners over line-delimited
// JSON-RPC on stdin/stdout

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

mod handlers;
mod protocol;
mod session;
mod tools;

use handlers::RequestHandler;
use protocol::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout is reserved for JSON-RPC protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("watch_events_server=info".parse()?)
                .add_directive("watch_events=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting watch-events server...");

    let handler = RequestHandler::new();

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut stdout = tokio::io::stdout();

    info!("Server ready, waiting for requests...");

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                debug!("Received: {}", line);

                let value = match serde_json::from_str::<Value>(line) {
                    Ok(value) => value,
                    Err(e) => {
                        error!("Parse error: {}", e);
                        write_response(&mut stdout, &error_response(PARSE_ERROR, "Parse error"))
                            .await?;
                        continue;
                    }
                };

                // Requests carry an id, notifications don't
                if value.get("id").is_some() {
                    match serde_json::from_value::<JsonRpcRequest>(value) {
                        Ok(request) => {
                            let response = handler.handle_request(request).await;
                            write_response(&mut stdout, &response).await?;
                        }
                        Err(e) => {
                            error!("Invalid request: {}", e);
                            write_response(
                                &mut stdout,
                                &error_response(INVALID_REQUEST, "Invalid request"),
                            )
                            .await?;
                        }
                    }
                } else {
                    match serde_json::from_value::<JsonRpcNotification>(value) {
                        Ok(notification) => handler.handle_notification(notification).await,
                        Err(e) => error!("Invalid notification: {}", e),
                    }
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    info!("Server shutting down");
    Ok(())
}

fn error_response(code: i32, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: Value::Null,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        }),
    }
}

async fn write_response(
    writer: &mut (impl AsyncWrite + Unpin),
    response: &JsonRpcResponse,
) -> Result<()> {
    let response_str = serde_json::to_string(response)?;
    debug!("Sending: {}", response_str);
    writer.write_all(response_str.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
