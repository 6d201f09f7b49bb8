//! Line-delimited JSON over TCP. One request and one response per
//! connection; the socket is closed immediately after the response is
//! written.

pub mod handlers;
pub mod protocol;

use crate::executor::Executor;
use protocol::{Request, ResponseEnvelope, KNOWN_TYPES};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Binds and serves until an OS interrupt/terminate signal is received.
/// In-flight handlers are allowed to complete; no new connections are
/// accepted afterward.
pub async fn serve(executor: Arc<Executor>, host: &str, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(%host, port, "zone1 executor listening");
    run(executor, listener).await
}

/// Serves on an already-bound listener. Lets callers (tests) bind to an
/// ephemeral port and learn its address before the accept loop starts.
pub async fn run(executor: Arc<Executor>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let executor = executor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(executor, stream).await {
                        warn!(%peer, error = %e, "connection handling failed");
                    }
                });
            }
            _ = wait_for_shutdown_signal() => {
                info!("shutdown signal received, closing listener");
                executor.stop();
                break;
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn handle_connection(executor: Arc<Executor>, stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(());
    }

    let response = match serde_json::from_str::<serde_json::Value>(line.trim()) {
        Err(e) => {
            error!(error = %e, "received malformed request");
            ResponseEnvelope::invalid_json()
        }
        Ok(value) => match value.get("type").and_then(serde_json::Value::as_str) {
            None => {
                error!("request is valid JSON but carries no 'type' field");
                ResponseEnvelope::invalid_json()
            }
            Some(type_name) if !KNOWN_TYPES.contains(&type_name) => {
                error!(%type_name, "received unrecognized message type");
                ResponseEnvelope::unknown_type(type_name)
            }
            Some(_) => match serde_json::from_value::<Request>(value) {
                Ok(request) => handlers::dispatch(&executor, request).await,
                Err(e) => {
                    error!(error = %e, "received malformed request");
                    ResponseEnvelope::invalid_json()
                }
            },
        },
    };

    let mut payload = serde_json::to_string(&response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}
