//! Unix-socket accept loop for the control plane: one connection per CLI
//! invocation, newline-delimited JSON in both directions.

use std::path::Path;
use std::sync::Arc;

use ferry_core::LoadBalancer;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument};

use crate::protocol::ControlResponse;

const MAX_CONCURRENT_CONNECTIONS: usize = 16;

pub async fn bind_listener(socket_path: &str) -> anyhow::Result<UnixListener> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = Path::new(socket_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!(target: "ferry::control", socket = %socket_path, "binding control socket");
    let listener = UnixListener::bind(socket_path)?;
    Ok(listener)
}

struct AcceptedConn {
    stream: UnixStream,
    permit: OwnedSemaphorePermit,
}

async fn accept_with_permit(
    listener: &UnixListener,
    semaphore: &Arc<Semaphore>,
) -> anyhow::Result<AcceptedConn> {
    let (stream, _addr) = listener.accept().await?;
    let permit = semaphore.clone().acquire_owned().await?;
    Ok(AcceptedConn { stream, permit })
}

#[instrument(skip(listener, lb))]
pub async fn accept_loop(listener: UnixListener, lb: Arc<LoadBalancer>) -> anyhow::Result<()> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));
    info!(target: "ferry::control", "control accept loop started");

    loop {
        let AcceptedConn { stream, permit } = match accept_with_permit(&listener, &semaphore).await
        {
            Ok(conn) => conn,
            Err(err) => {
                error!(target: "ferry::control", error = ?err, "failed to accept control connection");
                continue;
            }
        };

        let lb = lb.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let span = tracing::info_span!("control_connection");
            let _enter = span.enter();

            if let Err(err) = handle_connection(stream, lb).await {
                error!(target: "ferry::control", error = ?err, "error while handling control connection");
            } else {
                debug!(target: "ferry::control", "control connection handled successfully");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, lb: Arc<LoadBalancer>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str(&line) {
            Ok(request) => crate::handler::dispatch(&lb, request).await,
            Err(err) => ControlResponse::err(format!("invalid request: {err}")),
        };

        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        write_half.write_all(encoded.as_bytes()).await?;
    }

    Ok(())
}
