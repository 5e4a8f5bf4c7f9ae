//! Top-level HTTP listener: binds the front-facing socket and fans out
//! accepted connections to `handle_connection`.

use std::sync::Arc;

use ferry_config::HttpConfig;
use ferry_core::LoadBalancer;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument};

use crate::connection::handle_connection;

const MAX_CONCURRENT_CONNECTIONS: usize = 512;

/// Owns the front-facing HTTP listener and its accept loop.
pub struct Server {
    listener: TcpListener,
    listen_addr: String,
    http: Arc<HttpConfig>,
    lb: Arc<LoadBalancer>,
    semaphore: Arc<Semaphore>,
}

impl Server {
    #[instrument(skip(lb, http))]
    pub async fn bind(http: HttpConfig, lb: Arc<LoadBalancer>) -> anyhow::Result<Self> {
        let listen_addr = http.listen_addr.clone();
        info!(target: "ferry::listener", listen = %listen_addr, "binding HTTP listener");

        let listener = TcpListener::bind(&listen_addr).await.map_err(|err| {
            error!(target: "ferry::listener", listen = %listen_addr, error = ?err, "failed to bind listener");
            err
        })?;

        info!(target: "ferry::listener", listen = %listen_addr, "bind() successful");

        Ok(Self {
            listener,
            listen_addr,
            http: Arc::new(http),
            lb,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until the listener errors or `shutdown` resolves.
    #[instrument(skip(self, shutdown), fields(listen = %self.listen_addr))]
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        info!(target: "ferry::listener", listen = %self.listen_addr, "accept loop started");

        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(target: "ferry::listener", "shutdown signal received; stopping accept loop");
                    return Ok(());
                }
                accepted = accept_with_permit(&self.listener, &self.listen_addr, &self.semaphore) => accepted,
            };

            let (stream, addr, permit) = match accepted {
                Ok(conn) => conn,
                Err(err) => {
                    error!(target: "ferry::listener", error = ?err, "accept failed; continuing");
                    continue;
                }
            };

            let lb = self.lb.clone();
            let http = self.http.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let span = tracing::info_span!("connection", client_addr = %addr);
                let _enter = span.enter();

                debug!(target: "ferry::listener", "worker spawned for incoming connection");

                if let Err(err) = handle_connection(Box::new(stream), addr, lb, http).await {
                    error!(target: "ferry::listener", client_addr = %addr, error = ?err, "error while handling connection");
                }
            });
        }
    }
}

async fn accept_with_permit(
    listener: &TcpListener,
    listen_addr: &str,
    semaphore: &Arc<Semaphore>,
) -> anyhow::Result<(TcpStream, std::net::SocketAddr, OwnedSemaphorePermit)> {
    let (stream, addr) = listener.accept().await.map_err(|err| {
        error!(target: "ferry::listener", listen = %listen_addr, error = ?err, "failed to accept connection");
        err
    })?;

    let permit = semaphore.clone().acquire_owned().await.map_err(|err| {
        error!(target: "ferry::listener", listen = %listen_addr, error = ?err, "failed to acquire connection permit");
        err
    })?;

    debug!(
        target: "ferry::listener",
        listen = %listen_addr,
        client_addr = %addr,
        available_permits = semaphore.available_permits(),
        "connection accepted"
    );

    Ok((stream, addr, permit))
}
