//! Active upstream health probing.

use std::sync::Arc;
use std::time::Duration;

use ferry_config::HealthCheckConfig;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Receives the outcome of every health probe.
///
/// Implementations are expected to be cheap: a probe result updates the
/// observer's own state synchronously and returns.
pub trait HealthObserver: Send + Sync {
    fn on_probe_result(&self, success: bool);
}

/// Drives periodic `GET` probes against a single upstream authority
/// (`host:port`) on a dedicated task, independent of any connection pooling
/// used for proxied traffic.
pub struct HealthCheck {
    cancel: CancellationToken,
}

impl HealthCheck {
    /// Starts probing immediately, then every `config.interval_secs`.
    pub fn start(
        authority: String,
        config: HealthCheckConfig,
        observer: Arc<dyn HealthObserver>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let probe_timeout = Duration::from_secs(config.timeout_secs.max(1));
            let mut ticker = interval(Duration::from_secs(config.interval_secs.max(1)));

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let ok = probe_once(&authority, &config.path, probe_timeout).await;
                        debug!(target: "ferry::health", authority = %authority, ok, "probe completed");
                        observer.on_probe_result(ok);
                    }
                }
            }
        });

        Self { cancel }
    }

    /// Stops the probe loop. Idempotent; safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.close();
    }
}

async fn probe_once(authority: &str, path: &str, probe_timeout: Duration) -> bool {
    let probe = async {
        let mut stream = TcpStream::connect(authority).await?;
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await?;

        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await?;
        anyhow::Result::<bool>::Ok(status_in_success_range(&buf[..n]))
    };

    matches!(timeout(probe_timeout, probe).await, Ok(Ok(true)))
}

fn status_in_success_range(response_head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(response_head);
    let Some(status_line) = text.lines().next() else {
        return false;
    };
    let Some(code) = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return false;
    };
    (200..300).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::status_in_success_range;

    #[test]
    fn accepts_2xx() {
        assert!(status_in_success_range(b"HTTP/1.1 200 OK\r\n"));
        assert!(status_in_success_range(b"HTTP/1.1 204 No Content\r\n"));
    }

    #[test]
    fn rejects_non_2xx() {
        assert!(!status_in_success_range(b"HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!status_in_success_range(b"HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(!status_in_success_range(b""));
        assert!(!status_in_success_range(b"not an http response"));
    }
}
