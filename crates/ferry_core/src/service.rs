//! A single upstream: its lifecycle, in-flight accounting, and proxying.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use ferry_config::HealthCheckConfig;
use ferry_http::responses::{send_413, send_502, send_503};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::headers::rewrite_proxy_headers;
use crate::health::{HealthCheck, HealthObserver};
use crate::host::Host;
use crate::response::{forward_chunked_body, stream_http_response, UpstreamReader};

/// Lifecycle state of a `Service`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Adding,
    Healthy,
    Unhealthy,
    Draining,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Adding => "adding",
            ServiceState::Healthy => "healthy",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Draining => "draining",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notified whenever a `Service`'s state changes.
pub trait ServiceObserver: Send + Sync {
    fn state_changed(&self, host: &Host, state: ServiceState);
}

/// A parsed inbound request, handed to `Service::serve_http` by the listener.
pub struct ProxyRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub http_version: &'a str,
    pub headers: &'a str,
    /// Body bytes already pulled off the wire while the listener was
    /// looking for the end of the headers.
    pub prefetched_body: &'a [u8],
    pub content_length: usize,
    pub is_chunked: bool,
    pub keep_alive: bool,
    pub peer_ip: String,
    pub max_body_bytes: usize,
    pub max_upstream_response_headers_bytes: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

struct Inner {
    state: ServiceState,
    inflight: HashMap<u64, CancellationToken>,
}

/// One proxy target. Tracks its own health, lifecycle state, and in-flight
/// requests; proxies traffic directly to its host when healthy.
pub struct Service {
    host: Host,
    health_config: HealthCheckConfig,
    observer: Arc<dyn ServiceObserver>,
    inner: Mutex<Inner>,
    next_request_id: AtomicU64,
    drain_notify: Notify,
    became_healthy: Notify,
    became_healthy_fired: AtomicBool,
    health_check: Mutex<Option<HealthCheck>>,
}

impl Service {
    pub fn new(host: Host, health_config: HealthCheckConfig, observer: Arc<dyn ServiceObserver>) -> Arc<Self> {
        Arc::new(Self {
            host,
            health_config,
            observer,
            inner: Mutex::new(Inner {
                state: ServiceState::Adding,
                inflight: HashMap::new(),
            }),
            next_request_id: AtomicU64::new(0),
            drain_notify: Notify::new(),
            became_healthy: Notify::new(),
            became_healthy_fired: AtomicBool::new(false),
            health_check: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lock().unwrap().state
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.lock().unwrap().inflight.len()
    }

    /// Starts the background health checker targeting this service's
    /// configured health path.
    pub fn begin_health_checks(self: &Arc<Self>) {
        let authority = self.host.as_str().to_string();
        let check = HealthCheck::start(authority, self.health_config.clone(), self.clone());
        *self.health_check.lock().unwrap() = Some(check);
    }

    /// Blocks until this service's first successful probe fires, or `wait`
    /// elapses. Returns `true` iff it became healthy in time.
    pub async fn wait_until_healthy(&self, wait: Duration) -> bool {
        if self.became_healthy_fired.load(Ordering::SeqCst) {
            return true;
        }
        let notified = self.became_healthy.notified();
        if self.became_healthy_fired.load(Ordering::SeqCst) {
            return true;
        }
        timeout(wait, notified).await.is_ok()
    }

    /// Transitions to Draining, stops the health checker, and waits for
    /// in-flight requests to finish up to `deadline`, force-cancelling any
    /// still outstanding once it elapses.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn drain(&self, deadline: Duration) {
        self.transition(ServiceState::Draining);

        if let Some(check) = self.health_check.lock().unwrap().take() {
            check.close();
        }

        let wait_for_empty = async {
            loop {
                if self.inner.lock().unwrap().inflight.is_empty() {
                    return;
                }
                self.drain_notify.notified().await;
            }
        };

        if timeout(deadline, wait_for_empty).await.is_err() {
            let stale: Vec<CancellationToken> = self
                .inner
                .lock()
                .unwrap()
                .inflight
                .values()
                .cloned()
                .collect();
            warn!(
                target: "ferry::service",
                host = %self.host,
                pending = stale.len(),
                "drain deadline elapsed; cancelling remaining requests"
            );
            for token in stale {
                token.cancel();
            }
        }
    }

    /// Serves one proxied request: admits if Healthy, proxies to the
    /// upstream, and streams the response back to `client_stream`.
    ///
    /// Returns `true` iff the request/response cycle completed cleanly and
    /// the client's body was fully consumed, meaning the connection is safe
    /// to keep alive. Any other outcome (draining, cancelled, upstream
    /// error) leaves the client byte stream in an unknown state and the
    /// caller must close the connection.
    #[instrument(skip(self, req, client_stream), fields(host = %self.host, path = %req.path))]
    pub async fn serve_http<C>(&self, req: ProxyRequest<'_>, client_stream: &mut C) -> anyhow::Result<bool>
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        if self.register_inflight_unless_draining(request_id, &cancel) {
            send_503(client_stream).await?;
            return Ok(false);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::anyhow!("request cancelled during drain")),
            result = self.proxy_once(&req, client_stream) => result,
        };

        self.remove_inflight(request_id);
        self.drain_notify.notify_waiters();

        match outcome {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(target: "ferry::service", host = %self.host, error = ?err, "proxy request failed");
                send_502(client_stream).await.ok();
                Ok(false)
            }
        }
    }

    /// Returns `true` if the service is draining (registration refused);
    /// otherwise registers `request_id` as in-flight and returns `false`.
    fn register_inflight_unless_draining(&self, request_id: u64, cancel: &CancellationToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ServiceState::Draining {
            return true;
        }
        inner.inflight.insert(request_id, cancel.clone());
        false
    }

    fn remove_inflight(&self, request_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.inflight.remove(&request_id);
    }

    async fn proxy_once<C>(&self, req: &ProxyRequest<'_>, client_stream: &mut C) -> anyhow::Result<()>
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if req.max_body_bytes > 0 && req.content_length > req.max_body_bytes {
            send_413(client_stream).await?;
            return Ok(());
        }

        let mut upstream = match timeout(req.connect_timeout, TcpStream::connect(self.host.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => anyhow::bail!("connect timeout to upstream {}", self.host.to_url()),
        };

        let rewritten_headers = rewrite_proxy_headers(
            req.headers,
            &req.peer_ip,
            req.keep_alive,
            req.content_length,
            req.is_chunked,
        );

        let mut out = Vec::new();
        out.extend_from_slice(
            format!("{} {} {}\r\n", req.method, req.path, req.http_version).as_bytes(),
        );
        out.extend_from_slice(rewritten_headers.as_bytes());
        out.extend_from_slice(b"\r\n");
        upstream.write_all(&out).await?;

        if req.content_length > 0 {
            let prefetched = req.prefetched_body.len().min(req.content_length);
            upstream.write_all(&req.prefetched_body[..prefetched]).await?;

            let mut remaining = req.content_length - prefetched;
            let mut buf = BytesMut::with_capacity(8192.min(remaining.max(1)));
            while remaining > 0 {
                buf.clear();
                buf.resize(remaining.min(8192), 0);
                let n = client_stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                upstream.write_all(&buf[..n]).await?;
                remaining -= n;
            }
        } else if req.is_chunked {
            let mut client_reader = UpstreamReader::with_prefetched(&mut *client_stream, req.prefetched_body);
            forward_chunked_body(&mut client_reader, &mut upstream, req.read_timeout, req.max_body_bytes).await?;
        }

        let mut upstream_reader = UpstreamReader::new(upstream);
        stream_http_response(
            &mut upstream_reader,
            client_stream,
            req.method,
            req.read_timeout,
            req.max_upstream_response_headers_bytes,
            req.max_body_bytes,
        )
        .await?;

        Ok(())
    }

    fn transition(&self, new_state: ServiceState) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == new_state {
                false
            } else if inner.state == ServiceState::Draining {
                // Draining is terminal; ignore further transition attempts.
                new_state == ServiceState::Draining
            } else {
                inner.state = new_state;
                true
            }
        };
        if changed {
            self.observer.state_changed(&self.host, new_state);
        }
    }
}

impl HealthObserver for Service {
    fn on_probe_result(&self, success: bool) {
        let current = self.inner.lock().unwrap().state;
        match (current, success) {
            (ServiceState::Draining, _) => {}
            (_, true) => {
                self.transition(ServiceState::Healthy);
                if !self.became_healthy_fired.swap(true, Ordering::SeqCst) {
                    self.became_healthy.notify_waiters();
                }
            }
            (ServiceState::Adding, false) => {}
            (_, false) => self.transition(ServiceState::Unhealthy),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingObserver {
        calls: AtomicUsize,
    }

    impl ServiceObserver for CountingObserver {
        fn state_changed(&self, _host: &Host, _state: ServiceState) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_service() -> Arc<Service> {
        let observer = Arc::new(CountingObserver {
            calls: AtomicUsize::new(0),
        });
        Service::new(
            Host::parse("127.0.0.1:1").unwrap(),
            HealthCheckConfig::default(),
            observer,
        )
    }

    #[test]
    fn starts_in_adding_state() {
        let svc = test_service();
        assert_eq!(svc.state(), ServiceState::Adding);
    }

    #[test]
    fn success_probe_transitions_to_healthy() {
        let svc = test_service();
        svc.on_probe_result(true);
        assert_eq!(svc.state(), ServiceState::Healthy);
    }

    #[test]
    fn failure_probe_on_adding_stays_adding() {
        let svc = test_service();
        svc.on_probe_result(false);
        assert_eq!(svc.state(), ServiceState::Adding);
    }

    #[test]
    fn failure_probe_on_healthy_transitions_unhealthy() {
        let svc = test_service();
        svc.on_probe_result(true);
        svc.on_probe_result(false);
        assert_eq!(svc.state(), ServiceState::Unhealthy);
    }

    #[test]
    fn recovers_from_unhealthy_on_success() {
        let svc = test_service();
        svc.on_probe_result(true);
        svc.on_probe_result(false);
        svc.on_probe_result(true);
        assert_eq!(svc.state(), ServiceState::Healthy);
    }

    #[tokio::test]
    async fn wait_until_healthy_returns_true_once_fired() {
        let svc = test_service();
        svc.on_probe_result(true);
        assert!(svc.wait_until_healthy(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_until_healthy_times_out_when_never_fired() {
        let svc = test_service();
        assert!(!svc.wait_until_healthy(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn drain_on_idle_service_returns_promptly() {
        let svc = test_service();
        svc.on_probe_result(true);
        svc.drain(Duration::from_millis(200)).await;
        assert_eq!(svc.state(), ServiceState::Draining);
    }

    #[tokio::test]
    async fn draining_rejects_new_requests_with_503() {
        let svc = test_service();
        svc.drain(Duration::from_millis(50)).await;

        let (mut client, _peer) = tokio::io::duplex(4096);
        let req = ProxyRequest {
            method: "GET",
            path: "/",
            http_version: "HTTP/1.1",
            headers: "GET / HTTP/1.1\r\nHost: x\r\n\r\n",
            prefetched_body: &[],
            content_length: 0,
            is_chunked: false,
            keep_alive: true,
            peer_ip: "127.0.0.1".into(),
            max_body_bytes: 0,
            max_upstream_response_headers_bytes: 65536,
            connect_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_millis(100),
        };
        svc.serve_http(req, &mut client).await.unwrap();
    }
}
