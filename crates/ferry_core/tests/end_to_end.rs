//! End-to-end proxying scenarios against real loopback upstreams. No mocking
//! of the proxying itself: every scenario here drives a real `LoadBalancer`
//! (or, for the drain scenarios, a bare `Service`) against a real
//! `TcpListener` standing in for the upstream.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferry_config::{HealthCheckConfig, ProxyConfig};
use ferry_core::{Host, LoadBalancer, ProxyRequest, Service, ServiceObserver, ServiceState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

fn test_config(label: &str) -> ProxyConfig {
    let mut cfg = ProxyConfig::default();
    cfg.state_file = std::env::temp_dir()
        .join(format!("ferry-e2e-{}-{}.json", std::process::id(), label))
        .to_string_lossy()
        .to_string();
    cfg.health.interval_secs = 1;
    cfg.health.timeout_secs = 1;
    cfg
}

fn get_request() -> ProxyRequest<'static> {
    ProxyRequest {
        method: "GET",
        path: "/",
        http_version: "HTTP/1.1",
        headers: "GET / HTTP/1.1\r\nHost: example\r\n\r\n",
        prefetched_body: &[],
        content_length: 0,
        is_chunked: false,
        keep_alive: true,
        peer_ip: "127.0.0.1".into(),
        max_body_bytes: 0,
        max_upstream_response_headers_bytes: 65536,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(2),
    }
}

/// Sends one request into `lb` over an in-memory duplex pipe and captures
/// everything written back, standing in for a real client socket.
async fn send_and_capture(lb: &Arc<LoadBalancer>) -> (bool, String) {
    let (mut server_side, mut client_side) = tokio::io::duplex(8192);
    let keep_alive = lb
        .serve_http(get_request(), &mut server_side)
        .await
        .unwrap_or(false);
    drop(server_side);
    let mut out = Vec::new();
    client_side.read_to_end(&mut out).await.ok();
    (keep_alive, String::from_utf8_lossy(&out).into_owned())
}

fn status_code(resp: &str) -> u16 {
    resp.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn body(resp: &str) -> String {
    resp.split("\r\n\r\n").nth(1).unwrap_or("").to_string()
}

/// Binds a loopback listener that answers every connection -- proxied
/// requests and health probes alike -- with `200 OK` and `body`, after
/// sleeping `delay` first.
async fn spawn_upstream(body: impl Into<String>, delay: Duration) -> Host {
    let body = body.into();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(answer_once(stream, body.clone(), delay));
        }
    });

    Host::parse(&addr.to_string()).unwrap()
}

async fn answer_once(mut stream: TcpStream, body: String, delay: Duration) {
    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(n) => n,
            Err(_) => return,
        };
        if n == 0 {
            return;
        }
        received.extend_from_slice(&chunk[..n]);
        if received.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    if !delay.is_zero() {
        sleep(delay).await;
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

struct NoopObserver;

impl ServiceObserver for NoopObserver {
    fn state_changed(&self, _host: &Host, _state: ServiceState) {}
}

#[tokio::test]
async fn empty_load_balancer_returns_503() {
    let lb = LoadBalancer::new(test_config("empty"));
    let (keep_alive, resp) = send_and_capture(&lb).await;
    assert!(!keep_alive);
    assert_eq!(status_code(&resp), 503);
}

#[tokio::test]
async fn single_healthy_backend_serves_200() {
    let host = spawn_upstream("first", Duration::ZERO).await;
    let lb = LoadBalancer::new(test_config("single"));
    lb.add(&[host], true).await.unwrap();

    let (keep_alive, resp) = send_and_capture(&lb).await;
    assert!(keep_alive);
    assert_eq!(status_code(&resp), 200);
    assert_eq!(body(&resp), "first");
}

#[tokio::test]
async fn round_robin_covers_all_five_backends() {
    let mut hosts = Vec::new();
    for i in 0..5 {
        hosts.push(spawn_upstream(i.to_string(), Duration::ZERO).await);
    }
    let lb = LoadBalancer::new(test_config("round-robin"));
    lb.add(&hosts, true).await.unwrap();

    let mut seen = HashSet::new();
    for _ in 0..5 {
        let (_, resp) = send_and_capture(&lb).await;
        seen.insert(body(&resp));
    }
    let expected: HashSet<String> = (0..5).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn zero_downtime_rollover_keeps_every_response_200() {
    let host_a = spawn_upstream("a", Duration::from_millis(5)).await;
    let lb = LoadBalancer::new(test_config("rollover"));
    lb.add(&[host_a.clone()], true).await.unwrap();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));

    let clients: Vec<_> = (0..8)
        .map(|_| {
            let lb = Arc::clone(&lb);
            let stop = Arc::clone(&stop);
            let statuses = Arc::clone(&statuses);
            tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    let (_, resp) = send_and_capture(&lb).await;
                    statuses.lock().unwrap().push(status_code(&resp));
                    sleep(Duration::from_millis(2)).await;
                }
            })
        })
        .collect();

    let host_b = spawn_upstream("b", Duration::from_millis(5)).await;
    lb.add(&[host_b], true).await.unwrap();
    lb.remove(&[host_a]).await.unwrap();

    sleep(Duration::from_millis(80)).await;
    stop.store(true, Ordering::Relaxed);
    for client in clients {
        client.await.unwrap();
    }

    let statuses = statuses.lock().unwrap();
    assert!(!statuses.is_empty());
    assert!(statuses.iter().all(|&code| code == 200));
}

#[tokio::test]
async fn drain_with_ample_timeout_completes_in_flight_requests() {
    let host = spawn_upstream("ok", Duration::from_millis(200)).await;
    let svc = Service::new(host, HealthCheckConfig::default(), Arc::new(NoopObserver));
    svc.begin_health_checks();
    assert!(svc.wait_until_healthy(Duration::from_secs(2)).await);

    let served = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let svc = svc.clone();
            let served = served.clone();
            tokio::spawn(async move {
                let (mut server_side, _client_side) = tokio::io::duplex(8192);
                if svc
                    .serve_http(get_request(), &mut server_side)
                    .await
                    .unwrap_or(false)
                {
                    served.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    sleep(Duration::from_millis(20)).await;
    svc.drain(Duration::from_secs(1)).await;
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(served.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn drain_with_short_timeout_cancels_all_in_flight_requests() {
    let host = spawn_upstream("ok", Duration::from_millis(500)).await;
    let svc = Service::new(host, HealthCheckConfig::default(), Arc::new(NoopObserver));
    svc.begin_health_checks();
    assert!(svc.wait_until_healthy(Duration::from_secs(2)).await);

    let served = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let svc = svc.clone();
            let served = served.clone();
            tokio::spawn(async move {
                let (mut server_side, _client_side) = tokio::io::duplex(8192);
                if svc
                    .serve_http(get_request(), &mut server_side)
                    .await
                    .unwrap_or(false)
                {
                    served.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    sleep(Duration::from_millis(20)).await;
    svc.drain(Duration::from_millis(10)).await;
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(served.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn restore_after_restart_recovers_one_service() {
    let host = spawn_upstream("restored", Duration::ZERO).await;
    let state_path = std::env::temp_dir()
        .join(format!("ferry-e2e-restore-{}.json", std::process::id()))
        .to_string_lossy()
        .into_owned();

    {
        let mut cfg = test_config("restore-write");
        cfg.state_file = state_path.clone();
        let lb = LoadBalancer::new(cfg);
        lb.add(&[host.clone()], true).await.unwrap();
    }

    let mut cfg = test_config("restore-read");
    cfg.state_file = state_path;
    let lb = LoadBalancer::new(cfg);
    lb.restore_from_state_file().await.unwrap();

    let services = lb.get_services();
    assert_eq!(services.len(), 1);
    assert_eq!(&services[0].0, &host);

    let mut became_healthy = false;
    for _ in 0..20 {
        if lb.get_services()[0].1 == ServiceState::Healthy {
            became_healthy = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(became_healthy);
}
