//! Per-connection HTTP/1 handler: reads one request at a time off the wire
//! and hands each to the load balancer, honoring keep-alive between them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ferry_config::HttpConfig;
use ferry_core::{LoadBalancer, ProxyRequest};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument};

use crate::request::{read_http_request, ParsedRequest};

pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ClientStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Entry point for handling a single accepted HTTP connection end to end.
#[instrument(skip(stream, lb, http), fields(client = %client_addr))]
pub async fn handle_connection(
    mut stream: Box<dyn ClientStream>,
    client_addr: SocketAddr,
    lb: Arc<LoadBalancer>,
    http: Arc<HttpConfig>,
) -> anyhow::Result<()> {
    info!(target: "ferry::listener", "handling new client connection");

    let mut buf = BytesMut::new();
    let mut first_request = true;

    loop {
        let idle_timeout = if first_request {
            Duration::from_secs(http.client_read_timeout_secs)
        } else {
            Duration::from_secs(http.idle_timeout_secs)
        };

        let req = match read_http_request(stream.as_mut(), &mut buf, &http, idle_timeout).await? {
            Some(req) => req,
            None => break,
        };

        if req.headers.is_empty() {
            debug!(target: "ferry::listener", "empty request received; closing connection");
            break;
        }

        debug!(
            target: "ferry::listener",
            method = %req.method,
            path = %req.path,
            "dispatching request to load balancer"
        );

        let keep_alive = serve_one(&mut stream, &mut buf, &lb, &http, client_addr, &req).await?;

        if !keep_alive || req.close_after {
            break;
        }

        first_request = false;
    }

    info!(target: "ferry::listener", %client_addr, "finished handling connection");
    Ok(())
}

async fn serve_one(
    stream: &mut Box<dyn ClientStream>,
    buf: &mut BytesMut,
    lb: &Arc<LoadBalancer>,
    http: &HttpConfig,
    client_addr: SocketAddr,
    req: &ParsedRequest,
) -> anyhow::Result<bool> {
    let prefetched_body = &buf[req.body_start..];

    let proxy_req = ProxyRequest {
        method: &req.method,
        path: &req.path,
        http_version: &req.http_version,
        headers: &req.headers,
        prefetched_body,
        content_length: req.content_length,
        is_chunked: req.is_chunked,
        keep_alive: !req.close_after,
        peer_ip: client_addr.ip().to_string(),
        max_body_bytes: http.max_request_body_bytes as usize,
        max_upstream_response_headers_bytes: http.max_upstream_response_headers_bytes as usize,
        connect_timeout: Duration::from_secs(http.client_read_timeout_secs.max(1)),
        read_timeout: Duration::from_secs(http.client_read_timeout_secs.max(1)),
    };

    let result = lb.serve_http(proxy_req, stream).await;

    // The header bytes and whatever body we'd prefetched are fully consumed
    // either way; the next loop iteration starts from an empty buffer. If
    // the cycle didn't fully proxy, the caller closes the connection instead
    // of trying to resynchronize it.
    buf.clear();

    result
}
