//! Streaming and parsing of upstream HTTP/1 responses.
//!
//! Reads a response from the upstream connection and forwards it to the
//! client as it arrives, without buffering the whole body in memory.

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{timeout, Duration},
};
use tracing::{debug, warn};

/// Read-buffered wrapper around an upstream connection.
pub(crate) struct UpstreamReader<S> {
    pub(crate) stream: S,
    pub(crate) buf: BytesMut,
}

impl<S: AsyncRead + Unpin> UpstreamReader<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Wraps `stream`, seeding the read buffer with bytes already pulled off
    /// the wire before this reader existed.
    pub(crate) fn with_prefetched(stream: S, prefetched: &[u8]) -> Self {
        Self {
            stream,
            buf: BytesMut::from(prefetched),
        }
    }
}

/// Streams an upstream HTTP response to the client, rejecting a body past
/// `max_body` bytes (0 disables the limit). Returns the upstream's status
/// code on success.
pub(crate) async fn stream_http_response<U, C>(
    upstream: &mut UpstreamReader<U>,
    client_stream: &mut C,
    method: &str,
    read_timeout: Duration,
    max_headers: usize,
    max_body: usize,
) -> anyhow::Result<u16>
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let headers_end = read_response_headers(upstream, read_timeout, max_headers).await?;
    let headers_bytes = upstream.buf.split_to(headers_end + 4);
    let header_len = headers_bytes.len().saturating_sub(4);

    let info = parse_response_headers(&headers_bytes[..header_len])?;
    let status = info.status_code.unwrap_or(502);
    let no_body = is_no_body(method, info.status_code);

    client_stream.write_all(&headers_bytes).await?;

    if no_body {
        return Ok(status);
    }

    if info.is_chunked {
        forward_chunked_body(upstream, client_stream, read_timeout, max_body).await?;
        return Ok(status);
    }

    if let Some(cl) = info.content_length {
        if max_body > 0 && cl > max_body {
            anyhow::bail!("upstream response body too large");
        }
        stream_content_length(upstream, client_stream, cl, read_timeout).await?;
        return Ok(status);
    }

    stream_until_eof(upstream, client_stream, read_timeout, max_body).await?;
    Ok(status)
}

async fn read_response_headers<U: AsyncRead + Unpin>(
    upstream: &mut UpstreamReader<U>,
    read_timeout: Duration,
    max_headers: usize,
) -> anyhow::Result<usize> {
    loop {
        if let Some(pos) = find_headers_end(&upstream.buf) {
            return Ok(pos);
        }

        if max_headers > 0 && upstream.buf.len() > max_headers {
            anyhow::bail!("upstream response headers too large");
        }

        let n = read_more(upstream, read_timeout).await?;
        if n == 0 {
            anyhow::bail!("upstream closed connection while reading headers");
        }
    }
}

async fn read_more<U: AsyncRead + Unpin>(
    upstream: &mut UpstreamReader<U>,
    read_timeout: Duration,
) -> anyhow::Result<usize> {
    let mut tmp = [0u8; 8192];
    let n = match timeout(read_timeout, upstream.stream.read(&mut tmp)).await {
        Ok(res) => res?,
        Err(_) => anyhow::bail!("upstream read timeout"),
    };
    if n > 0 {
        upstream.buf.extend_from_slice(&tmp[..n]);
    }
    Ok(n)
}

fn find_headers_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug, Default)]
struct ResponseInfo {
    content_length: Option<usize>,
    is_chunked: bool,
    status_code: Option<u16>,
}

#[derive(Default)]
struct ContentLengthState {
    value: Option<usize>,
    invalid: bool,
    conflict: bool,
}

impl ContentLengthState {
    fn add(&mut self, raw: &str) {
        let mut any = false;
        for part in raw.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            any = true;
            match trimmed.parse::<usize>() {
                Ok(len) => {
                    if let Some(prev) = self.value {
                        if prev != len {
                            self.conflict = true;
                            self.invalid = true;
                        }
                    } else {
                        self.value = Some(len);
                    }
                }
                Err(_) => self.invalid = true,
            }
        }
        if !any {
            self.invalid = true;
        }
    }
}

fn split_header_tokens(value: &str) -> impl Iterator<Item = String> + '_ {
    value.split(',').filter_map(|token| {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(
                trimmed
                    .trim_matches(|c| c == '"' || c == '\'')
                    .to_ascii_lowercase(),
            )
        }
    })
}

fn parse_response_headers(header_bytes: &[u8]) -> anyhow::Result<ResponseInfo> {
    let header_str = String::from_utf8_lossy(header_bytes);
    let mut info = ResponseInfo::default();
    let mut content_length = ContentLengthState::default();

    let mut lines = header_str.lines();
    if let Some(status_line) = lines.next() {
        debug!(target: "ferry::response", status_line = %status_line, "received upstream status line");
        info.status_code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok());
    }

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => content_length.add(value),
            "transfer-encoding" => {
                for token in split_header_tokens(value) {
                    if token == "chunked" {
                        info.is_chunked = true;
                    }
                }
            }
            _ => {}
        }
    }

    if content_length.invalid {
        if content_length.conflict {
            anyhow::bail!("conflicting Content-Length in upstream response");
        }
        anyhow::bail!("invalid Content-Length in upstream response");
    }
    info.content_length = content_length.value;

    Ok(info)
}

fn is_no_body(method: &str, status_code: Option<u16>) -> bool {
    if method.eq_ignore_ascii_case("HEAD") {
        return true;
    }
    match status_code {
        Some(code) if (100..200).contains(&code) => true,
        Some(204) | Some(304) => true,
        _ => false,
    }
}

async fn stream_content_length<U, C>(
    upstream: &mut UpstreamReader<U>,
    client_stream: &mut C,
    mut remaining: usize,
    read_timeout: Duration,
) -> anyhow::Result<()>
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    while remaining > 0 {
        if upstream.buf.is_empty() {
            let n = read_more(upstream, read_timeout).await?;
            if n == 0 {
                warn!(target: "ferry::response", expected = remaining, "upstream closed before full body was read");
                return Ok(());
            }
        }
        let take = remaining.min(upstream.buf.len());
        let chunk = upstream.buf.split_to(take);
        client_stream.write_all(&chunk).await?;
        remaining -= take;
    }
    Ok(())
}

async fn stream_until_eof<U, C>(
    upstream: &mut UpstreamReader<U>,
    client_stream: &mut C,
    read_timeout: Duration,
    max_body: usize,
) -> anyhow::Result<()>
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut body_bytes = 0usize;

    if !upstream.buf.is_empty() {
        body_bytes += upstream.buf.len();
        if max_body > 0 && body_bytes > max_body {
            anyhow::bail!("upstream response body too large");
        }
        let chunk = upstream.buf.split_to(upstream.buf.len());
        client_stream.write_all(&chunk).await?;
    }
    loop {
        let n = read_more(upstream, read_timeout).await?;
        if n == 0 {
            break;
        }
        body_bytes += n;
        if max_body > 0 && body_bytes > max_body {
            anyhow::bail!("upstream response body too large");
        }
        let chunk = upstream.buf.split_to(n);
        client_stream.write_all(&chunk).await?;
    }
    Ok(())
}

/// Forwards a chunked-transfer-coded body verbatim from `upstream` to
/// `client_stream`, chunk framing included, rejecting a cumulative body past
/// `max_body` bytes (0 disables the limit). Used for both response bodies
/// (upstream -> client) and request bodies (client -> upstream): the caller
/// decides which direction by choice of reader/writer.
pub(crate) async fn forward_chunked_body<U, C>(
    upstream: &mut UpstreamReader<U>,
    client_stream: &mut C,
    read_timeout: Duration,
    max_body: usize,
) -> anyhow::Result<()>
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut body_bytes = 0usize;

    loop {
        let line = read_line(upstream, read_timeout).await?;
        client_stream.write_all(&line).await?;

        let line_str = String::from_utf8_lossy(&line);
        let size_str = line_str.trim().trim_end_matches('\r').trim_end_matches('\n');
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let chunk_size =
            usize::from_str_radix(size_str, 16).map_err(|_| anyhow::anyhow!("invalid chunk size"))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_line(upstream, read_timeout).await?;
                client_stream.write_all(&trailer).await?;
                if trailer == b"\r\n" {
                    return Ok(());
                }
            }
        }

        if max_body > 0 && body_bytes + chunk_size > max_body {
            anyhow::bail!("body too large");
        }
        body_bytes += chunk_size;

        read_exact_from_buf(upstream, client_stream, read_timeout, chunk_size + 2).await?;
    }
}

async fn read_line<U: AsyncRead + Unpin>(
    upstream: &mut UpstreamReader<U>,
    read_timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    loop {
        if let Some(pos) = upstream.buf.windows(2).position(|w| w == b"\r\n") {
            let line = upstream.buf.split_to(pos + 2);
            return Ok(line.to_vec());
        }
        let n = read_more(upstream, read_timeout).await?;
        if n == 0 {
            anyhow::bail!("upstream closed connection while reading chunked line");
        }
    }
}

async fn read_exact_from_buf<U, C>(
    upstream: &mut UpstreamReader<U>,
    client_stream: &mut C,
    read_timeout: Duration,
    mut remaining: usize,
) -> anyhow::Result<()>
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    while remaining > 0 {
        if upstream.buf.is_empty() {
            let n = read_more(upstream, read_timeout).await?;
            if n == 0 {
                anyhow::bail!("upstream closed connection while reading chunked body");
            }
        }
        let take = remaining.min(upstream.buf.len());
        let chunk = upstream.buf.split_to(take);
        client_stream.write_all(&chunk).await?;
        remaining -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_duplicate_content_length() {
        let headers = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n";
        let info = parse_response_headers(headers).expect("expected ok");
        assert_eq!(info.content_length, Some(5));
    }

    #[test]
    fn rejects_conflicting_content_length() {
        let headers = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        let err = parse_response_headers(headers).unwrap_err();
        assert!(err.to_string().contains("conflicting Content-Length"));
    }

    #[test]
    fn detects_chunked_encoding() {
        let headers = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, \"chunked\"\r\n\r\n";
        let info = parse_response_headers(headers).expect("expected ok");
        assert!(info.is_chunked);
    }

    #[test]
    fn extracts_status_code() {
        let headers = b"HTTP/1.1 204 No Content\r\n\r\n";
        let info = parse_response_headers(headers).expect("expected ok");
        assert_eq!(info.status_code, Some(204));
    }

    #[tokio::test]
    async fn stream_http_response_rejects_content_length_over_max_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut upstream = UpstreamReader::new(&raw[..]);
        let mut client = Vec::new();
        let err = stream_http_response(&mut upstream, &mut client, "GET", Duration::from_secs(1), 0, 5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn stream_http_response_allows_content_length_within_max_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut upstream = UpstreamReader::new(&raw[..]);
        let mut client = Vec::new();
        let status = stream_http_response(&mut upstream, &mut client, "GET", Duration::from_secs(1), 0, 5)
            .await
            .unwrap();
        assert_eq!(status, 200);
        assert_eq!(&client[client.len() - 5..], b"hello");
    }

    #[tokio::test]
    async fn forward_chunked_body_rejects_cumulative_size_over_max_body() {
        let raw = b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n";
        let mut upstream = UpstreamReader::new(&raw[..]);
        let mut client = Vec::new();
        let err = forward_chunked_body(&mut upstream, &mut client, Duration::from_secs(1), 8)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
