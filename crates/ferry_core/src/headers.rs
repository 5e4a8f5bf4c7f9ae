//! Request header rewriting applied on the proxy -> upstream leg.

use std::collections::HashSet;

/// Rewrites a client request's headers for forwarding to an upstream:
/// - Drops previously set `X-Forwarded-*`/`X-Real-IP` headers so they cannot
///   be spoofed by the client and duplicated.
/// - Drops hop-by-hop headers (`Connection`, `Keep-Alive`, `TE`, `Trailer`,
///   `Transfer-Encoding`, `Upgrade`) and any header named by a `Connection`
///   token, per RFC 7230.
/// - Preserves the original `Host` header and appends `X-Forwarded-For`,
///   `X-Forwarded-Host`, `X-Forwarded-Proto`.
pub(crate) fn rewrite_proxy_headers(
    req_headers: &str,
    peer_ip: &str,
    keep_alive: bool,
    body_len: usize,
    is_chunked: bool,
) -> String {
    let connection_tokens = collect_connection_tokens(req_headers);
    let mut lines = req_headers.lines();
    let _ = lines.next(); // request line

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut host_value: Option<String> = None;
    let mut forwarded_for: Option<String> = None;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name_trim = name.trim().to_string();
        let value_trim = value.trim().to_string();
        let name_lower = name_trim.to_ascii_lowercase();

        if name_trim.eq_ignore_ascii_case("host") {
            host_value = Some(value_trim.clone());
            headers.push((name_trim, value_trim));
            continue;
        }

        if name_trim.eq_ignore_ascii_case("x-forwarded-for") {
            forwarded_for = Some(value_trim);
            continue;
        }

        if name_trim.eq_ignore_ascii_case("x-real-ip")
            || name_trim.eq_ignore_ascii_case("x-forwarded-proto")
            || name_trim.eq_ignore_ascii_case("x-forwarded-host")
        {
            continue;
        }

        if name_trim.eq_ignore_ascii_case("connection")
            || name_trim.eq_ignore_ascii_case("keep-alive")
            || name_trim.eq_ignore_ascii_case("proxy-connection")
            || name_trim.eq_ignore_ascii_case("te")
            || name_trim.eq_ignore_ascii_case("trailer")
            || name_trim.eq_ignore_ascii_case("transfer-encoding")
            || name_trim.eq_ignore_ascii_case("upgrade")
            || name_trim.eq_ignore_ascii_case("content-length")
        {
            continue;
        }

        if connection_tokens.contains(&name_lower) {
            continue;
        }

        headers.push((name_trim, value_trim));
    }

    let forwarded_for_value = match forwarded_for {
        Some(prior) => format!("{prior}, {peer_ip}"),
        None => peer_ip.to_string(),
    };
    headers.push(("X-Forwarded-For".to_string(), forwarded_for_value));
    headers.push(("X-Forwarded-Proto".to_string(), "http".to_string()));

    if let Some(h) = host_value {
        headers.push(("X-Forwarded-Host".to_string(), h));
    }

    let connection_value = if keep_alive { "keep-alive" } else { "close" };
    headers.push(("Connection".to_string(), connection_value.to_string()));

    if is_chunked {
        headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
    } else {
        headers.push(("Content-Length".to_string(), body_len.to_string()));
    }

    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(&name);
        out.push_str(": ");
        out.push_str(&value);
        out.push_str("\r\n");
    }
    out
}

fn collect_connection_tokens(req_headers: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut lines = req_headers.lines();
    let _ = lines.next();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("connection") {
            continue;
        }
        for token in split_header_tokens(value) {
            tokens.insert(token);
        }
    }
    tokens
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
