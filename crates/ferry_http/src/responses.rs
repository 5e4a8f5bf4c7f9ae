use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Generic helper for sending an HTTP response with a binary body.
pub async fn send_response<W: AsyncWrite + Unpin + ?Sized>(
    stream: &mut W,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> anyhow::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Server: ferryd/0.1.0\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );

    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn send_text_response<W: AsyncWrite + Unpin + ?Sized>(
    stream: &mut W,
    status: &str,
    body: &str,
) -> anyhow::Result<()> {
    send_response(stream, status, "text/plain; charset=utf-8", body.as_bytes()).await
}

/// Send a 400 Bad Request response.
pub async fn send_400<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_text_response(stream, "400 Bad Request", "400 Bad Request\n").await
}

/// Send a 408 Request Timeout response.
pub async fn send_408<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_text_response(stream, "408 Request Timeout", "408 Request Timeout\n").await
}

/// Send a 413 Request Entity Too Large response.
pub async fn send_413<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_text_response(
        stream,
        "413 Request Entity Too Large",
        "413 Request Entity Too Large\n",
    )
    .await
}

/// Send a 431 Request Header Fields Too Large response.
pub async fn send_431<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_text_response(
        stream,
        "431 Request Header Fields Too Large",
        "431 Request Header Fields Too Large\n",
    )
    .await
}

/// Send a 502 Bad Gateway response.
pub async fn send_502<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_text_response(stream, "502 Bad Gateway", "502 Bad Gateway\n").await
}

/// Send a 503 Service Unavailable response.
pub async fn send_503<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_text_response(stream, "503 Service Unavailable", "503 Service Unavailable\n").await
}
