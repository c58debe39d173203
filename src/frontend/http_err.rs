//! Best-effort HTTP/1.1 diagnostics written straight onto a stream.
//!
//! When the handshake callback hits an error the connection completes with
//! `http/1.1` ALPN so that a descriptive body can be written to HTTP-speaking
//! clients before closing.

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub async fn write_response<W>(
    stream: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// The `421` written when the TLS handshake itself failed.
pub async fn write_misdirected<W>(stream: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_response(
        stream,
        421,
        "Misdirected Request",
        "This service may only be accessed using TLS.\n",
    )
    .await
}
