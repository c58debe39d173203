//! Fallback listener adapter.
//!
//! Connections the TLS multiplexer does not claim are forwarded here: raw
//! TCP when no TLS config is active, TLS-wrapped streams for pass-through
//! server names (TLS termination already done, so ALPN and inner-protocol
//! negotiation survive for the downstream consumer).

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tracing::warn;

use crate::error::{ProxyError, Result};

/// Forwarding channel depth between the frontend and the fallback consumer.
pub const TAP_BUFFER: usize = 4;

/// A connection handed to the fallback listener.
pub enum TapConn {
    Raw(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl TapConn {
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            TapConn::Raw(stream) => stream.peer_addr(),
            TapConn::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for TapConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TapConn::Raw(stream) => Pin::new(stream).poll_read(cx, buf),
            TapConn::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TapConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TapConn::Raw(stream) => Pin::new(stream).poll_write(cx, buf),
            TapConn::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TapConn::Raw(stream) => Pin::new(stream).poll_flush(cx),
            TapConn::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TapConn::Raw(stream) => Pin::new(stream).poll_shutdown(cx),
            TapConn::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Producer half, held by the frontend.
#[derive(Clone)]
pub struct TapSender {
    tx: mpsc::Sender<TapConn>,
    term: Arc<Mutex<Option<ProxyError>>>,
}

impl TapSender {
    /// Forward a connection, blocking while the fallback consumer is behind.
    pub async fn forward(&self, conn: TapConn) {
        if self.tx.send(conn).await.is_err() {
            warn!("fallback listener is gone; dropping connection");
        }
    }

    /// Record the serve loop's terminal error for `Tap::accept` to surface
    /// once the channel drains.
    pub fn close(&self, err: Option<ProxyError>) {
        *self.term.lock() = err;
    }
}

/// Consumer half: a pull-style listener over forwarded connections.
pub struct Tap {
    rx: mpsc::Receiver<TapConn>,
    term: Arc<Mutex<Option<ProxyError>>>,
}

impl Tap {
    pub async fn accept(&mut self) -> Result<TapConn> {
        match self.rx.recv().await {
            Some(conn) => Ok(conn),
            None => Err(self
                .term
                .lock()
                .take()
                .unwrap_or(ProxyError::ListenerClosed)),
        }
    }
}

pub fn channel() -> (TapSender, Tap) {
    let (tx, rx) = mpsc::channel(TAP_BUFFER);
    let term = Arc::new(Mutex::new(None));
    (
        TapSender {
            tx,
            term: Arc::clone(&term),
        },
        Tap { rx, term },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_surfaces_terminal_error_after_drain() {
        let (sender, mut tap) = channel();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        sender.forward(TapConn::Raw(accepted)).await;
        sender.close(Some(ProxyError::ListenerClosed));
        drop(sender);

        assert!(tap.accept().await.is_ok());
        match tap.accept().await {
            Err(ProxyError::ListenerClosed) => {}
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("unexpected connection"),
        }
    }
}
