//! Tunnel client: a byte-oriented duplex connection over the shard proxy RPC.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Future, Stream};
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};
use tonic::metadata::BinaryMetadataValue;
use tracing::{debug, warn};

use super::proto::{tunnel_client::TunnelClient, Open, Status, TunnelRequest, TunnelResponse};
use crate::error::{ProxyError, Result};
use crate::registry::{labels, Claims, LabelSelector, ShardRegistry};
use crate::sni::{ParsedSni, ResolvedSni};

/// Metadata key carrying the dial-side claims to the tunnel backend.
pub const CLAIMS_METADATA_KEY: &str = "streamgate-claims-bin";

/// Terminal classification of one dial attempt, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStatus {
    ListCancelled,
    ErrList,
    ErrNoPrimary,
    ErrCallProxy,
    ErrOpen,
    Ok,
    /// Pump-side classifications, recorded when the connection closes.
    ErrRead,
    ErrClose,
}

impl DialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialStatus::ListCancelled => "ListCancelled",
            DialStatus::ErrList => "ErrList",
            DialStatus::ErrNoPrimary => "ErrNoPrimary",
            DialStatus::ErrCallProxy => "ErrCallProxy",
            DialStatus::ErrOpen => "ErrOpen",
            DialStatus::Ok => "OK",
            DialStatus::ErrRead => "ErrRead",
            DialStatus::ErrClose => "ErrClose",
        }
    }
}

/// Dials shard primaries and opens tunnel connections to their containers.
pub struct TunnelDialer {
    registry: Arc<dyn ShardRegistry>,
}

impl TunnelDialer {
    pub fn new(registry: Arc<dyn ShardRegistry>) -> Self {
        Self { registry }
    }

    /// Open a tunnel to `parsed.port` of a primary-ready shard matching the
    /// parsed and resolved SNI.
    ///
    /// The returned connection has its own lifetime, deliberately not tied
    /// to the dial-site caller.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        parsed: &ParsedSni,
        resolved: &ResolvedSni,
        client_addr: &str,
    ) -> Result<TunnelConn> {
        let (status, result) = self.dial_inner(cancel, parsed, resolved, client_addr).await;
        match &result {
            Ok(_) => debug!(sni = %parsed, status = status.as_str(), "dialed shard tunnel"),
            Err(err) => {
                warn!(sni = %parsed, status = status.as_str(), error = %err, "shard tunnel dial failed");
            }
        }
        result.map_err(|source| ProxyError::ShardDial {
            sni: parsed.to_string(),
            source,
        })
    }

    async fn dial_inner(
        &self,
        cancel: &CancellationToken,
        parsed: &ParsedSni,
        resolved: &ResolvedSni,
        client_addr: &str,
    ) -> (DialStatus, anyhow::Result<TunnelConn>) {
        let mut selector = LabelSelector::default()
            .include(labels::EXPOSE_PORT, parsed.port.to_string())
            .include(labels::HOSTNAME, &parsed.hostname)
            .with_id_prefix(&resolved.shard_id_prefix);
        if let Some(key) = &parsed.key_begin {
            selector = selector.include(labels::KEY_BEGIN, key);
        }
        if let Some(rclock) = &parsed.r_clock_begin {
            selector = selector.include(labels::RCLOCK_BEGIN, rclock);
        }

        let mut shards = tokio::select! {
            listed = self.registry.list(&selector) => match listed {
                Ok(shards) => shards,
                Err(err) => return (DialStatus::ErrList, Err(err.context("listing shards"))),
            },
            () = cancel.cancelled() => {
                return (DialStatus::ListCancelled, Err(anyhow::anyhow!("dial cancelled")));
            }
        };

        shards.shuffle(&mut rand::thread_rng());
        let Some((shard_id, endpoint)) = shards.iter().find_map(|shard| {
            shard
                .route
                .primary_endpoint()
                .map(|ep| (shard.spec.id.clone(), ep.to_string()))
        }) else {
            return (
                DialStatus::ErrNoPrimary,
                Err(anyhow::anyhow!("no ready primary for {parsed}")),
            );
        };

        let claims = Claims::network_proxy(
            LabelSelector::default().with_id_prefix(&resolved.shard_id_prefix),
        );

        let channel = match tonic::transport::Endpoint::from_shared(endpoint.clone())
            .map(|ep| ep.connect_timeout(std::time::Duration::from_secs(5)))
        {
            Ok(ep) => match ep.connect().await {
                Ok(channel) => channel,
                Err(err) => {
                    return (
                        DialStatus::ErrCallProxy,
                        Err(anyhow::Error::from(err)
                            .context(format!("connecting to shard endpoint {endpoint}"))),
                    );
                }
            },
            Err(err) => {
                return (
                    DialStatus::ErrCallProxy,
                    Err(anyhow::Error::from(err)
                        .context(format!("invalid shard endpoint {endpoint}"))),
                );
            }
        };

        // Queue Open ahead of starting the call, then require a matching
        // OpenResponse before handing the connection out.
        let (tx, rx) = mpsc::channel::<TunnelRequest>(8);
        tx.send(TunnelRequest {
            open: Some(Open {
                shard_id: shard_id.clone(),
                target_port: parsed.port as u32,
                client_addr: client_addr.to_string(),
            }),
            data: Vec::new(),
        })
        .await
        .expect("channel has capacity");

        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        let claims_bytes = match serde_json::to_vec(&claims) {
            Ok(bytes) => bytes,
            Err(err) => return (DialStatus::ErrCallProxy, Err(err.into())),
        };
        request.metadata_mut().insert_bin(
            CLAIMS_METADATA_KEY,
            BinaryMetadataValue::from_bytes(&claims_bytes),
        );

        let mut client = TunnelClient::new(channel);
        let mut responses = match client.proxy(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                return (
                    DialStatus::ErrCallProxy,
                    Err(anyhow::Error::from(status).context("starting proxy RPC")),
                );
            }
        };

        let opened = match responses.message().await {
            Ok(Some(first)) => first.opened,
            Ok(None) => {
                return (
                    DialStatus::ErrOpen,
                    Err(anyhow::anyhow!("RPC ended before an open response")),
                );
            }
            Err(status) => {
                return (
                    DialStatus::ErrOpen,
                    Err(anyhow::Error::from(status).context("awaiting open response")),
                );
            }
        };
        match opened {
            Some(opened) if opened.status == Status::Ok as i32 => {}
            Some(opened) => {
                return (
                    DialStatus::ErrOpen,
                    Err(anyhow::anyhow!(
                        "shard refused tunnel ({}): {}",
                        Status::try_from(opened.status)
                            .map(|s| s.as_str_name())
                            .unwrap_or("UNKNOWN"),
                        opened.error,
                    )),
                );
            }
            None => {
                return (
                    DialStatus::ErrOpen,
                    Err(anyhow::anyhow!("first response frame is not an open response")),
                );
            }
        }

        let abort = CancellationToken::new();
        (
            DialStatus::Ok,
            Ok(TunnelConn {
                rx: responses,
                readbuf: Bytes::new(),
                tx: PollSender::new(tx),
                abort_wait: Box::pin(abort.clone().cancelled_owned()),
                abort,
                read_closed: false,
                read_failed: false,
                shard_id,
                bytes_in: 0,
                bytes_out: 0,
            }),
        )
    }
}

/// Handle for forcing a tunnel connection closed from another task.
#[derive(Clone)]
pub struct TunnelAbort(CancellationToken);

impl TunnelAbort {
    /// Abort the connection: pending and future reads fail immediately.
    pub fn abort(&self) {
        self.0.cancel();
    }
}

/// A full-duplex byte connection to one port of a shard's container.
///
/// Reads poll the response stream; writes feed the request stream. Shutting
/// down the write half half-closes the RPC so the backend can drain; dropping
/// the connection cancels the RPC outright, which is what keeps a concurrent
/// reader from ever hanging on a response that will not come.
pub struct TunnelConn {
    rx: tonic::Streaming<TunnelResponse>,
    readbuf: Bytes,
    tx: PollSender<TunnelRequest>,
    abort: CancellationToken,
    abort_wait: Pin<Box<WaitForCancellationFutureOwned>>,
    read_closed: bool,
    read_failed: bool,
    shard_id: String,
    bytes_in: u64,
    bytes_out: u64,
}

impl TunnelConn {
    pub fn abort_handle(&self) -> TunnelAbort {
        TunnelAbort(self.abort.clone())
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = this.readbuf.len().min(buf.remaining());
                buf.put_slice(&this.readbuf.split_to(n));
                this.bytes_in += n as u64;
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            // The short-circuit keeps the owned wait future from being
            // polled again once it has already completed.
            if this.abort.is_cancelled() || this.abort_wait.as_mut().poll(cx).is_ready() {
                this.read_failed = true;
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "tunnel connection aborted",
                )));
            }
            match Pin::new(&mut this.rx).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(status))) => {
                    this.read_failed = true;
                    return Poll::Ready(Err(std::io::Error::other(status)));
                }
                Poll::Ready(Some(Ok(frame))) => {
                    this.readbuf = Bytes::from(frame.data);
                    // Loop: an empty frame simply polls for the next one.
                }
            }
        }
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match this.tx.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_closed)) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel send side is closed",
            ))),
            Poll::Ready(Ok(())) => {
                let sent = this.tx.send_item(TunnelRequest {
                    open: None,
                    data: buf.to_vec(),
                });
                if sent.is_err() {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "tunnel send side is closed",
                    )));
                }
                this.bytes_out += buf.len() as u64;
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Half-close the RPC send side. The backend observes end-of-requests
    /// and keeps streaming its remaining responses.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().tx.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        let status = if self.read_failed {
            DialStatus::ErrRead
        } else {
            DialStatus::Ok
        };
        debug!(
            shard = %self.shard_id,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            status = status.as_str(),
            "tunnel connection closed"
        );
    }
}
