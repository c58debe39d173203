//! TLS multiplexing frontend.
//!
//! One external listener serves three kinds of traffic: pass-through
//! connections for the fallback listener, raw TCP bridges to task shards,
//! and the authorizing HTTP/2 reverse proxy. The ClientHello is inspected
//! before a server config is chosen, so routing, the fail-fast shard dial,
//! and ALPN selection all happen inside the handshake.

pub mod http_err;
pub mod tap;

pub use tap::{Tap, TapConn, TapSender};

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::Acceptor;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge;
use crate::error::{ProxyError, Result};
use crate::gateway::Gateway;
use crate::sni::{ParsedSni, ResolvedSni, SniDirective, SniResolver};
use crate::tunnel::{TunnelConn, TunnelDialer};

/// Certificates presented by the frontend for every terminated connection.
pub struct FrontendTls {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl FrontendTls {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let mut certs_reader = BufReader::new(std::fs::File::open(cert_path)?);
        let certs = rustls_pemfile::certs(&mut certs_reader)
            .collect::<std::io::Result<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(ProxyError::Config(format!(
                "{} contains no certificates",
                cert_path.display()
            )));
        }

        let mut key_reader = BufReader::new(std::fs::File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
            ProxyError::Config(format!("{} contains no private key", key_path.display()))
        })?;

        Ok(Self { certs, key })
    }

    pub fn from_der(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { certs, key }
    }

    /// Per-connection server config carrying the chosen ALPN protocols.
    fn server_config(&self, alpn: &[&str]) -> Result<Arc<ServerConfig>> {
        let provider = rustls::crypto::ring::default_provider();
        let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(Arc::new(config))
    }
}

/// Routing decided during the handshake, before the server config is chosen.
enum Outcome {
    /// Hand the TLS-wrapped stream to the fallback listener.
    Pass,
    /// Complete the handshake as `http/1.1` and answer with a diagnostic.
    Fail(ProxyError),
    /// TCP-proxy to the already-dialed shard tunnel.
    Tcp { conn: TunnelConn, alpn: String },
    /// Terminate TLS and run the authorizing reverse proxy.
    Http {
        parsed: ParsedSni,
        resolved: ResolvedSni,
    },
}

pub struct Frontend {
    resolver: Arc<SniResolver>,
    dialer: Arc<TunnelDialer>,
    gateway: Arc<Gateway>,
    tls: Option<FrontendTls>,
    tap: TapSender,
    cancel: CancellationToken,
}

impl Frontend {
    /// Build the frontend and its fallback [`Tap`]. Without a TLS config,
    /// every accepted connection is forwarded raw.
    pub fn new(
        resolver: Arc<SniResolver>,
        dialer: Arc<TunnelDialer>,
        gateway: Arc<Gateway>,
        tls: Option<FrontendTls>,
        cancel: CancellationToken,
    ) -> (Self, Tap) {
        let (tap, tap_rx) = tap::channel();
        (
            Self {
                resolver,
                dialer,
                gateway,
                tls,
                tap,
                cancel,
            },
            tap_rx,
        )
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            tls = self.tls.is_some(),
            "frontend serving"
        );
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.tap.close(None);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            self.tap.close(Some(ProxyError::Io(err)));
                            return Err(ProxyError::ListenerClosed);
                        }
                    };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        tokio::select! {
                            () = this.cancel.cancelled() => {}
                            () = this.handle(stream, peer) => {}
                        }
                    });
                }
            }
        }
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(tls) = &self.tls else {
            self.tap.forward(TapConn::Raw(stream)).await;
            return;
        };

        let mut acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
        let start = match (&mut acceptor).await {
            Ok(start) => start,
            Err(err) => {
                debug!(%peer, error = %err, "client hello was not TLS");
                if let Some(mut raw) = acceptor.take_io() {
                    let _ = http_err::write_misdirected(&mut raw).await;
                }
                return;
            }
        };

        let sni = start.client_hello().server_name().map(str::to_owned);
        let outcome = self.decide(sni.as_deref(), peer).await;

        let alpn: Vec<&str> = match &outcome {
            Outcome::Pass => vec!["h2", "http/1.1"],
            Outcome::Fail(_) => vec!["http/1.1"],
            Outcome::Tcp { alpn, .. } => vec![alpn.as_str()],
            Outcome::Http { .. } => vec!["h2"],
        };
        let config = match tls.server_config(&alpn) {
            Ok(config) => config,
            Err(err) => {
                warn!(%peer, error = %err, "building server config");
                return;
            }
        };

        let mut tls_stream = match start.into_stream(config).await {
            Ok(tls_stream) => tls_stream,
            Err(err) => {
                // The dialed tunnel, if any, is dropped (closed) with `outcome`.
                debug!(%peer, sni = ?sni, error = %err, "TLS handshake failed");
                return;
            }
        };

        match outcome {
            Outcome::Pass => {
                debug!(%peer, sni = ?sni, "passing connection to fallback listener");
                self.tap.forward(TapConn::Tls(Box::new(tls_stream))).await;
            }
            Outcome::Fail(err) => {
                let (status, reason) = err.http_disposition();
                debug!(%peer, sni = ?sni, status, error = %err, "answering handshake error");
                let body = format!("{err}\n");
                let _ = http_err::write_response(&mut tls_stream, status, reason, &body).await;
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut tls_stream).await;
            }
            Outcome::Tcp { conn, .. } => {
                if let Err(err) = bridge::enable_keepalive(tls_stream.get_ref().0) {
                    warn!(%peer, error = %err, "enabling TCP keep-alive");
                }
                let status = bridge::run(tls_stream, conn).await;
                debug!(%peer, sni = ?sni, status = status.as_str(), "TCP proxy finished");
            }
            Outcome::Http { parsed, resolved } => {
                self.gateway
                    .clone()
                    .serve(tls_stream, parsed, resolved, peer)
                    .await;
            }
        }
    }

    async fn decide(&self, sni: Option<&str>, peer: SocketAddr) -> Outcome {
        let parsed = match self.resolver.classify(sni) {
            Ok(SniDirective::Pass) => return Outcome::Pass,
            Ok(SniDirective::Task(parsed)) => parsed,
            Err(err) => return Outcome::Fail(err),
        };
        let resolved = match self.resolver.resolve(&parsed).await {
            Ok(resolved) => resolved,
            Err(err) => return Outcome::Fail(err),
        };

        match resolved.port_protocol.clone() {
            // TCP proxy: dial during the handshake so a dial failure
            // surfaces now rather than as a post-handshake disconnect.
            Some(alpn) => {
                let dialed = self
                    .dialer
                    .dial(&self.cancel, &parsed, &resolved, &peer.to_string())
                    .await;
                match dialed {
                    Ok(conn) => Outcome::Tcp { conn, alpn },
                    Err(err) => Outcome::Fail(err),
                }
            }
            None => Outcome::Http { parsed, resolved },
        }
    }
}
