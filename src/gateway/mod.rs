//! Authorizing HTTP/2 reverse proxy.
//!
//! Runs on TLS connections whose resolved port gets the HTTP treatment.
//! Each request is authorized (unless the port is public) and proxied to
//! the task's container through a pooled transport whose "dial" opens a
//! fresh tunnel connection.

pub mod auth;

pub use auth::StaticTokenVerifier;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{header, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::registry::AuthVerifier;
use crate::sni::{ParsedSni, ResolvedSni, SniResolver};
use crate::tunnel::{TunnelConn, TunnelDialer};

/// Client address reported on tunnel opens made on behalf of pooled
/// reverse-proxy transports, which outlive any single user connection.
const PROXY_CLIENT_ADDR: &str = "reverse-proxy";

/// Idle pooled connections are cheap to re-establish (one Open round-trip
/// over a fresh RPC), so they are not kept long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type GatewayBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn text_body(status: StatusCode, text: &'static str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(text.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response builds")
}

pub struct Gateway {
    verifier: Arc<dyn AuthVerifier>,
    client: Client<TunnelConnector, Incoming>,
    config: watch::Receiver<Arc<Config>>,
}

impl Gateway {
    pub fn new(
        verifier: Arc<dyn AuthVerifier>,
        resolver: Arc<SniResolver>,
        dialer: Arc<TunnelDialer>,
        config: watch::Receiver<Arc<Config>>,
        cancel: CancellationToken,
    ) -> Self {
        let connector = TunnelConnector {
            resolver,
            dialer,
            cancel,
        };
        // The fan-in bound is the HTTP/2 server's default stream concurrency;
        // the pool itself is unbounded.
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(usize::MAX)
            .build(connector);
        Self {
            verifier,
            client,
            config,
        }
    }

    /// Serve HTTP/2 on a terminated TLS connection.
    pub async fn serve(
        self: Arc<Self>,
        stream: TlsStream<TcpStream>,
        parsed: ParsedSni,
        resolved: ResolvedSni,
        peer: SocketAddr,
    ) {
        debug!(%peer, sni = %parsed, task = %resolved.task_name, "serving reverse proxy");
        let ctx = Arc::new(ConnContext {
            gateway: self,
            resolved,
            peer,
        });
        let service = hyper::service::service_fn(move |req| {
            let ctx = Arc::clone(&ctx);
            async move { Ok::<_, std::convert::Infallible>(ctx.handle(req).await) }
        });

        let served = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await;
        if let Err(err) = served {
            debug!(%peer, error = %err, "reverse proxy connection ended");
        }
    }
}

struct ConnContext {
    gateway: Arc<Gateway>,
    resolved: ResolvedSni,
    peer: SocketAddr,
}

impl ConnContext {
    async fn handle(&self, req: Request<Incoming>) -> Response<GatewayBody> {
        // Public ports are proxied as-is.
        if self.resolved.port_is_public {
            return self.proxy(req).await;
        }
        if req.uri().path() == auth::AUTH_REDIRECT_PATH {
            return auth::complete_auth_redirect(&req);
        }
        match auth::authorize(&req, self.gateway.verifier.as_ref(), &self.resolved).await {
            Ok(_claims) => self.proxy(req).await,
            Err(reason) => {
                debug!(peer = %self.peer, task = %self.resolved.task_name, %reason, "request not authorized");
                let original_url = format!(
                    "https://{}{}",
                    request_host(&req).unwrap_or_default(),
                    req.uri()
                        .path_and_query()
                        .map(|pq| pq.as_str())
                        .unwrap_or("/"),
                );
                let dashboard = self.gateway.config.borrow().gateway.dashboard_url.clone();
                auth::unauthorized_response(&req, &self.resolved, &original_url, &dashboard, &reason)
            }
        }
    }

    async fn proxy(&self, mut req: Request<Incoming>) -> Response<GatewayBody> {
        let Some(host) = request_host(&req) else {
            return text_body(StatusCode::BAD_REQUEST, "request has no host\n");
        };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = match format!("http://{host}{path_and_query}").parse() {
            Ok(uri) => uri,
            Err(_) => return text_body(StatusCode::BAD_REQUEST, "request target is invalid\n"),
        };
        *req.uri_mut() = uri;
        // The pooled transport speaks HTTP/1.1 to the connector.
        *req.version_mut() = http::Version::HTTP_11;

        let headers = req.headers_mut();
        if !self.resolved.port_is_public {
            headers.remove(header::AUTHORIZATION);
            auth::scrub_auth_cookie(headers);
        }
        // Suppress the client library's default agent rather than mislabel
        // the user's request.
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, header::HeaderValue::from_static(""));
        }

        match self.gateway.client.request(req).await {
            Ok(response) => response.map(|body| body.boxed()),
            Err(err) => {
                warn!(peer = %self.peer, task = %self.resolved.task_name, error = %err, "upstream request failed");
                text_body(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "The connector is temporarily unavailable. Please retry shortly.\n",
                )
            }
        }
    }
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.to_string());
    }
    req.headers()
        .get(header::HOST)?
        .to_str()
        .ok()
        .map(str::to_owned)
}

/// Pooled-transport connector: a "dial" resolves the target task from the
/// request authority (sharing the frontend's SNI cache) and opens a fresh
/// tunnel connection to its container.
#[derive(Clone)]
struct TunnelConnector {
    resolver: Arc<SniResolver>,
    dialer: Arc<TunnelDialer>,
    cancel: CancellationToken,
}

impl tower::Service<Uri> for TunnelConnector {
    type Response = TunnelIo;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let host = uri.host().ok_or("upstream URI has no host")?;
            let target = host.split('.').next().unwrap_or(host);
            let parsed = ParsedSni::parse(target)?;
            let resolved = this.resolver.resolve(&parsed).await?;
            let conn = this
                .dialer
                .dial(&this.cancel, &parsed, &resolved, PROXY_CLIENT_ADDR)
                .await?;
            Ok(TunnelIo(TokioIo::new(conn)))
        })
    }
}

/// A tunnel connection as a hyper transport.
struct TunnelIo(TokioIo<TunnelConn>);

impl hyper::rt::Read for TunnelIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.0), cx, buf)
    }
}

impl hyper::rt::Write for TunnelIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.0), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.0), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.0), cx)
    }
}

impl Connection for TunnelIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}
