//! streamgate: TLS frontend, shard tunnel backend, and connector runtime
//! of the data plane, in one process.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use streamgate::config::{self, Config};
use streamgate::frontend::{Frontend, FrontendTls, TapConn};
use streamgate::gateway::{Gateway, StaticTokenVerifier};
use streamgate::registry::fixed::FixedRegistry;
use streamgate::registry::ShardRegistry;
use streamgate::sni::SniResolver;
use streamgate::tunnel::proto::tunnel_server::TunnelServer;
use streamgate::tunnel::{TunnelBackend, TunnelDialer};

const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "streamgate.toml".to_string()),
    );
    let config = Config::load(&config_path)?;
    config.validate()?;

    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(&config.log.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config_rx, mut level_rx) = config::spawn_config_watcher(
        config_path.clone(),
        Arc::new(config.clone()),
        CONFIG_RELOAD_INTERVAL,
    );
    tokio::spawn(async move {
        while level_rx.changed().await.is_ok() {
            let level = level_rx.borrow().clone();
            if let Err(err) = reload_handle.reload(EnvFilter::new(&level)) {
                warn!(error = %err, "applying reloaded log level");
            }
        }
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        }
    });

    let registry: Arc<dyn ShardRegistry> = Arc::new(FixedRegistry::new(config.tasks.clone()));

    // Tunnel backend, terminating proxy RPCs next to task containers.
    let backend = TunnelBackend::new(registry.clone());
    let tunnel_addr = config.server.tunnel_listen;
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            info!(addr = %tunnel_addr, "tunnel backend serving");
            let served = tonic::transport::Server::builder()
                .add_service(TunnelServer::new(backend))
                .serve_with_shutdown(tunnel_addr, cancel.cancelled_owned())
                .await;
            if let Err(err) = served {
                error!(error = %err, "tunnel backend failed");
            }
        }
    });

    // Frontend and reverse-proxy gateway.
    let resolver = Arc::new(SniResolver::new(
        registry.clone(),
        config.frontend.fqdn.clone(),
        config.frontend.allowed_domains.clone(),
    ));
    let dialer = Arc::new(TunnelDialer::new(registry.clone()));
    let verifier = Arc::new(StaticTokenVerifier::new(config.gateway.tokens.clone()));
    let gateway = Arc::new(Gateway::new(
        verifier,
        resolver.clone(),
        dialer.clone(),
        config_rx,
        cancel.clone(),
    ));
    let tls = match (&config.frontend.cert_file, &config.frontend.key_file) {
        (Some(cert), Some(key)) => Some(FrontendTls::load(cert, key)?),
        _ => None,
    };
    let (frontend, mut tap) = Frontend::new(resolver, dialer, gateway, tls, cancel.clone());

    // Fallback responder: answers traffic the multiplexer does not claim.
    tokio::spawn(async move {
        loop {
            match tap.accept().await {
                Ok(conn) => {
                    tokio::spawn(serve_fallback(conn));
                }
                Err(err) => {
                    info!(error = %err, "fallback listener finished");
                    break;
                }
            }
        }
    });

    let listener = TcpListener::bind(config.server.listen).await?;
    Arc::new(frontend).serve(listener).await?;
    Ok(())
}

async fn serve_fallback(conn: TapConn) {
    let service = hyper::service::service_fn(|req: http::Request<Incoming>| async move {
        let (status, body) = match req.uri().path() {
            "/healthz" => (StatusCode::OK, "ok\n"),
            _ => (StatusCode::NOT_FOUND, "no such resource\n"),
        };
        let response = Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .expect("static response builds");
        Ok::<_, Infallible>(response)
    });

    let served = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(conn), service)
        .await;
    if let Err(err) = served {
        debug!(error = %err, "fallback connection ended");
    }
}
