//! Tunnel backend: terminates proxy RPCs next to the shard's container.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::proto::{tunnel_server::Tunnel, Opened, Status, TunnelRequest, TunnelResponse};
use crate::registry::{Claims, LogEvent, ResolveRequest, ResolveStatus, ShardRegistry};
use crate::tunnel::client::CLAIMS_METADATA_KEY;

/// Reserved port on which a connector receives its invocation requests.
/// Never a valid proxy target.
pub const CONNECTOR_INIT_PORT: u16 = 49092;

/// Read size of the delegate → client pump.
const DELEGATE_READ_BUFFER: usize = 16 * 1024;

/// Server side of the tunnel RPC. Resolves the shard locally, dials its
/// container, and pumps bytes both ways until either side closes.
pub struct TunnelBackend {
    registry: Arc<dyn ShardRegistry>,
}

impl TunnelBackend {
    pub fn new(registry: Arc<dyn ShardRegistry>) -> Self {
        Self { registry }
    }
}

fn claims_from_metadata(metadata: &tonic::metadata::MetadataMap) -> Result<Claims, tonic::Status> {
    let Some(value) = metadata.get_bin(CLAIMS_METADATA_KEY) else {
        return Err(tonic::Status::unauthenticated("request carries no claims"));
    };
    let bytes = value
        .to_bytes()
        .map_err(|err| tonic::Status::unauthenticated(format!("decoding claims: {err}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| tonic::Status::unauthenticated(format!("parsing claims: {err}")))
}

/// A response stream which refuses the open with `status` and then ends.
/// Refusals are part of the protocol, not RPC aborts.
fn refusal(status: Status, error: impl Into<String>) -> tonic::Response<TunnelStream> {
    let (tx, rx) = mpsc::channel(1);
    tx.try_send(Ok(TunnelResponse {
        opened: Some(Opened {
            status: status as i32,
            error: error.into(),
        }),
        data: Vec::new(),
    }))
    .expect("channel has capacity");
    tonic::Response::new(ReceiverStream::new(rx))
}

type TunnelStream = ReceiverStream<Result<TunnelResponse, tonic::Status>>;

#[tonic::async_trait]
impl Tunnel for TunnelBackend {
    type ProxyStream = TunnelStream;

    async fn proxy(
        &self,
        request: tonic::Request<tonic::Streaming<TunnelRequest>>,
    ) -> Result<tonic::Response<Self::ProxyStream>, tonic::Status> {
        let claims = claims_from_metadata(request.metadata())?;
        let mut requests = request.into_inner();

        let Some(first) = requests.message().await? else {
            return Err(tonic::Status::cancelled("did not receive an open message"));
        };
        if !first.data.is_empty() {
            return Err(tonic::Status::invalid_argument(
                "data must not be sent along with the open message",
            ));
        }
        let Some(open) = first.open else {
            return Err(tonic::Status::invalid_argument(
                "expected the first message to be an open",
            ));
        };
        if open.shard_id.is_empty() {
            return Err(tonic::Status::invalid_argument("open has no shard ID"));
        }
        if open.target_port == 0 || open.target_port > u16::MAX as u32 {
            return Err(tonic::Status::invalid_argument(format!(
                "target port {} is out of range",
                open.target_port
            )));
        }
        if open.client_addr.is_empty() {
            return Err(tonic::Status::invalid_argument("open has no client address"));
        }
        let target_port = open.target_port as u16;

        debug!(
            shard = %open.shard_id,
            port = target_port,
            client = %open.client_addr,
            "processing tunnel open"
        );

        // Resolve the shard under the caller's claims. Proxying to a remote
        // replica is refused: the tunnel terminates at the primary.
        let resolution = self
            .registry
            .resolve(ResolveRequest {
                claims,
                shard_id: open.shard_id.clone(),
                may_proxy: false,
            })
            .await
            .map_err(|err| tonic::Status::failed_precondition(err.to_string()))?;

        match resolution.status {
            ResolveStatus::Ok => {}
            ResolveStatus::ShardNotFound => {
                return Ok(refusal(Status::ShardNotFound, "shard is not known here"));
            }
            ResolveStatus::NoShardPrimary => {
                return Ok(refusal(Status::NoShardPrimary, "shard has no elected primary"));
            }
            ResolveStatus::NotShardPrimary => {
                return Ok(refusal(
                    Status::NotShardPrimary,
                    "this process is not the shard primary",
                ));
            }
            ResolveStatus::ShardStopped => {
                return Ok(refusal(Status::ShardStopped, "shard is stopped"));
            }
        }
        let store = resolution
            .store
            .ok_or_else(|| tonic::Status::internal("resolution returned no store"))?;

        let (container, publisher) = store.proxy_hook();
        let Some(container) = container else {
            return Ok(refusal(
                Status::ShardStopped,
                "the task's container is not currently running",
            ));
        };

        if target_port == CONNECTOR_INIT_PORT {
            return Ok(refusal(
                Status::PortNotAllowed,
                "the connector init port cannot be proxied",
            ));
        }
        let address = container
            .mapped_host_ports
            .get(&target_port)
            .cloned()
            .or_else(|| {
                container
                    .network_ports
                    .contains(&target_port)
                    .then(|| format!("{}:{target_port}", container.ip_addr))
            });
        let Some(address) = address else {
            return Ok(refusal(
                Status::PortNotAllowed,
                format!("port {target_port} is not exposed by the container"),
            ));
        };

        let delegate = TcpStream::connect(&address).await.map_err(|err| {
            tonic::Status::unavailable(format!("dialing container at {address}: {err}"))
        })?;
        let (mut delegate_r, mut delegate_w) = delegate.into_split();

        let (tx, rx) = mpsc::channel::<Result<TunnelResponse, tonic::Status>>(8);
        tx.try_send(Ok(TunnelResponse {
            opened: Some(Opened {
                status: Status::Ok as i32,
                error: String::new(),
            }),
            data: Vec::new(),
        }))
        .expect("channel has capacity");

        // Shared between the two pump directions.
        let inbound = Arc::new(AtomicU64::new(0));
        let outbound = Arc::new(AtomicU64::new(0));

        // Forward: client → delegate. A delegate write error is not an RPC
        // error; the delegate may legitimately reset, and the user side then
        // sees the propagated RST when the backward pump ends.
        let forward = tokio::spawn({
            let inbound = Arc::clone(&inbound);
            async move {
                loop {
                    match requests.message().await {
                        Ok(Some(frame)) => {
                            inbound.fetch_add(frame.data.len() as u64, Ordering::Relaxed);
                            if delegate_w.write_all(&frame.data).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            // Client half-closed: let the delegate observe EOF.
                            let _ = delegate_w.shutdown().await;
                            break;
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        // Backward: delegate → client, ending the RPC on delegate EOF.
        let backward = tokio::spawn({
            let outbound = Arc::clone(&outbound);
            async move {
                let mut buf = vec![0u8; DELEGATE_READ_BUFFER];
                loop {
                    match delegate_r.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            outbound.fetch_add(n as u64, Ordering::Relaxed);
                            let frame = TunnelResponse {
                                opened: None,
                                data: buf[..n].to_vec(),
                            };
                            if tx.send(Ok(frame)).await.is_err() {
                                // Client already closed; end silently.
                                break;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(tonic::Status::internal(format!(
                                "reading from container: {err}"
                            ))))
                            .await;
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            if let Err(err) = forward.await {
                warn!(error = %err, "tunnel forward pump panicked");
            }
            if let Err(err) = backward.await {
                warn!(error = %err, "tunnel backward pump panicked");
            }
            let (inbound, outbound) = (
                inbound.load(Ordering::Relaxed),
                outbound.load(Ordering::Relaxed),
            );
            debug!(
                shard = %open.shard_id,
                port = target_port,
                client = %open.client_addr,
                client_to_container = inbound,
                container_to_client = outbound,
                "tunnel session ended"
            );
            (*publisher)(&LogEvent {
                level: "debug".to_string(),
                message: "proxy connection closed".to_string(),
                fields: BTreeMap::from([
                    (
                        "clientAddr".to_string(),
                        serde_json::Value::from(open.client_addr.clone()),
                    ),
                    ("targetPort".to_string(), serde_json::Value::from(target_port)),
                    ("bytesIn".to_string(), serde_json::Value::from(inbound)),
                    ("bytesOut".to_string(), serde_json::Value::from(outbound)),
                ]),
            });
        });

        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }
}
