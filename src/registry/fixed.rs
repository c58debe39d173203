//! Config-declared shard registry.
//!
//! Standalone deployments (and tests) describe their tasks directly in the
//! config file instead of running a full consumer framework. Each declared
//! task becomes a single always-primary shard.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use super::{
    labels, tracing_publisher, Capability, ContainerSpec, LabelSelector, LabelSet, LogPublisher,
    Resolution, ResolveRequest, ResolveStatus, Route, ShardListing, ShardRegistry, ShardSpec,
    TaskStore,
};

/// One exposed port of a declared task.
#[derive(Debug, Clone, Deserialize)]
pub struct FixedPort {
    pub number: u16,
    /// Declared application protocol, e.g. `h2c`. Absent means the default
    /// HTTP reverse-proxy treatment.
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub public: bool,
}

/// One task declared in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FixedTask {
    /// Catalog task name, e.g. `AcmeCo/My/Capture/source-http-ingest`.
    pub name: String,
    /// SNI hostname label addressing this task.
    pub hostname: String,
    /// gRPC endpoint of the tunnel backend hosting the task's container.
    pub endpoint: String,
    /// Address of the running container, as seen from the tunnel backend.
    #[serde(default)]
    pub container_ip: String,
    /// Container port → host-mapped `host:port` overrides.
    #[serde(default)]
    pub mapped_host_ports: HashMap<u16, String>,
    pub ports: Vec<FixedPort>,
}

struct FixedShard {
    listing: ShardListing,
    store: Arc<FixedStore>,
}

/// In-process [`ShardRegistry`] over a static task list.
pub struct FixedRegistry {
    shards: Vec<FixedShard>,
}

impl FixedRegistry {
    pub fn new(tasks: impl IntoIterator<Item = FixedTask>) -> Self {
        let shards = tasks
            .into_iter()
            .map(|task| {
                let id = format!("capture/{}/0000000000000000/00000000-00000000", task.name);

                let mut set = LabelSet::default();
                set.add(labels::TASK_NAME, &task.name)
                    .add(labels::HOSTNAME, &task.hostname)
                    .add(labels::KEY_BEGIN, "00000000")
                    .add(labels::RCLOCK_BEGIN, "00000000");
                for port in &task.ports {
                    set.add(labels::EXPOSE_PORT, port.number.to_string());
                    if let Some(proto) = &port.protocol {
                        set.add(
                            format!("{}{}", labels::PORT_PROTO_PREFIX, port.number),
                            proto,
                        );
                    }
                    if port.public {
                        set.add(
                            format!("{}{}", labels::PORT_PUBLIC_PREFIX, port.number),
                            "true",
                        );
                    }
                }

                let store = Arc::new(FixedStore {
                    container: ContainerSpec {
                        ip_addr: task.container_ip.clone(),
                        network_ports: task.ports.iter().map(|p| p.number).collect(),
                        mapped_host_ports: task.mapped_host_ports.clone(),
                    },
                });

                FixedShard {
                    listing: ShardListing {
                        spec: ShardSpec { id, labels: set },
                        route: Route {
                            members: vec!["fixed/member".to_string()],
                            primary: Some(0),
                            endpoints: vec![task.endpoint.clone()],
                        },
                    },
                    store,
                }
            })
            .collect();
        Self { shards }
    }
}

#[async_trait::async_trait]
impl ShardRegistry for FixedRegistry {
    async fn list(&self, selector: &LabelSelector) -> anyhow::Result<Vec<ShardListing>> {
        Ok(self
            .shards
            .iter()
            .filter(|s| selector.matches(&s.listing.spec.id, &s.listing.spec.labels))
            .map(|s| s.listing.clone())
            .collect())
    }

    async fn resolve(&self, req: ResolveRequest) -> anyhow::Result<Resolution> {
        if req.claims.capability != Capability::NetworkProxy {
            anyhow::bail!("claims lack the network-proxy capability");
        }
        let Some(shard) = self.shards.iter().find(|s| s.listing.spec.id == req.shard_id) else {
            return Ok(Resolution {
                status: ResolveStatus::ShardNotFound,
                store: None,
            });
        };
        if !req
            .claims
            .selector
            .matches(&shard.listing.spec.id, &shard.listing.spec.labels)
        {
            anyhow::bail!("claims selector does not cover shard {}", req.shard_id);
        }
        Ok(Resolution {
            status: ResolveStatus::Ok,
            store: Some(shard.store.clone() as Arc<dyn TaskStore>),
        })
    }
}

struct FixedStore {
    container: ContainerSpec,
}

impl TaskStore for FixedStore {
    fn proxy_hook(&self) -> (Option<ContainerSpec>, LogPublisher) {
        let container = if self.container.ip_addr.is_empty()
            && self.container.mapped_host_ports.is_empty()
        {
            None
        } else {
            Some(self.container.clone())
        };
        (container, tracing_publisher())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Claims;

    fn task() -> FixedTask {
        FixedTask {
            name: "AcmeCo/My/Capture/source-http-ingest".into(),
            hostname: "abc".into(),
            endpoint: "http://127.0.0.1:9100".into(),
            container_ip: "172.17.0.2".into(),
            mapped_host_ports: HashMap::new(),
            ports: vec![
                FixedPort {
                    number: 8080,
                    protocol: Some("h2c".into()),
                    public: true,
                },
                FixedPort {
                    number: 9000,
                    protocol: None,
                    public: false,
                },
            ],
        }
    }

    #[tokio::test]
    async fn lists_by_hostname_and_port() {
        let reg = FixedRegistry::new([task()]);

        let hit = reg
            .list(
                &LabelSelector::default()
                    .include(labels::HOSTNAME, "abc")
                    .include(labels::EXPOSE_PORT, "8080"),
            )
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);
        assert!(hit[0].spec.id.starts_with("capture/AcmeCo/My/Capture/"));
        assert_eq!(hit[0].route.primary_endpoint(), Some("http://127.0.0.1:9100"));

        let miss = reg
            .list(
                &LabelSelector::default()
                    .include(labels::HOSTNAME, "abc")
                    .include(labels::EXPOSE_PORT, "7070"),
            )
            .await
            .unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn resolve_enforces_claims_selector() {
        let reg = FixedRegistry::new([task()]);
        let id = reg
            .list(&LabelSelector::default())
            .await
            .unwrap()
            .remove(0)
            .spec
            .id;

        let ok = reg
            .resolve(ResolveRequest {
                claims: Claims::network_proxy(
                    LabelSelector::default().with_id_prefix("capture/AcmeCo/"),
                ),
                shard_id: id.clone(),
                may_proxy: false,
            })
            .await
            .unwrap();
        assert_eq!(ok.status, ResolveStatus::Ok);
        assert!(ok.store.is_some());

        let denied = reg
            .resolve(ResolveRequest {
                claims: Claims::network_proxy(
                    LabelSelector::default().with_id_prefix("capture/OtherCo/"),
                ),
                shard_id: id,
                may_proxy: false,
            })
            .await;
        assert!(denied.is_err());
    }
}
