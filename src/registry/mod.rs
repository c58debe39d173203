//! Contracts against the surrounding platform.
//!
//! The consumer framework owning shard placement, the store hosting a task's
//! running container, and the control-plane token verifier are external
//! collaborators. This module pins down the shapes the proxy core consumes;
//! deployments provide the real implementations, and [`fixed`] provides a
//! config-declared one for standalone use and tests.

pub mod fixed;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Well-known shard label names.
pub mod labels {
    pub const EXPOSE_PORT: &str = "streamgate.dev/expose-port";
    pub const HOSTNAME: &str = "streamgate.dev/hostname";
    pub const KEY_BEGIN: &str = "streamgate.dev/key-begin";
    pub const RCLOCK_BEGIN: &str = "streamgate.dev/rclock-begin";
    pub const TASK_NAME: &str = "streamgate.dev/task-name";
    /// Per-port protocol, e.g. `streamgate.dev/port-proto/8080 = h2c`.
    pub const PORT_PROTO_PREFIX: &str = "streamgate.dev/port-proto/";
    /// Per-port visibility, e.g. `streamgate.dev/port-public/8080 = true`.
    pub const PORT_PUBLIC_PREFIX: &str = "streamgate.dev/port-public/";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered set of labels attached to a shard spec. A name may carry
/// several values (a shard exposing three ports has three `expose-port`
/// labels).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<Label>,
}

impl LabelSet {
    /// Add a `(name, value)` pair, keeping the set ordered and deduplicated.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let label = Label::new(name, value);
        if let Err(at) = self.labels.binary_search_by(|l| {
            (l.name.as_str(), l.value.as_str()).cmp(&(label.name.as_str(), label.value.as_str()))
        }) {
            self.labels.insert(at, label);
        }
        self
    }

    /// The first value of `name`, if any.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        let start = self.labels.partition_point(|l| l.name.as_str() < name);
        self.labels
            .get(start)
            .filter(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn values_of<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s str> + 's {
        let start = self.labels.partition_point(|l| l.name.as_str() < name);
        self.labels[start..]
            .iter()
            .take_while(move |l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn contains(&self, name: &str, value: &str) -> bool {
        let start = self.labels.partition_point(|l| l.name.as_str() < name);
        self.labels[start..]
            .iter()
            .take_while(|l| l.name == name)
            .any(|l| l.value == value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut set = LabelSet::default();
        for (name, value) in iter {
            set.add(name, value);
        }
        set
    }
}

/// Include-predicates over shard labels, with an optional shard-ID prefix.
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub include: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_prefix: Option<String>,
}

impl LabelSelector {
    pub fn include(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.include.push(Label::new(name, value));
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, id: &str, set: &LabelSet) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.include
            .iter()
            .all(|want| set.contains(&want.name, &want.value))
    }
}

/// Scope of an authorization claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "NETWORK_PROXY")]
    NetworkProxy,
}

/// Verified authorization claims: a capability restricted by a label selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub capability: Capability,
    pub selector: LabelSelector,
}

impl Claims {
    pub fn network_proxy(selector: LabelSelector) -> Self {
        Self {
            capability: Capability::NetworkProxy,
            selector,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardSpec {
    pub id: String,
    pub labels: LabelSet,
}

/// Current placement of a shard: member process addresses and the index of
/// the elected primary, if any.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub members: Vec<String>,
    pub primary: Option<usize>,
    pub endpoints: Vec<String>,
}

impl Route {
    pub fn primary_endpoint(&self) -> Option<&str> {
        self.primary
            .and_then(|at| self.endpoints.get(at))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct ShardListing {
    pub spec: ShardSpec,
    pub route: Route,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Ok,
    ShardNotFound,
    NoShardPrimary,
    NotShardPrimary,
    ShardStopped,
}

pub struct ResolveRequest {
    pub claims: Claims,
    pub shard_id: String,
    /// Whether resolution may land on a non-primary replica.
    pub may_proxy: bool,
}

pub struct Resolution {
    pub status: ResolveStatus,
    pub store: Option<Arc<dyn TaskStore>>,
}

/// Shard registry of the consumer framework.
#[async_trait::async_trait]
pub trait ShardRegistry: Send + Sync + 'static {
    /// List shards matching `selector`, in deterministic order.
    async fn list(&self, selector: &LabelSelector) -> anyhow::Result<Vec<ShardListing>>;

    /// Resolve a shard ID to its local store, authorizing against `claims`.
    async fn resolve(&self, req: ResolveRequest) -> anyhow::Result<Resolution>;
}

/// A shard's local store, as far as the proxy is concerned: a view of the
/// task's current container and a publisher for connection log events.
pub trait TaskStore: Send + Sync {
    fn proxy_hook(&self) -> (Option<ContainerSpec>, LogPublisher);
}

/// The running container of a task shard.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub ip_addr: String,
    pub network_ports: Vec<u16>,
    /// Container port → host-mapped `host:port` address, preferred over
    /// dialing the container IP directly.
    pub mapped_host_ports: HashMap<u16, String>,
}

/// Structured log event published to a task's logs journal.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

pub type LogPublisher = Arc<dyn Fn(&LogEvent) + Send + Sync>;

/// A publisher which forwards events into the process-local tracing
/// subscriber, for deployments without a log journal.
pub fn tracing_publisher() -> LogPublisher {
    Arc::new(|event: &LogEvent| match event.level.as_str() {
        "error" => tracing::error!(fields = ?event.fields, "{}", event.message),
        "warn" => tracing::warn!(fields = ?event.fields, "{}", event.message),
        "debug" => tracing::debug!(fields = ?event.fields, "{}", event.message),
        _ => tracing::info!(fields = ?event.fields, "{}", event.message),
    })
}

/// Verifier of bearer tokens presented to the reverse proxy.
#[async_trait::async_trait]
pub trait AuthVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str, capability: Capability) -> anyhow::Result<Claims>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_set_is_sorted_and_multi_valued() {
        let mut set = LabelSet::default();
        set.add("b", "2").add("a", "1").add("b", "3").add("b", "2");
        assert_eq!(set.value_of("a"), Some("1"));
        assert_eq!(set.value_of("b"), Some("2"));
        assert_eq!(set.values_of("b").collect::<Vec<_>>(), vec!["2", "3"]);
        assert_eq!(set.value_of("c"), None);
        assert!(set.contains("b", "3"));
        assert!(!set.contains("b", "4"));
        let names: Vec<&str> = set.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "b"]);
    }

    #[test]
    fn selector_matching() {
        let set: LabelSet = [("app", "capture"), ("port", "8080")].into_iter().collect();

        assert!(LabelSelector::default().matches("any/id", &set));
        assert!(LabelSelector::default()
            .include("app", "capture")
            .matches("any/id", &set));
        assert!(!LabelSelector::default()
            .include("app", "derive")
            .matches("any/id", &set));
        assert!(LabelSelector::default()
            .with_id_prefix("any/")
            .matches("any/id", &set));
        assert!(!LabelSelector::default()
            .with_id_prefix("other/")
            .matches("any/id", &set));
    }

    #[test]
    fn route_primary_endpoint() {
        let route = Route {
            members: vec!["m0".into(), "m1".into()],
            primary: Some(1),
            endpoints: vec!["http://a:9100".into(), "http://b:9100".into()],
        };
        assert_eq!(route.primary_endpoint(), Some("http://b:9100"));
        assert_eq!(Route::default().primary_endpoint(), None);
    }

    #[test]
    fn claims_round_trip_json() {
        let claims = Claims::network_proxy(
            LabelSelector::default()
                .include(labels::TASK_NAME, "acme/task")
                .with_id_prefix("capture/acme/task/"),
        );
        let json = serde_json::to_string(&claims).unwrap();
        let back: Claims = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capability, Capability::NetworkProxy);
        assert_eq!(back.selector, claims.selector);
    }
}
