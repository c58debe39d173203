//! Resolution of parsed SNIs against the shard registry, with caching.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::{ParsedSni, ResolvedSni};
use crate::error::{ProxyError, Result};
use crate::registry::{labels, LabelSelector, ShardRegistry};

/// Bound on cached resolutions. Entries are never invalidated: the shard-ID
/// prefix normalization makes a stale entry re-resolve to the same prefix
/// even across a task's deletion and recreation.
pub const SNI_CACHE_SIZE: usize = 1024;

/// Routing of a client-advertised server name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniDirective {
    /// Not addressed to a task: hand the connection to the fallback listener.
    Pass,
    /// Addressed to a task port.
    Task(ParsedSni),
}

pub struct SniResolver {
    registry: Arc<dyn ShardRegistry>,
    cache: Mutex<LruCache<ParsedSni, ResolvedSni>>,
    fqdn: String,
    allowed_domains: Vec<String>,
}

impl SniResolver {
    pub fn new(
        registry: Arc<dyn ShardRegistry>,
        fqdn: impl Into<String>,
        allowed_domains: Vec<String>,
    ) -> Self {
        Self {
            registry,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SNI_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            fqdn: fqdn.into(),
            allowed_domains,
        }
    }

    /// Classify a server name as pass-through or a task address.
    ///
    /// Names matching the frontend FQDN or any parent domain of it (and
    /// `localhost`) belong to the fallback listener. Anything else must be
    /// `<target>.<service>` with an allowed service domain.
    pub fn classify(&self, server_name: Option<&str>) -> Result<SniDirective> {
        let Some(name) = server_name else {
            return Ok(SniDirective::Pass);
        };
        if name == self.fqdn
            || name == "localhost"
            || self.fqdn.ends_with(&format!(".{name}"))
        {
            return Ok(SniDirective::Pass);
        }

        let Some((target, service)) = name.split_once('.') else {
            return Err(ProxyError::InvalidSni {
                sni: name.to_string(),
                reason: "expected <target>.<service-domain>".to_string(),
            });
        };
        if !self.allowed_domains.iter().any(|d| d == service) {
            return Err(ProxyError::InvalidSni {
                sni: name.to_string(),
                reason: format!("{service:?} is not a served domain"),
            });
        }
        Ok(SniDirective::Task(ParsedSni::parse(target)?))
    }

    /// Resolve a parsed SNI through the cache or the shard registry.
    /// Only successful resolutions are cached.
    pub async fn resolve(&self, parsed: &ParsedSni) -> Result<ResolvedSni> {
        if let Some(hit) = self.cache.lock().get(parsed) {
            return Ok(hit.clone());
        }

        let mut selector = LabelSelector::default()
            .include(labels::EXPOSE_PORT, parsed.port.to_string())
            .include(labels::HOSTNAME, &parsed.hostname);
        if let Some(key) = &parsed.key_begin {
            selector = selector.include(labels::KEY_BEGIN, key);
        }
        if let Some(rclock) = &parsed.r_clock_begin {
            selector = selector.include(labels::RCLOCK_BEGIN, rclock);
        }

        let shards = self.registry.list(&selector).await?;
        let Some(first) = shards.first() else {
            return Err(ProxyError::NoMatchingTask {
                sni: parsed.to_string(),
                reason: "no task shard exposes this hostname and port".to_string(),
            });
        };

        let resolved = ResolvedSni::from_shard(&first.spec.id, &first.spec.labels, parsed.port)?;
        debug!(
            sni = %parsed,
            prefix = %resolved.shard_id_prefix,
            task = %resolved.task_name,
            protocol = ?resolved.port_protocol,
            "resolved SNI"
        );
        self.cache.lock().put(parsed.clone(), resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fixed::{FixedPort, FixedRegistry, FixedTask};
    use crate::registry::{Resolution, ResolveRequest, ShardListing};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        inner: FixedRegistry,
        lists: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ShardRegistry for Counting {
        async fn list(&self, selector: &LabelSelector) -> anyhow::Result<Vec<ShardListing>> {
            self.lists.fetch_add(1, Ordering::Relaxed);
            self.inner.list(selector).await
        }
        async fn resolve(&self, req: ResolveRequest) -> anyhow::Result<Resolution> {
            self.inner.resolve(req).await
        }
    }

    fn resolver() -> (Arc<Counting>, SniResolver) {
        let registry = Arc::new(Counting {
            inner: FixedRegistry::new([FixedTask {
                name: "AcmeCo/My/Capture/source-http-ingest".into(),
                hostname: "abc".into(),
                endpoint: "http://127.0.0.1:9100".into(),
                container_ip: "172.17.0.2".into(),
                mapped_host_ports: Default::default(),
                ports: vec![FixedPort {
                    number: 8080,
                    protocol: Some("h2c".into()),
                    public: true,
                }],
            }]),
            lists: AtomicUsize::new(0),
        });
        let resolver = SniResolver::new(
            registry.clone(),
            "gw.acme.example",
            vec!["gw.acme.example".to_string()],
        );
        (registry, resolver)
    }

    #[test]
    fn classifies_pass_through_names() {
        let (_registry, resolver) = resolver();
        for name in [None, Some("gw.acme.example"), Some("acme.example"), Some("example"), Some("localhost")] {
            assert_eq!(resolver.classify(name).unwrap(), SniDirective::Pass, "{name:?}");
        }
    }

    #[test]
    fn classifies_task_names() {
        let (_registry, resolver) = resolver();
        match resolver.classify(Some("abc-8080.gw.acme.example")).unwrap() {
            SniDirective::Task(parsed) => {
                assert_eq!(parsed.hostname, "abc");
                assert_eq!(parsed.port, 8080);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_foreign_domains_and_bad_targets() {
        let (_registry, resolver) = resolver();
        assert!(resolver.classify(Some("abc-8080.evil.example")).is_err());
        assert!(resolver.classify(Some("noport.gw.acme.example")).is_err());
        assert!(resolver.classify(Some("bare-name")).is_err());
    }

    #[tokio::test]
    async fn resolves_and_caches_successes() {
        let (registry, resolver) = resolver();
        let parsed = ParsedSni::parse("abc-8080").unwrap();

        let first = resolver.resolve(&parsed).await.unwrap();
        assert_eq!(first.port_protocol.as_deref(), Some("h2"));
        assert_eq!(
            first.shard_id_prefix,
            "capture/AcmeCo/My/Capture/source-http-ingest/"
        );
        assert_eq!(registry.lists.load(Ordering::Relaxed), 1);

        let second = resolver.resolve(&parsed).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(registry.lists.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn does_not_cache_failures() {
        let (registry, resolver) = resolver();
        let parsed = ParsedSni::parse("missing-1234").unwrap();

        assert!(resolver.resolve(&parsed).await.is_err());
        assert!(resolver.resolve(&parsed).await.is_err());
        assert_eq!(registry.lists.load(Ordering::Relaxed), 2);
    }
}
