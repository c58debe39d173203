//! SNI addressing of task shards.
//!
//! A user reaches a task port at `<target>.<service-domain>`, where `target`
//! packs the task's hostname label, optionally a key/r-clock split, and the
//! port into a single DNS label.

pub mod resolver;

pub use resolver::{SniDirective, SniResolver};

use crate::error::{ProxyError, Result};
use crate::registry::{labels, LabelSet};

/// The structured fields of a target SNI label.
///
/// Grammar: `<hostname>-<port>` or `<hostname>-<keyBegin>-<rClockBegin>-<port>`,
/// all components non-empty, `port` a decimal u16.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedSni {
    pub hostname: String,
    pub port: u16,
    pub key_begin: Option<String>,
    pub r_clock_begin: Option<String>,
}

impl ParsedSni {
    pub fn parse(target: &str) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::InvalidSni {
            sni: target.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = target.split('-').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty component"));
        }
        let (hostname, key_begin, r_clock_begin, port) = match parts.as_slice() {
            [hostname, port] => (*hostname, None, None, *port),
            [hostname, key, rclock, port] => {
                (*hostname, Some(key.to_string()), Some(rclock.to_string()), *port)
            }
            _ => {
                return Err(invalid("expected 2 or 4 dash-separated components"));
            }
        };

        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("port is not a decimal integer"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| invalid("port is out of range"))?;

        Ok(Self {
            hostname: hostname.to_string(),
            port,
            key_begin,
            r_clock_begin,
        })
    }
}

impl std::fmt::Display for ParsedSni {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.key_begin, &self.r_clock_begin) {
            (Some(key), Some(rclock)) => {
                write!(f, "{}-{key}-{rclock}-{}", self.hostname, self.port)
            }
            _ => write!(f, "{}-{}", self.hostname, self.port),
        }
    }
}

/// What a parsed SNI resolved to, derived from the first matching shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSni {
    /// Stable prefix of the shard ID, with its publication-id and shard
    /// suffix segments stripped. Stable across task deletion/recreation,
    /// which is what makes the resolution cacheable without invalidation.
    pub shard_id_prefix: String,
    /// `Some(protocol)` means the frontend terminates TLS and TCP-proxies
    /// raw bytes; `None` means the authorizing HTTP/2 reverse proxy, with
    /// the default `http/1.1` transport to the connector.
    pub port_protocol: Option<String>,
    pub port_is_public: bool,
    pub task_name: String,
}

impl ResolvedSni {
    /// Derive the resolution from a shard's spec for the given port.
    pub fn from_shard(id: &str, set: &LabelSet, port: u16) -> Result<Self> {
        let task_name = set
            .value_of(labels::TASK_NAME)
            .ok_or_else(|| ProxyError::NoMatchingTask {
                sni: format!("port {port}"),
                reason: format!("shard {id} has no task-name label"),
            })?
            .to_string();

        let port_is_public = set
            .value_of(&format!("{}{port}", labels::PORT_PUBLIC_PREFIX))
            == Some("true");
        let declared = set.value_of(&format!("{}{port}", labels::PORT_PROTO_PREFIX));

        // Private ports and undeclared protocols get the authorizing reverse
        // proxy. A public `h2c` port is TCP-proxied as `h2`: the connector
        // speaks cleartext HTTP/2 and the frontend terminates TLS.
        let port_protocol = match declared {
            Some(proto) if port_is_public => Some(if proto == "h2c" {
                "h2".to_string()
            } else {
                proto.to_string()
            }),
            _ => None,
        };

        Ok(Self {
            shard_id_prefix: shard_id_prefix(id),
            port_protocol,
            port_is_public,
            task_name,
        })
    }
}

/// Strip the trailing shard-suffix segment and then the publication-id
/// segment from a shard ID, retaining the trailing `/`.
pub fn shard_id_prefix(id: &str) -> String {
    let head = id.rsplit_once('/').map_or(id, |(head, _)| head);
    let head = head.rsplit_once('/').map_or(head, |(head, _)| head);
    format!("{head}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_two_components() {
        let parsed = ParsedSni::parse("h-443").unwrap();
        assert_eq!(parsed.hostname, "h");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.key_begin, None);
        assert_eq!(parsed.r_clock_begin, None);
    }

    #[test]
    fn parse_four_components() {
        let parsed = ParsedSni::parse("h-00000000-80000000-8080").unwrap();
        assert_eq!(parsed.hostname, "h");
        assert_eq!(parsed.key_begin.as_deref(), Some("00000000"));
        assert_eq!(parsed.r_clock_begin.as_deref(), Some("80000000"));
        assert_eq!(parsed.port, 8080);
    }

    #[test]
    fn parse_rejects_wrong_component_counts() {
        for target in ["h", "h-1-2", "h-1-2-3-4-5"] {
            assert!(ParsedSni::parse(target).is_err(), "accepted {target:?}");
        }
    }

    #[test]
    fn parse_rejects_bad_ports() {
        for target in ["h-port", "h-65536", "h-1e3", "h-+80", "h--80"] {
            assert!(ParsedSni::parse(target).is_err(), "accepted {target:?}");
        }
        assert_eq!(ParsedSni::parse("h-65535").unwrap().port, 65535);
    }

    #[test]
    fn parse_rejects_empty_components() {
        for target in ["-80", "h-", "h--2-80", "h-1--80"] {
            assert!(ParsedSni::parse(target).is_err(), "accepted {target:?}");
        }
    }

    #[test]
    fn display_round_trips() {
        for target in ["h-443", "h-00000000-80000000-8080"] {
            assert_eq!(ParsedSni::parse(target).unwrap().to_string(), target);
        }
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(
            shard_id_prefix(
                "capture/AcmeCo/My/Capture/source-http-ingest/0f05593ad1800023/00000000-00000000"
            ),
            "capture/AcmeCo/My/Capture/source-http-ingest/"
        );
    }

    fn shard_labels(port: u16, proto: Option<&str>, public: bool) -> LabelSet {
        let mut set = LabelSet::default();
        set.add(labels::TASK_NAME, "AcmeCo/My/Capture/source-http-ingest");
        set.add(labels::EXPOSE_PORT, port.to_string());
        if let Some(proto) = proto {
            set.add(format!("{}{port}", labels::PORT_PROTO_PREFIX), proto);
        }
        if public {
            set.add(format!("{}{port}", labels::PORT_PUBLIC_PREFIX), "true");
        }
        set
    }

    const SHARD_ID: &str =
        "capture/AcmeCo/My/Capture/source-http-ingest/0f05593ad1800023/00000000-00000000";

    #[test]
    fn private_port_is_reverse_proxied() {
        let resolved =
            ResolvedSni::from_shard(SHARD_ID, &shard_labels(9000, Some("h2c"), false), 9000)
                .unwrap();
        assert_eq!(resolved.port_protocol, None);
        assert!(!resolved.port_is_public);
    }

    #[test]
    fn public_h2c_normalizes_to_h2() {
        let resolved =
            ResolvedSni::from_shard(SHARD_ID, &shard_labels(8080, Some("h2c"), true), 8080)
                .unwrap();
        assert_eq!(resolved.port_protocol.as_deref(), Some("h2"));
        assert!(resolved.port_is_public);
        assert_eq!(
            resolved.shard_id_prefix,
            "capture/AcmeCo/My/Capture/source-http-ingest/"
        );
    }

    #[test]
    fn public_undeclared_protocol_is_reverse_proxied() {
        let resolved =
            ResolvedSni::from_shard(SHARD_ID, &shard_labels(8080, None, true), 8080).unwrap();
        assert_eq!(resolved.port_protocol, None);
        assert!(resolved.port_is_public);
    }

    #[test]
    fn public_declared_protocol_is_kept() {
        let resolved =
            ResolvedSni::from_shard(SHARD_ID, &shard_labels(5432, Some("postgres"), true), 5432)
                .unwrap();
        assert_eq!(resolved.port_protocol.as_deref(), Some("postgres"));
    }
}
