//! Configuration loading, validation, and hot reload.
//!
//! # What can be reloaded without restart
//!
//! | Section   | Field           | Effect                                  |
//! |-----------|-----------------|-----------------------------------------|
//! | `log`     | `level`         | Filter updated via the level receiver   |
//! | `gateway` | `dashboard_url` | Used by the next unauthorized request   |
//!
//! Fields that require re-binding sockets or re-reading certificates
//! (`server.*`, `frontend.*`, `gateway.tokens`, `tasks`) are **not**
//! applied; a warning is emitted.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;

use crate::error::{ProxyError, Result};
use crate::registry::fixed::FixedTask;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerSection,
    pub frontend: FrontendSection,
    pub gateway: GatewaySection,
    #[serde(default)]
    pub log: LogSection,
    /// Tasks served by the built-in fixed registry. Deployments with a real
    /// consumer framework leave this empty and wire their own registry.
    #[serde(default)]
    pub tasks: Vec<FixedTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// External TLS listener.
    pub listen: SocketAddr,
    /// Internal tunnel RPC listener.
    pub tunnel_listen: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendSection {
    /// This frontend's own name. SNIs equal to it, or to a parent domain of
    /// it, pass through to the fallback listener.
    pub fqdn: String,
    /// Service domains under which task SNIs are served. Defaults to the
    /// FQDN itself.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Dashboard base URL for the browser authorization flow.
    pub dashboard_url: Url,
    /// Bearer tokens accepted by the built-in static verifier.
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| ProxyError::Config(format!("reading {}: {err}", path.display())))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|err| ProxyError::Config(format!("parsing {}: {err}", path.display())))?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.frontend.allowed_domains.is_empty() {
            self.frontend.allowed_domains = vec![self.frontend.fqdn.clone()];
        }
        // Keep the dashboard URL join-friendly.
        let path = self.gateway.dashboard_url.path();
        if !path.ends_with('/') {
            let path = format!("{path}/");
            self.gateway.dashboard_url.set_path(&path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.frontend.fqdn.is_empty() {
            return Err(ProxyError::Config("frontend.fqdn must be set".into()));
        }
        match (&self.frontend.cert_file, &self.frontend.key_file) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(ProxyError::Config(
                    "frontend.cert_file and frontend.key_file must be set together".into(),
                ));
            }
        }
        for task in &self.tasks {
            if task.name.is_empty() || task.hostname.is_empty() {
                return Err(ProxyError::Config(
                    "every task needs a name and a hostname".into(),
                ));
            }
            if task.ports.is_empty() {
                return Err(ProxyError::Config(format!(
                    "task {:?} exposes no ports",
                    task.name
                )));
            }
        }
        Ok(())
    }
}

/// Fields that are safe to swap without restarting listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct HotFields {
    pub log_level: String,
    pub dashboard_url: Url,
}

impl HotFields {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            log_level: cfg.log.level.clone(),
            dashboard_url: cfg.gateway.dashboard_url.clone(),
        }
    }
}

/// Warn if any non-hot fields changed (i.e. require restart).
fn warn_non_hot_changes(old: &Config, new: &Config) {
    if old.server.listen != new.server.listen
        || old.server.tunnel_listen != new.server.tunnel_listen
    {
        warn!("config reload: server listeners changed; restart required");
    }
    if old.frontend.fqdn != new.frontend.fqdn
        || old.frontend.allowed_domains != new.frontend.allowed_domains
        || old.frontend.cert_file != new.frontend.cert_file
        || old.frontend.key_file != new.frontend.key_file
    {
        warn!("config reload: frontend section changed; restart required");
    }
    if old.gateway.tokens != new.gateway.tokens {
        warn!("config reload: gateway.tokens changed; restart required");
    }
}

/// Spawn the hot-reload watcher task.
///
/// Returns:
/// - `watch::Receiver<Arc<Config>>` — consumers read a fresh snapshot when
///   they need a hot field.
/// - `watch::Receiver<String>` — the caller should watch this and apply
///   changes to the `tracing` reload handle.
pub fn spawn_config_watcher(
    config_path: PathBuf,
    initial: Arc<Config>,
    reload_interval: Duration,
) -> (watch::Receiver<Arc<Config>>, watch::Receiver<String>) {
    let initial_level = initial.log.level.clone();
    let (config_tx, config_rx) = watch::channel(initial);
    let (log_tx, log_rx) = watch::channel(initial_level);

    tokio::spawn(async move {
        // On Unix, also listen for SIGHUP.
        #[cfg(unix)]
        let mut sighup = {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::hangup()) {
                Ok(sighup) => sighup,
                Err(err) => {
                    error!(error = %err, "failed to register SIGHUP handler");
                    return;
                }
            }
        };

        let mut interval = tokio::time::interval(reload_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // The immediate first tick.

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = interval.tick() => {}
                _ = sighup.recv() => {
                    info!("SIGHUP received; reloading config from {:?}", config_path);
                }
            }
            #[cfg(not(unix))]
            interval.tick().await;

            let new_cfg = match Config::load(&config_path) {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!("config reload: failed to parse {:?}: {err}", config_path);
                    continue;
                }
            };
            if let Err(err) = new_cfg.validate() {
                error!("config reload: validation failed: {err}; keeping old config");
                continue;
            }

            let old_cfg = config_tx.borrow().clone();
            let old_hot = HotFields::from_config(&old_cfg);
            let new_hot = HotFields::from_config(&new_cfg);

            if old_hot == new_hot {
                continue;
            }

            warn_non_hot_changes(&old_cfg, &new_cfg);

            if old_hot.log_level != new_hot.log_level {
                info!(
                    "config reload: log level: {:?} -> {:?}",
                    old_hot.log_level, new_hot.log_level
                );
                log_tx.send(new_hot.log_level.clone()).ok();
            }
            if old_hot.dashboard_url != new_hot.dashboard_url {
                info!(
                    "config reload: dashboard_url: {} -> {}",
                    old_hot.dashboard_url, new_hot.dashboard_url
                );
            }

            config_tx.send(Arc::new(new_cfg)).ok();
        }
    });

    (config_rx, log_rx)
}
