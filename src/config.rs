use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream_api: UpstreamApi,
    #[serde(default)]
    pub balancer: Balancer,
    #[serde(default)]
    pub limiter: Limiter,
    #[serde(default)]
    pub sign: Sign,
    #[serde(default)]
    pub consul: Consul,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.sign.secret.trim().is_empty() {
            return Err(anyhow!("sign.secret is required"));
        }
        if self.upstream_api.base_url.trim().is_empty() {
            return Err(anyhow!("upstream_api.base_url is required"));
        }
        if self.balancer.server_max_fails > 10 {
            return Err(anyhow!("balancer.server_max_fails is capped at 10"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    /// Rotation threshold in MiB; 0 disables rotation.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_listen_addr")]
    pub addr: String,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_listen_addr(),
            trusted_proxies: Vec::new(),
        }
    }
}

/// Title-metadata API endpoint and HTTP client tuning.
#[derive(Debug, Deserialize)]
pub struct UpstreamApi {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default = "default_serie_ttl", with = "humantime_serde")]
    pub serie_ttl: Duration,
}

impl Default for UpstreamApi {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            idle_timeout: default_idle_timeout(),
            serie_ttl: default_serie_ttl(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Balancer {
    #[serde(default = "default_server_max_fails")]
    pub server_max_fails: u32,
    /// Serve everything from the client-supplied cache server.
    #[serde(default)]
    pub full_bypass: bool,
    /// This instance runs in the expensive zone; honor availability dials.
    #[serde(default)]
    pub highcost_zone: bool,
    #[serde(default = "default_softer_step")]
    pub softer_step: i64,
    #[serde(default = "default_softer_tick", with = "humantime_serde")]
    pub softer_tick: Duration,
}

impl Default for Balancer {
    fn default() -> Self {
        Self {
            server_max_fails: default_server_max_fails(),
            full_bypass: false,
            highcost_zone: false,
            softer_step: default_softer_step(),
            softer_tick: default_softer_tick(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Limiter {
    #[serde(default = "default_limiter_max")]
    pub max_requests: u64,
    #[serde(default = "default_limiter_window", with = "humantime_serde")]
    pub window: Duration,
    /// Empty means the in-memory store; otherwise a sled database path.
    #[serde(default)]
    pub db_path: String,
}

impl Default for Limiter {
    fn default() -> Self {
        Self {
            max_requests: default_limiter_max(),
            window: default_limiter_window(),
            db_path: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Sign {
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_link_expiration", with = "humantime_serde")]
    pub link_expiration: Duration,
}

impl Default for Sign {
    fn default() -> Self {
        Self {
            secret: String::new(),
            link_expiration: default_link_expiration(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Consul {
    /// Empty disables both watchers.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_service_nodes")]
    pub service_nodes: String,
    #[serde(default = "default_service_cloud")]
    pub service_cloud: String,
    #[serde(default)]
    pub entries_domain: String,
    #[serde(default)]
    pub kv_prefix: String,
    #[serde(default)]
    pub ignore_errors: bool,
    #[serde(default = "default_consul_wait", with = "humantime_serde")]
    pub wait: Duration,
}

impl Default for Consul {
    fn default() -> Self {
        Self {
            address: String::new(),
            service_nodes: default_service_nodes(),
            service_cloud: default_service_cloud(),
            entries_domain: String::new(),
            kv_prefix: String::new(),
            ignore_errors: false,
            wait: default_consul_wait(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_serie_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_server_max_fails() -> u32 {
    3
}

fn default_softer_step() -> i64 {
    99
}

fn default_softer_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_limiter_max() -> u64 {
    200
}

fn default_limiter_window() -> Duration {
    Duration::from_secs(300)
}

fn default_link_expiration() -> Duration {
    Duration::from_secs(10)
}

fn default_service_nodes() -> String {
    "cache-node-internal".to_string()
}

fn default_service_cloud() -> String {
    "cache-cloud-ingress".to_string()
}

fn default_consul_wait() -> Duration {
    Duration::from_secs(55)
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_contract() {
        let cfg = Bootstrap::default();
        assert_eq!(cfg.upstream_api.connect_timeout, Duration::from_secs(1));
        assert_eq!(cfg.upstream_api.request_timeout, Duration::from_secs(3));
        assert_eq!(cfg.upstream_api.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.balancer.server_max_fails, 3);
        assert_eq!(cfg.limiter.max_requests, 200);
        assert_eq!(cfg.sign.link_expiration, Duration::from_secs(10));
    }

    #[test]
    fn validate_requires_secret_and_api() {
        let mut cfg = Bootstrap::default();
        assert!(cfg.validate().is_err());
        cfg.sign.secret = "shhh".into();
        assert!(cfg.validate().is_err());
        cfg.upstream_api.base_url = "http://127.0.0.1:1".into();
        assert!(cfg.validate().is_ok());
        cfg.balancer.server_max_fails = 11;
        assert!(cfg.validate().is_err());
    }
}
