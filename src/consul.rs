//! Consul feeds: the KV prefix turns into runtime config patches, the
//! service catalogs turn into balancer upstream sets. Both loops are
//! long-poll watchers with index reuse and jittered backoff on failure.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use serde::Deserialize;

use crate::balancer::Balancer;
use crate::config::Consul;
use crate::runtime::{ConfigStorage, PatchKind, RuntimePatch};

const CONSUL_INDEX_HEADER: &str = "X-Consul-Index";

/// KV key name (relative to the prefix) to patch kind. Keys outside this
/// table are ignored with a warning.
pub fn patch_kind_for_key(key: &str) -> Option<PatchKind> {
    match key {
        "lottery-chance" => Some(PatchKind::Lottery),
        "quality-level" => Some(PatchKind::Quality),
        "block-list" => Some(PatchKind::BlockIps),
        "block-list-switcher" => Some(PatchKind::BlockSwitch),
        "limiter-switcher" => Some(PatchKind::Limiter),
        "cluster-a5bility" => Some(PatchKind::A5bility),
        "stdout-access-log" => Some(PatchKind::StdoutAccess),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Node")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize, Default)]
struct HealthService {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Clone)]
pub struct ConsulClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
    wait: Duration,
}

impl ConsulClient {
    pub fn new(cfg: &Consul) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(1)));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            base: cfg.address.trim_end_matches('/').to_string(),
            wait: cfg.wait,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
    ) -> Result<(T, u64)> {
        let uri: http::Uri = format!("{}{}", self.base, path_and_query)
            .parse()
            .context("build consul uri")?;
        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .context("build consul request")?;

        // blocking queries hold until the index moves or `wait` passes
        let resp = tokio::time::timeout(self.wait + Duration::from_secs(10), self.client.request(req))
            .await
            .map_err(|_| anyhow!("consul request timed out"))?
            .context("consul request")?;

        if !resp.status().is_success() {
            return Err(anyhow!("consul answered {}", resp.status()));
        }
        let index = resp
            .headers()
            .get(CONSUL_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let body = resp
            .into_body()
            .collect()
            .await
            .context("read consul body")?
            .to_bytes();
        let decoded = serde_json::from_slice(&body).context("decode consul response")?;
        Ok((decoded, index))
    }

    async fn fetch_kv(&self, prefix: &str, index: u64) -> Result<(Vec<KvEntry>, u64)> {
        self.get_json(&format!(
            "/v1/kv/{prefix}?recurse=true&index={index}&wait={}s",
            self.wait.as_secs()
        ))
        .await
    }

    async fn fetch_service(&self, service: &str, index: u64) -> Result<(Vec<HealthEntry>, u64)> {
        self.get_json(&format!(
            "/v1/health/service/{service}?passing=true&index={index}&wait={}s",
            self.wait.as_secs()
        ))
        .await
    }
}

/// Boots both feeds. With `ignore_errors` unset a dead consul fails the
/// process at startup instead of serving stale defaults silently.
pub async fn start(
    cfg: &Consul,
    storage: Arc<ConfigStorage>,
    clusters: Vec<Arc<dyn Balancer>>,
) -> Result<()> {
    if cfg.address.trim().is_empty() {
        log::warn!("consul address is empty, runtime feeds are disabled");
        return Ok(());
    }

    let client = ConsulClient::new(cfg);

    match client.fetch_kv(&cfg.kv_prefix, 0).await {
        Ok((entries, _)) => {
            log::info!("consul kv reachable, {} keys under prefix", entries.len())
        }
        Err(err) if cfg.ignore_errors => {
            log::warn!("consul unreachable, continuing on defaults: {err}")
        }
        Err(err) => return Err(err.context("initial consul kv fetch")),
    }

    {
        let client = client.clone();
        let prefix = cfg.kv_prefix.clone();
        let storage = Arc::clone(&storage);
        tokio::spawn(async move {
            watch_kv(client, prefix, storage).await;
        });
    }

    for (service, balancer) in [&cfg.service_nodes, &cfg.service_cloud]
        .into_iter()
        .zip(clusters)
    {
        let client = client.clone();
        let service = service.clone();
        let domain = cfg.entries_domain.clone();
        tokio::spawn(async move {
            watch_service(client, service, domain, balancer).await;
        });
    }

    Ok(())
}

async fn watch_kv(client: ConsulClient, prefix: String, storage: Arc<ConfigStorage>) {
    let mut index = 0u64;
    let mut seen: HashMap<String, u64> = HashMap::new();

    loop {
        let (entries, next_index) = match client.fetch_kv(&prefix, index).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("consul kv watch failed: {err}");
                backoff().await;
                continue;
            }
        };
        // stale or reset index must restart the watch from scratch
        if next_index < index {
            index = 0;
            seen.clear();
            continue;
        }
        index = next_index;

        for entry in entries {
            let key = entry
                .key
                .strip_prefix(&prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(&entry.key);
            if seen.get(key) == Some(&entry.modify_index) {
                continue;
            }
            seen.insert(key.to_string(), entry.modify_index);

            let kind = match patch_kind_for_key(key) {
                Some(kind) => kind,
                None => {
                    log::warn!("consul kv key {key} has no runtime binding, skipping");
                    continue;
                }
            };
            let payload = entry
                .value
                .as_deref()
                .and_then(|raw| BASE64_STANDARD.decode(raw).ok())
                .and_then(|raw| String::from_utf8(raw).ok())
                .unwrap_or_default();

            // per-patch failures must not stop the batch
            let _ = storage.apply_patch(&RuntimePatch { kind, payload });
        }
    }
}

async fn watch_service(
    client: ConsulClient,
    service: String,
    domain: String,
    balancer: Arc<dyn Balancer>,
) {
    let mut index = 0u64;

    loop {
        let (entries, next_index) = match client.fetch_service(&service, index).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("consul service watch ({service}) failed: {err}");
                backoff().await;
                continue;
            }
        };
        if next_index < index {
            index = 0;
            continue;
        }
        index = next_index;

        let mut servers: HashMap<String, IpAddr> = HashMap::new();
        for entry in &entries {
            let raw_ip = if entry.service.address.is_empty() {
                &entry.node.address
            } else {
                &entry.service.address
            };
            let ip: IpAddr = match raw_ip.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    log::warn!("service {service} entry {} has bad address {raw_ip}", entry.node.name);
                    continue;
                }
            };
            let name = if domain.is_empty() {
                entry.node.name.clone()
            } else {
                format!("{}.{}", entry.node.name, domain)
            };
            servers.insert(name, ip);
        }

        log::debug!("service {service} delivered {} entries", servers.len());
        balancer.update_servers(servers);
    }
}

async fn backoff() {
    let jitter = rand::thread_rng().gen_range(0..1000);
    tokio::time::sleep(Duration::from_millis(2000 + jitter)).await;
}
