//! Title metadata: per-quality content hashes for every (title, serie)
//! pair, resolved through a pull-through cache over the external title API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::chunk::{hash_from_filename, TitleQuality, CHUNK_FILENAME};
use crate::config::UpstreamApi;
use crate::metrics;
use crate::singleflight::Group;

const API_METHOD_GET_TITLE: &str = "/title";

/// Cloneable so singleflight losers can observe the winner's failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// The API answered but the requested serie cannot be served; retrying
    /// will not help.
    #[error("title metadata not found: {0}")]
    NotFound(String),
    /// Network or decoding trouble; a later attempt may succeed.
    #[error("title metadata fetch failed: {0}")]
    Transient(String),
}

#[derive(Debug, Deserialize)]
pub struct Title {
    pub id: u16,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub player: Option<Player>,
}

#[derive(Debug, Deserialize)]
pub struct Player {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub playlist: HashMap<String, Option<PlaylistEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistEntry {
    pub serie: u16,
    #[serde(default)]
    pub hls: Option<HlsPaths>,
}

#[derive(Debug, Deserialize, Default)]
pub struct HlsPaths {
    #[serde(default)]
    pub fhd: String,
    #[serde(default)]
    pub hd: String,
    #[serde(default)]
    pub sd: String,
}

/// One (title, serie) record: quality to content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleSerie {
    pub title: u16,
    pub serie: u16,
    hashes: HashMap<TitleQuality, String>,
}

impl TitleSerie {
    pub fn hash_for(&self, quality: TitleQuality) -> Option<&str> {
        self.hashes.get(&quality).map(String::as_str)
    }
}

/// Thin client for the title-metadata API.
#[derive(Clone)]
pub struct TitleClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    request_timeout: Duration,
}

impl TitleClient {
    pub fn new(cfg: &UpstreamApi) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(cfg.connect_timeout));
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(cfg.idle_timeout)
            .build(connector);
        Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            request_timeout: cfg.request_timeout,
        }
    }

    pub async fn fetch_title(&self, title_id: u16) -> Result<Title, MetadataError> {
        let uri: http::Uri = format!("{}{}?id={}", self.base_url, API_METHOD_GET_TITLE, title_id)
            .parse()
            .map_err(|err| MetadataError::Transient(format!("build api uri: {err}")))?;
        let req = http::Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|err| MetadataError::Transient(format!("build api request: {err}")))?;

        let resp = tokio::time::timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| MetadataError::Transient("api request timed out".to_string()))?
            .map_err(|err| MetadataError::Transient(format!("api request: {err}")))?;

        if !resp.status().is_success() {
            return Err(MetadataError::Transient(format!(
                "api answered {}",
                resp.status()
            )));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|err| MetadataError::Transient(format!("read api body: {err}")))?
            .to_bytes();
        serde_json::from_slice(&body)
            .map_err(|err| MetadataError::Transient(format!("decode api response: {err}")))
    }
}

/// Extracts the content hash out of one `hls.*` path: the hash lives in
/// the filename segment, same as in client chunk URIs.
fn quality_hash(rawpath: &str) -> Option<&str> {
    if rawpath.is_empty() {
        return None;
    }
    let filename = rawpath.split('/').nth(CHUNK_FILENAME)?;
    hash_from_filename(filename)
}

/// Turns an API response into cacheable series, dropping entries the
/// playlist marks but cannot serve.
pub fn series_from_title(title: &Title) -> Vec<TitleSerie> {
    let player = match &title.player {
        Some(player) => player,
        None => return Vec::new(),
    };

    let mut series = Vec::new();
    for entry in player.playlist.values() {
        let entry = match entry {
            Some(entry) => entry,
            None => {
                log::warn!("empty serie found in the api response playlist");
                continue;
            }
        };
        let hls = match &entry.hls {
            Some(hls) => hls,
            None => {
                log::warn!("serie {} has no hls block in the api response", entry.serie);
                continue;
            }
        };
        if hls.sd.is_empty() && hls.hd.is_empty() && hls.fhd.is_empty() {
            log::warn!("serie {} quality block is defined but empty", entry.serie);
            continue;
        }

        let mut hashes = HashMap::new();
        for (quality, rawpath) in [
            (TitleQuality::Sd, &hls.sd),
            (TitleQuality::Hd, &hls.hd),
            (TitleQuality::Fhd, &hls.fhd),
        ] {
            match quality_hash(rawpath) {
                Some(hash) => {
                    hashes.insert(quality, hash.to_string());
                }
                None => log::warn!(
                    "no {quality} hash for title {} serie {}",
                    title.id,
                    entry.serie
                ),
            }
        }
        if hashes.is_empty() {
            log::warn!(
                "no extractable hashes for title {} serie {}",
                title.id,
                entry.serie
            );
            continue;
        }

        series.push(TitleSerie {
            title: title.id,
            serie: entry.serie,
            hashes,
        });
    }

    series
}

struct CachedSerie {
    serie: Arc<TitleSerie>,
    inserted_at: Instant,
}

/// Pull-through cache. Concurrent misses for one key collapse into a
/// single upstream fetch; every serie the API returns is cached, not just
/// the requested one.
pub struct TitleStore {
    client: TitleClient,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<(u16, u16), CachedSerie>>>,
    flight: Group<(u16, u16), Result<Arc<TitleSerie>, MetadataError>>,
}

impl TitleStore {
    pub fn new(client: TitleClient, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
            flight: Group::new(),
        }
    }

    pub async fn resolve(
        &self,
        title_id: u16,
        serie_id: u16,
    ) -> Result<Arc<TitleSerie>, MetadataError> {
        let key = (title_id, serie_id);
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if cached.inserted_at.elapsed() < self.ttl {
                    metrics::record_title_cache("hit");
                    return Ok(Arc::clone(&cached.serie));
                }
            }
        }
        metrics::record_title_cache("miss");

        let client = self.client.clone();
        let cache = Arc::clone(&self.cache);
        self.flight
            .do_call(key, move || async move {
                fetch_into_cache(client, cache, title_id, serie_id).await
            })
            .await
    }

    /// Drops every cached serie; the next request refetches.
    pub async fn reset(&self) {
        self.cache.write().await.clear();
    }

    pub async fn size(&self) -> usize {
        self.cache.read().await.len()
    }
}

async fn fetch_into_cache(
    client: TitleClient,
    cache: Arc<RwLock<HashMap<(u16, u16), CachedSerie>>>,
    title_id: u16,
    serie_id: u16,
) -> Result<Arc<TitleSerie>, MetadataError> {
    log::debug!("title {title_id} serie {serie_id} missed the cache, asking the api");
    let title = match client.fetch_title(title_id).await {
        Ok(title) => title,
        Err(err) => {
            metrics::record_title_cache("fetch_error");
            return Err(err);
        }
    };

    let series = series_from_title(&title);
    if series.is_empty() {
        metrics::record_title_cache("empty");
        return Err(MetadataError::NotFound(
            "there is an empty result in the response".to_string(),
        ));
    }

    let mut requested = None;
    let now = Instant::now();
    let mut guard = cache.write().await;
    for serie in series {
        let serie = Arc::new(serie);
        if serie.serie == serie_id {
            requested = Some(Arc::clone(&serie));
        }
        guard.insert(
            (serie.title, serie.serie),
            CachedSerie {
                serie,
                inserted_at: now,
            },
        );
    }
    drop(guard);

    requested.ok_or_else(|| {
        MetadataError::NotFound("could not find requested serie id in the response".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_title(id: u16) -> Title {
        let raw = format!(
            r#"{{
                "id": {id},
                "code": "sample",
                "player": {{
                    "host": "cache.example.org",
                    "playlist": {{
                        "13": {{
                            "serie": 13,
                            "hls": {{
                                "fhd": "/videos/media/ts/{id}/13/1080/abc_00001.ts",
                                "hd": "/videos/media/ts/{id}/13/720/def_00001.ts",
                                "sd": "/videos/media/ts/{id}/13/480/ghi_00001.ts"
                            }}
                        }},
                        "14": {{
                            "serie": 14,
                            "hls": {{ "fhd": "", "hd": "", "sd": "" }}
                        }}
                    }}
                }}
            }}"#
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn decodes_and_validates_series() {
        let title = sample_title(9277);
        let series = series_from_title(&title);
        // serie 14 is all-empty and must be dropped
        assert_eq!(series.len(), 1);
        let serie = &series[0];
        assert_eq!((serie.title, serie.serie), (9277, 13));
        assert_eq!(serie.hash_for(TitleQuality::Fhd), Some("abc"));
        assert_eq!(serie.hash_for(TitleQuality::Hd), Some("def"));
        assert_eq!(serie.hash_for(TitleQuality::Sd), Some("ghi"));
    }

    #[test]
    fn missing_player_yields_nothing() {
        let title: Title = serde_json::from_str(r#"{"id": 1, "code": "x"}"#).unwrap();
        assert!(series_from_title(&title).is_empty());
    }

    #[test]
    fn quality_hash_needs_full_path() {
        assert_eq!(
            quality_hash("/videos/media/ts/9277/13/720/def_00001.ts"),
            Some("def")
        );
        assert_eq!(quality_hash("def_00001.ts"), None);
        assert_eq!(quality_hash(""), None);
    }
}
