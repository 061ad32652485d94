//! The per-request decision core: precondition, blocklist, rate limiting,
//! fake-quality rewrite, lottery-gated balancing, signing. Stages run
//! strictly in order; any stage may settle the request early.

use std::sync::Arc;
use std::time::Instant;

use http::HeaderMap;
use rand::Rng;
use thiserror::Error;

use crate::balancer::Balancer;
use crate::blocklist::Blocklist;
use crate::chunk::ChunkRequest;
use crate::config;
use crate::constants;
use crate::limiter::RateLimiter;
use crate::metrics;
use crate::rewrite::QualityRewriter;
use crate::runtime::{ConfigParam, ConfigStorage, ConfigValue};
use crate::signer::LinkSigner;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("invalid uri")]
    Uri,
    #[error("invalid id")]
    Id,
    #[error("invalid server")]
    Server,
}

/// What the client asked for, pulled out of the required headers.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientIntent {
    pub uri: String,
    pub client_id: String,
    pub server: String,
}

/// Requires non-empty `X-Client-Uri`, `X-Client-Id` and `X-Cache-Server`,
/// reporting the first missing one.
pub fn precondition(headers: &HeaderMap) -> Result<ClientIntent, PreconditionError> {
    let uri = header_value(headers, constants::HEADER_CLIENT_URI).ok_or(PreconditionError::Uri)?;
    let client_id =
        header_value(headers, constants::HEADER_CLIENT_ID).ok_or(PreconditionError::Id)?;
    let server =
        header_value(headers, constants::HEADER_CACHE_SERVER).ok_or(PreconditionError::Server)?;
    Ok(ClientIntent {
        uri,
        client_id,
        server,
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

/// Terminal state of a media request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 204 with the signed location.
    Signed { location: String },
    /// 403, the client ip is blocklisted.
    Blocked,
    /// 429, over the per-ip budget.
    Limited,
    /// 500, the signer could not build a url.
    SignFailed(String),
}

/// Per-stage monotonic laps, logged once per request at debug.
pub struct StageTimers {
    started: Instant,
    laps: Vec<(&'static str, Instant)>,
}

impl StageTimers {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            laps: Vec::with_capacity(6),
        }
    }

    pub fn lap(&mut self, stage: &'static str) {
        self.laps.push((stage, Instant::now()));
    }

    pub fn emit(&self, status: u16) {
        if log::log_enabled!(log::Level::Debug) {
            let end = Instant::now();
            let mut line = String::new();
            for (i, (stage, at)) in self.laps.iter().enumerate() {
                let until = self.laps.get(i + 1).map(|(_, at)| *at).unwrap_or(end);
                line.push_str(&format!("{stage}={:?} ", until.duration_since(*at)));
            }
            log::debug!(
                "{line}total={:?} status={status}",
                end.duration_since(self.started)
            );
        }
    }
}

pub struct Pipeline {
    runtime: Arc<ConfigStorage>,
    blocklist: Arc<Blocklist>,
    rewriter: QualityRewriter,
    balancers: Vec<Arc<dyn Balancer>>,
    signer: LinkSigner,
    limiter: Arc<RateLimiter>,
    full_bypass: bool,
    highcost_zone: bool,
    max_fails: u32,
}

impl Pipeline {
    pub fn new(
        runtime: Arc<ConfigStorage>,
        rewriter: QualityRewriter,
        balancers: Vec<Arc<dyn Balancer>>,
        signer: LinkSigner,
        limiter: Arc<RateLimiter>,
        balancer_cfg: &config::Balancer,
    ) -> Self {
        let blocklist = Arc::clone(runtime.blocklist());
        Self {
            runtime,
            blocklist,
            rewriter,
            balancers,
            signer,
            limiter,
            full_bypass: balancer_cfg.full_bypass,
            highcost_zone: balancer_cfg.highcost_zone,
            max_fails: balancer_cfg.server_max_fails.max(1),
        }
    }

    /// Runs the full media pipeline for one request.
    pub async fn decide(
        &self,
        intent: ClientIntent,
        client_ip: &str,
        timers: &mut StageTimers,
    ) -> Verdict {
        timers.lap("blist");
        if self.blocklist.is_enabled() && self.blocklist.is_exists(client_ip) {
            log::debug!("client {client_ip} has been banned, forbid request");
            metrics::record_blocked();
            return Verdict::Blocked;
        }

        if self.limiter_applies(client_ip) && !self.limiter.allow(client_ip) {
            metrics::record_limited();
            return Verdict::Limited;
        }

        timers.lap("fquality");
        let uri = self.fake_quality(&intent.uri).await;

        timers.lap("clottery");
        let server = self.balance(&uri, &intent.server);

        timers.lap("reqsign");
        match self.signer.sign(&uri, &server, &intent.client_id) {
            Ok(location) => {
                log::debug!("request signing completed: {location}");
                Verdict::Signed { location }
            }
            Err(err) => Verdict::SignFailed(err.to_string()),
        }
    }

    /// The cache-nodes lookup: balance over the bare node cluster only and
    /// return the chosen server, no signing involved.
    pub fn balance_nodes(&self, intent: &ClientIntent) -> String {
        match self.balancers.last() {
            Some(nodes) => {
                self.balance_over(std::slice::from_ref(nodes), &intent.uri, &intent.server)
            }
            None => intent.server.clone(),
        }
    }

    fn limiter_applies(&self, client_ip: &str) -> bool {
        if client_ip == "127.0.0.1" {
            return false;
        }
        matches!(
            self.runtime.get_value(ConfigParam::LimiterEnabled),
            Some(ConfigValue::Int(enabled)) if enabled != 0
        )
    }

    /// Quality ceiling enforcement. Degrades to a no-op whenever the chunk
    /// is unparsable or the config read loses its try-lock.
    async fn fake_quality(&self, uri: &str) -> String {
        let chunk = ChunkRequest::parse(uri);
        if !chunk.is_valid() {
            return uri.to_string();
        }

        let ceiling = match self.runtime.get_value(ConfigParam::QualityLevel) {
            Some(ConfigValue::Quality(quality)) => quality,
            _ => {
                log::warn!("could not read the quality ceiling, skipping fake quality chain");
                return uri.to_string();
            }
        };

        self.rewriter.rewrite(&chunk, uri, ceiling).await
    }

    fn balance(&self, uri: &str, fallback: &str) -> String {
        if self.full_bypass {
            return fallback.to_string();
        }
        if self.highcost_zone && !self.availability_roll() {
            metrics::record_lottery_skip();
            return fallback.to_string();
        }
        if !self.lottery_won() {
            metrics::record_lottery_skip();
            return fallback.to_string();
        }

        self.balance_over(&self.balancers, uri, fallback)
    }

    fn balance_over(&self, balancers: &[Arc<dyn Balancer>], uri: &str, fallback: &str) -> String {
        let chunk = ChunkRequest::parse(uri);
        if !chunk.is_valid() {
            return fallback.to_string();
        }
        let chunkname = trim_chunk_extension(chunk.filename());

        let mut fails = 0u32;
        for balancer in balancers {
            if fails >= self.max_fails {
                break;
            }
            match balancer.balance_by_chunk(chunk.title_id_str(), chunkname) {
                Ok((ip, server)) => {
                    metrics::record_balance(balancer.cluster_name(), true);
                    log::debug!(
                        "balanced onto {} ({ip}) via {}",
                        server.name,
                        balancer.cluster_name()
                    );
                    return format!("https://{}", server.name);
                }
                Err(err) => {
                    metrics::record_balance(balancer.cluster_name(), false);
                    log::debug!(
                        "balancer {} skipped: {err}; falling through",
                        balancer.cluster_name()
                    );
                    fails += 1;
                }
            }
        }

        fallback.to_string()
    }

    /// Draw on `[1, 100]`; balancing happens iff the draw lands at or
    /// under the configured chance. An unreadable chance means skip.
    fn lottery_won(&self) -> bool {
        let chance = match self.runtime.get_value(ConfigParam::LotteryChance) {
            Some(ConfigValue::Int(chance)) => chance,
            _ => {
                log::warn!("could not read the lottery chance, skipping balancing");
                return false;
            }
        };
        rand::thread_rng().gen_range(1..=100) <= chance
    }

    fn availability_roll(&self) -> bool {
        let percent = match self.runtime.get_value(ConfigParam::ClusterA5bility) {
            Some(ConfigValue::Int(percent)) => percent,
            _ => return true,
        };
        rand::thread_rng().gen_range(1..=100) <= percent
    }
}

fn trim_chunk_extension(filename: &str) -> &str {
    filename
        .strip_suffix(".ts")
        .or_else(|| filename.strip_suffix(".m3u8"))
        .unwrap_or(filename)
}
