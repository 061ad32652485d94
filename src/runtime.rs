//! Hot-swappable runtime configuration.
//!
//! Every parameter sits behind its own read-write lock. The request path
//! only ever uses `try_read`: a reader that loses the race reports the
//! value as unavailable and the caller skips the dependent behavior
//! instead of blocking behind a writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;

use crate::blocklist::Blocklist;
use crate::chunk::TitleQuality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigParam {
    QualityLevel,
    LotteryChance,
    LimiterEnabled,
    ClusterA5bility,
    StdoutAccess,
    BlocklistEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValue {
    Int(i64),
    Quality(TitleQuality),
}

impl ConfigValue {
    pub fn as_int(self) -> Option<i64> {
        match self {
            ConfigValue::Int(v) => Some(v),
            ConfigValue::Quality(_) => None,
        }
    }

    pub fn as_quality(self) -> Option<TitleQuality> {
        match self {
            ConfigValue::Quality(q) => Some(q),
            ConfigValue::Int(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    Lottery,
    Quality,
    BlockSwitch,
    BlockIps,
    Limiter,
    A5bility,
    StdoutAccess,
}

impl PatchKind {
    fn humanize(self) -> &'static str {
        match self {
            PatchKind::Lottery => "lottery chance",
            PatchKind::Quality => "quality level",
            PatchKind::BlockSwitch => "blocklist switch",
            PatchKind::BlockIps => "blocklist ips",
            PatchKind::Limiter => "limiter switch",
            PatchKind::A5bility => "cluster availability",
            PatchKind::StdoutAccess => "stdout access log switch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimePatch {
    pub kind: PatchKind,
    pub payload: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("given patch payload is undefined")]
    EmptyPayload,
    #[error("could not parse patch payload: {0}")]
    BadPayload(String),
    #[error("patch value {0} is out of the permitted range")]
    OutOfRange(i64),
}

/// Lottery value plus the bookkeeping its smooth updates need; shared
/// with the stepper task, so it lives behind its own `Arc`.
struct LotteryState {
    chance: RwLock<i64>,
    // invalidates in-flight smooth updates when a newer one lands
    generation: AtomicU64,
    tick: Duration,
    // at most this many one-point steps; longer walks jump the remainder
    step: i64,
}

/// The storage itself. Writers are rare (consul patches, admin calls);
/// readers run once or more per request.
pub struct ConfigStorage {
    quality: RwLock<TitleQuality>,
    lottery: Arc<LotteryState>,
    limiter: RwLock<i64>,
    a5bility: RwLock<i64>,
    stdout_access: RwLock<i64>,
    blocklist: Arc<Blocklist>,
}

impl ConfigStorage {
    pub fn new(blocklist: Arc<Blocklist>, softer_tick: Duration, softer_step: i64) -> Self {
        Self {
            quality: RwLock::new(TitleQuality::Fhd),
            lottery: Arc::new(LotteryState {
                chance: RwLock::new(0),
                generation: AtomicU64::new(0),
                tick: softer_tick,
                step: softer_step.max(1),
            }),
            limiter: RwLock::new(0),
            a5bility: RwLock::new(100),
            stdout_access: RwLock::new(0),
            blocklist,
        }
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    /// Non-blocking read. `None` means a writer holds the lock right now;
    /// the caller is expected to skip whatever depended on the value.
    pub fn get_value(&self, param: ConfigParam) -> Option<ConfigValue> {
        match param {
            ConfigParam::QualityLevel => self
                .quality
                .try_read()
                .ok()
                .map(|g| ConfigValue::Quality(*g)),
            ConfigParam::LotteryChance => self
                .lottery
                .chance
                .try_read()
                .ok()
                .map(|g| ConfigValue::Int(*g)),
            ConfigParam::LimiterEnabled => {
                self.limiter.try_read().ok().map(|g| ConfigValue::Int(*g))
            }
            ConfigParam::ClusterA5bility => {
                self.a5bility.try_read().ok().map(|g| ConfigValue::Int(*g))
            }
            ConfigParam::StdoutAccess => self
                .stdout_access
                .try_read()
                .ok()
                .map(|g| ConfigValue::Int(*g)),
            ConfigParam::BlocklistEnabled => {
                Some(ConfigValue::Int(self.blocklist.is_enabled() as i64))
            }
        }
    }

    pub fn set_value(&self, param: ConfigParam, value: ConfigValue) {
        match (param, value) {
            (ConfigParam::QualityLevel, ConfigValue::Quality(q)) => {
                *self.quality.write().expect("quality lock") = q;
            }
            (ConfigParam::LotteryChance, ConfigValue::Int(v)) => {
                *self.lottery.chance.write().expect("lottery lock") = v;
            }
            (ConfigParam::LimiterEnabled, ConfigValue::Int(v)) => {
                *self.limiter.write().expect("limiter lock") = v;
            }
            (ConfigParam::ClusterA5bility, ConfigValue::Int(v)) => {
                *self.a5bility.write().expect("a5bility lock") = v;
            }
            (ConfigParam::StdoutAccess, ConfigValue::Int(v)) => {
                *self.stdout_access.write().expect("stdout access lock") = v;
            }
            (ConfigParam::BlocklistEnabled, ConfigValue::Int(v)) => {
                self.blocklist.set_enabled(v != 0);
            }
            (param, value) => {
                panic!("internal error - type mismatch for {param:?} <- {value:?}")
            }
        }
    }

    /// Walks the lottery chance toward `target` one point per tick instead
    /// of jumping, so traffic shifts without a thundering herd. A newer
    /// smooth update cancels the one in flight.
    pub fn set_value_smoothly(&self, param: ConfigParam, target: i64) {
        debug_assert_eq!(param, ConfigParam::LotteryChance);

        let generation = self.lottery.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let lottery = Arc::clone(&self.lottery);
        tokio::spawn(async move {
            {
                // walks longer than the configured step jump the remainder
                let mut current = lottery.chance.write().expect("lottery lock");
                if (target - *current).abs() > lottery.step {
                    *current = if *current < target {
                        target - lottery.step
                    } else {
                        target + lottery.step
                    };
                }
            }
            let mut ticker = tokio::time::interval(lottery.tick);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if lottery.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let current = *lottery.chance.read().expect("lottery lock");
                if current == target {
                    log::info!("lottery chance reached target {target}");
                    return;
                }
                let next = if current < target { current + 1 } else { current - 1 };
                *lottery.chance.write().expect("lottery lock") = next;
            }
        });
    }

    /// Applies one inbound patch. Malformed payloads fail that patch only;
    /// previously applied state stays untouched.
    pub fn apply_patch(&self, patch: &RuntimePatch) -> Result<(), PatchError> {
        let result = self.dispatch_patch(patch);
        match &result {
            Ok(()) => {
                log::info!("runtime config - applied {}", patch.kind.humanize());
            }
            Err(err) => {
                log::error!(
                    "could not apply runtime configuration ({}): {err}",
                    patch.kind.humanize()
                );
            }
        }
        result
    }

    fn dispatch_patch(&self, patch: &RuntimePatch) -> Result<(), PatchError> {
        if patch.payload.is_empty() {
            return Err(PatchError::EmptyPayload);
        }

        match patch.kind {
            PatchKind::Lottery => {
                let chance = parse_percent(&patch.payload)?;
                self.set_value_smoothly(ConfigParam::LotteryChance, chance);
            }
            PatchKind::Quality => {
                let quality = TitleQuality::from_folder(&patch.payload)
                    .ok_or_else(|| PatchError::BadPayload(patch.payload.clone()))?;
                self.set_value(ConfigParam::QualityLevel, ConfigValue::Quality(quality));
            }
            PatchKind::BlockSwitch => {
                let enabled = parse_switch(&patch.payload)?;
                self.blocklist.set_enabled(enabled);
            }
            PatchKind::BlockIps => {
                if patch.payload == "_" {
                    self.blocklist.reset();
                    log::info!("runtime config - blocklist has been reset");
                } else {
                    self.blocklist.push(patch.payload.split(','));
                }
            }
            PatchKind::Limiter => {
                let enabled = parse_switch(&patch.payload)?;
                self.set_value(ConfigParam::LimiterEnabled, ConfigValue::Int(enabled as i64));
            }
            PatchKind::A5bility => {
                let percent = parse_percent(&patch.payload)?;
                self.set_value(ConfigParam::ClusterA5bility, ConfigValue::Int(percent));
            }
            PatchKind::StdoutAccess => {
                let enabled = parse_switch(&patch.payload)?;
                self.set_value(ConfigParam::StdoutAccess, ConfigValue::Int(enabled as i64));
            }
        }

        Ok(())
    }
}

fn parse_percent(payload: &str) -> Result<i64, PatchError> {
    let value: i64 = payload
        .trim()
        .parse()
        .map_err(|_| PatchError::BadPayload(payload.to_string()))?;
    if !(0..=100).contains(&value) {
        return Err(PatchError::OutOfRange(value));
    }
    Ok(value)
}

fn parse_switch(payload: &str) -> Result<bool, PatchError> {
    match payload.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(PatchError::BadPayload(other.to_string())),
    }
}
