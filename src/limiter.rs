//! Per-IP fixed-window rate limiting.
//!
//! The window state lives either in process memory or in a small sled
//! database, so a restart does not hand abusers a fresh budget when the
//! operator opts into the on-disk store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::config::Limiter;

const MEMORY_PRUNE_THRESHOLD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    window_start: u64,
}

enum Store {
    Memory(Mutex<HashMap<String, Slot>>),
    Disk(sled::Db),
}

pub struct RateLimiter {
    max_requests: u64,
    window: Duration,
    store: Store,
}

impl RateLimiter {
    pub fn open(cfg: &Limiter) -> Result<Self> {
        let store = if cfg.db_path.trim().is_empty() {
            Store::Memory(Mutex::new(HashMap::new()))
        } else {
            let db = sled::open(&cfg.db_path)
                .with_context(|| format!("open limiter db {}", cfg.db_path))?;
            Store::Disk(db)
        };
        Ok(Self {
            max_requests: cfg.max_requests,
            window: cfg.window,
            store,
        })
    }

    /// Counts the hit and reports whether the ip is still inside its
    /// budget for the current window.
    pub fn allow(&self, ip: &str) -> bool {
        let now = unix_now();
        let slot = self.bump(ip, now);
        slot.count <= self.max_requests
    }

    fn bump(&self, ip: &str, now: u64) -> Slot {
        let window = self.window.as_secs().max(1);
        match &self.store {
            Store::Memory(map) => {
                let mut map = map.lock().expect("limiter lock");
                if map.len() > MEMORY_PRUNE_THRESHOLD {
                    map.retain(|_, slot| now - slot.window_start < window);
                }
                let slot = map.entry(ip.to_string()).or_insert(Slot {
                    count: 0,
                    window_start: now,
                });
                if now - slot.window_start >= window {
                    slot.count = 0;
                    slot.window_start = now;
                }
                slot.count += 1;
                *slot
            }
            Store::Disk(db) => {
                let mut slot = db
                    .get(ip)
                    .ok()
                    .flatten()
                    .and_then(|raw| decode_slot(&raw))
                    .unwrap_or(Slot {
                        count: 0,
                        window_start: now,
                    });
                if now - slot.window_start >= window {
                    slot.count = 0;
                    slot.window_start = now;
                }
                slot.count += 1;
                if let Err(err) = db.insert(ip, encode_slot(slot).to_vec()) {
                    log::warn!("limiter store write failed: {err}");
                }
                slot
            }
        }
    }
}

fn encode_slot(slot: Slot) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&slot.count.to_be_bytes());
    buf[8..].copy_from_slice(&slot.window_start.to_be_bytes());
    buf
}

fn decode_slot(raw: &[u8]) -> Option<Slot> {
    if raw.len() != 16 {
        return None;
    }
    Some(Slot {
        count: u64::from_be_bytes(raw[..8].try_into().ok()?),
        window_start: u64::from_be_bytes(raw[8..].try_into().ok()?),
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u64, db_path: &str) -> RateLimiter {
        RateLimiter::open(&Limiter {
            max_requests: max,
            window: Duration::from_secs(60),
            db_path: db_path.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn memory_budget_is_enforced() {
        let limiter = limiter(3, "");
        for _ in 0..3 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));
        // other clients are unaffected
        assert!(limiter.allow("5.6.7.8"));
    }

    #[test]
    fn window_rollover_resets_budget() {
        let limiter = limiter(1, "");
        let now = unix_now();
        assert!(limiter.bump("1.2.3.4", now).count == 1);
        assert!(limiter.bump("1.2.3.4", now).count == 2);
        // next window
        assert_eq!(limiter.bump("1.2.3.4", now + 61).count, 1);
    }

    #[test]
    fn disk_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = limiter(2, dir.path().join("limits").to_str().unwrap());
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
    }

    #[test]
    fn slot_codec() {
        let slot = Slot {
            count: 7,
            window_start: 1_700_000_000,
        };
        let decoded = decode_slot(&encode_slot(slot)).unwrap();
        assert_eq!(decoded.count, 7);
        assert_eq!(decoded.window_start, 1_700_000_000);
        assert!(decode_slot(&[0u8; 3]).is_none());
    }
}
