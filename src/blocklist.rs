use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Concurrent set of banned client IPs with an independent enable switch.
///
/// `push` is a bulk replace: the consul feed always delivers the complete
/// list, so partial merges are never needed.
#[derive(Debug, Default)]
pub struct Blocklist {
    ips: RwLock<HashSet<String>>,
    enabled: AtomicBool,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<I, S>(&self, ips: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = self.ips.write().expect("blocklist lock");
        set.clear();
        for ip in ips {
            let ip = ip.as_ref();
            if ip.is_empty() {
                continue;
            }
            set.insert(ip.to_string());
        }
        log::debug!("blocklist replaced, size {}", set.len());
    }

    pub fn is_exists(&self, ip: &str) -> bool {
        if ip.is_empty() {
            log::warn!("internal error, empty ip queried against blocklist");
            return false;
        }
        self.ips.read().expect("blocklist lock").contains(ip)
    }

    pub fn size(&self) -> usize {
        self.ips.read().expect("blocklist lock").len()
    }

    pub fn reset(&self) {
        self.ips.write().expect("blocklist lock").clear();
    }

    pub fn remove(&self, ip: &str) -> bool {
        self.ips.write().expect("blocklist lock").remove(ip)
    }

    pub fn insert(&self, ip: &str) -> bool {
        if ip.is_empty() {
            return false;
        }
        self.ips.write().expect("blocklist lock").insert(ip.to_string())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}
