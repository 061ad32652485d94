use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::{BalanceError, Balancer};

/// One upstream cache server. Identity is the IP; mutable stats are
/// atomics so balance-path bumps never touch the membership lock.
#[derive(Debug)]
pub struct UpstreamServer {
    pub name: String,
    pub ip: IpAddr,
    handled_requests: AtomicU64,
    last_request_unix: AtomicU64,
    is_down: AtomicBool,
    last_changed_unix: AtomicU64,
}

impl UpstreamServer {
    fn new(name: &str, ip: IpAddr) -> Self {
        Self {
            name: name.to_string(),
            ip,
            handled_requests: AtomicU64::new(0),
            last_request_unix: AtomicU64::new(0),
            is_down: AtomicBool::new(false),
            last_changed_unix: AtomicU64::new(unix_now()),
        }
    }

    pub fn handled_requests(&self) -> u64 {
        self.handled_requests.load(Ordering::Relaxed)
    }

    pub fn is_down(&self) -> bool {
        self.is_down.load(Ordering::Relaxed)
    }

    fn stat_request(&self) {
        self.handled_requests.fetch_add(1, Ordering::Relaxed);
        self.last_request_unix.store(unix_now(), Ordering::Relaxed);
    }

    fn set_down(&self, down: bool) {
        if self.is_down.swap(down, Ordering::Relaxed) != down {
            self.last_changed_unix.store(unix_now(), Ordering::Relaxed);
        }
    }

    fn reset_stats(&self) {
        self.handled_requests.store(0, Ordering::Relaxed);
        self.last_request_unix.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub name: String,
    pub address: String,
    pub requests: u64,
    pub last_request_unix: u64,
    pub is_down: bool,
    pub status_changed_unix: u64,
}

/// Hash-partitioned balancer over one cluster.
///
/// Two locks on purpose: the server map (membership, stats reads) and the
/// `ips` snapshot used for index selection. The balance path takes only a
/// try-read on the snapshot, so a concurrent membership rebuild sheds the
/// request to the fallback chain instead of stalling it.
pub struct ClusterBalancer {
    name: &'static str,
    upstream: RwLock<HashMap<String, Arc<UpstreamServer>>>,
    snapshot: RwLock<Vec<String>>,
}

impl ClusterBalancer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            upstream: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Vec::new()),
        }
    }

    /// Numeric payload of a chunk name: the counter after the underscore,
    /// or the digits of a legacy `fffNNNNN` name.
    fn key_from_chunkname(chunkname: &str) -> Result<String, BalanceError> {
        if chunkname.contains('_') {
            return chunkname
                .split('_')
                .nth(1)
                .map(str::to_string)
                .ok_or(BalanceError::UnparsableChunk);
        }
        if chunkname.contains("fff") {
            return Ok(chunkname.replace("fff", ""));
        }
        Err(BalanceError::UnparsableChunk)
    }

    fn pick_ip(&self, idx: u64) -> Result<String, BalanceError> {
        let snapshot = self
            .snapshot
            .try_read()
            .map_err(|_| BalanceError::Unavailable)?;
        if snapshot.is_empty() {
            return Err(BalanceError::Unavailable);
        }
        Ok(snapshot[(idx % snapshot.len() as u64) as usize].clone())
    }

    fn rebuild_snapshot(&self, upstream: &HashMap<String, Arc<UpstreamServer>>) {
        let mut live: Vec<String> = upstream
            .iter()
            .filter(|(_, server)| !server.is_down())
            .map(|(ip, _)| ip.clone())
            .collect();
        // ordering must be stable across rebuilds of the same membership
        live.sort();

        let mut snapshot = self.snapshot.write().expect("snapshot lock");
        *snapshot = live;
        log::debug!(
            "{} snapshot rebuilt, {} live servers",
            self.name,
            snapshot.len()
        );
    }
}

impl Balancer for ClusterBalancer {
    fn balance_by_chunk(
        &self,
        prefix: &str,
        chunkname: &str,
    ) -> Result<(String, Arc<UpstreamServer>), BalanceError> {
        let key = Self::key_from_chunkname(chunkname)?;

        // decimal concatenation, not addition
        let idx: u64 = format!("{prefix}{key}")
            .parse()
            .map_err(|_| BalanceError::UnparsableChunk)?;

        let ip = self.pick_ip(idx)?;

        let server = {
            let upstream = self.upstream.read().expect("upstream lock");
            match upstream.get(&ip) {
                Some(server) => Arc::clone(server),
                // the snapshot only ever holds ips taken from the map
                None => panic!("balance result could not be found in balancer's upstream"),
            }
        };

        if server.is_down() {
            return Err(BalanceError::ServerUnavailable);
        }

        server.stat_request();
        Ok((ip, server))
    }

    fn update_servers(&self, servers: HashMap<String, IpAddr>) {
        log::info!("{} upstream update triggered", self.name);

        let mut upstream = self.upstream.write().expect("upstream lock");
        for (name, ip) in &servers {
            let key = ip.to_string();
            match upstream.get(&key) {
                Some(server) => server.set_down(false),
                None => {
                    log::debug!("{} new server: {name} ({ip})", self.name);
                    upstream.insert(key, Arc::new(UpstreamServer::new(name, *ip)));
                }
            }
        }

        for server in upstream.values() {
            if !servers.contains_key(&server.name) {
                log::debug!("{} server {} disabled", self.name, server.name);
                server.set_down(true);
            }
        }

        self.rebuild_snapshot(&upstream);
    }

    fn stats(&self) -> Vec<ServerStats> {
        let upstream = self.upstream.read().expect("upstream lock");
        let mut stats: Vec<ServerStats> = upstream
            .values()
            .map(|server| ServerStats {
                name: server.name.clone(),
                address: server.ip.to_string(),
                requests: server.handled_requests(),
                last_request_unix: server.last_request_unix.load(Ordering::Relaxed),
                is_down: server.is_down(),
                status_changed_unix: server.last_changed_unix.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| b.requests.cmp(&a.requests));
        stats
    }

    fn reset_stats(&self) {
        let upstream = self.upstream.read().expect("upstream lock");
        for server in upstream.values() {
            server.reset_stats();
        }
    }

    fn reset_upstream(&self) {
        let mut upstream = self.upstream.write().expect("upstream lock");
        upstream.clear();
        self.rebuild_snapshot(&upstream);
    }

    fn cluster_name(&self) -> &'static str {
        self.name
    }
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

    fn members(pairs: &[(&str, &str)]) -> HashMap<String, IpAddr> {
        pairs
            .iter()
            .map(|(name, ip)| (name.to_string(), ip.parse().unwrap()))
            .collect()
    }

    #[test]
    fn key_extraction() {
        assert_eq!(
            ClusterBalancer::key_from_chunkname("abc_00028"),
            Ok("00028".to_string())
        );
        assert_eq!(
            ClusterBalancer::key_from_chunkname("fff00042"),
            Ok("00042".to_string())
        );
        assert_eq!(
            ClusterBalancer::key_from_chunkname("97d3bb428727bc25fa110bc51826a366"),
            Err(BalanceError::UnparsableChunk)
        );
    }

    #[test]
    fn balance_is_deterministic() {
        let balancer = ClusterBalancer::new("nodes");
        balancer.update_servers(members(&[("a", "1.1.1.1"), ("b", "2.2.2.2")]));

        let (first, _) = balancer.balance_by_chunk("9277", "abc_00028").unwrap();
        for _ in 0..16 {
            let (ip, _) = balancer.balance_by_chunk("9277", "abc_00028").unwrap();
            assert_eq!(ip, first);
        }
    }

    #[test]
    fn non_numeric_key_is_unparsable() {
        let balancer = ClusterBalancer::new("nodes");
        balancer.update_servers(members(&[("a", "1.1.1.1")]));
        assert_eq!(
            balancer.balance_by_chunk("9277", "abc_bad!"),
            Err(BalanceError::UnparsableChunk)
        );
    }

    #[test]
    fn empty_upstream_is_unavailable() {
        let balancer = ClusterBalancer::new("nodes");
        assert_eq!(
            balancer.balance_by_chunk("9277", "abc_00028"),
            Err(BalanceError::Unavailable)
        );
    }

    #[test]
    fn membership_shrink_marks_down_and_keeps_stats() {
        let balancer = ClusterBalancer::new("nodes");
        balancer.update_servers(members(&[("a", "1.1.1.1"), ("b", "2.2.2.2")]));

        let (ip, _) = balancer.balance_by_chunk("9277", "abc_00028").unwrap();
        let served_before: u64 = balancer.stats().iter().map(|s| s.requests).sum();
        assert_eq!(served_before, 1);

        balancer.update_servers(members(&[("a", "1.1.1.1")]));

        let stats = balancer.stats();
        assert_eq!(stats.len(), 2);
        let b = stats.iter().find(|s| s.name == "b").unwrap();
        assert!(b.is_down);
        let a = stats.iter().find(|s| s.name == "a").unwrap();
        assert!(!a.is_down);
        // whoever served the first request keeps its counter
        let survivor = stats.iter().find(|s| s.address == ip).unwrap();
        assert_eq!(survivor.requests, 1);

        let (ip, _) = balancer.balance_by_chunk("9277", "abc_00028").unwrap();
        assert_eq!(ip, "1.1.1.1");
    }

    #[test]
    fn regrow_restores_membership() {
        let balancer = ClusterBalancer::new("nodes");
        balancer.update_servers(members(&[("a", "1.1.1.1")]));
        balancer.update_servers(members(&[("a", "1.1.1.1"), ("b", "2.2.2.2")]));
        let stats = balancer.stats();
        assert!(stats.iter().all(|s| !s.is_down));
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn reset_stats_and_upstream() {
        let balancer = ClusterBalancer::new("nodes");
        balancer.update_servers(members(&[("a", "1.1.1.1")]));
        balancer.balance_by_chunk("9277", "abc_00028").unwrap();

        balancer.reset_stats();
        assert_eq!(balancer.stats()[0].requests, 0);

        balancer.reset_upstream();
        assert!(balancer.stats().is_empty());
        assert_eq!(
            balancer.balance_by_chunk("9277", "abc_00028"),
            Err(BalanceError::Unavailable)
        );
    }
}
