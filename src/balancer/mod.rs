use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;

pub mod cluster;

pub use cluster::{ClusterBalancer, ServerStats, UpstreamServer};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BalanceError {
    #[error("could not get server because of invalid chunk name")]
    UnparsableChunk,
    #[error("rolled server is down now")]
    ServerUnavailable,
    /// Snapshot lock busy or no live servers; callers fall back.
    #[error("upstream snapshot is unavailable")]
    Unavailable,
}

/// One pool of upstream cache servers.
pub trait Balancer: Send + Sync {
    /// Deterministically maps a chunk onto a live server. `prefix` is the
    /// decimal title or serie id, concatenated in front of the numeric key
    /// extracted from `chunkname`.
    fn balance_by_chunk(
        &self,
        prefix: &str,
        chunkname: &str,
    ) -> Result<(String, Arc<UpstreamServer>), BalanceError>;

    /// Authoritative membership replacement: servers missing from the new
    /// set are marked down but keep their stats; new ones are added.
    fn update_servers(&self, servers: HashMap<String, IpAddr>);

    fn stats(&self) -> Vec<ServerStats>;
    fn reset_stats(&self);
    fn reset_upstream(&self);
    fn cluster_name(&self) -> &'static str;
}
