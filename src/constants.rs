pub const HEADER_CLIENT_URI: &str = "X-Client-Uri";
pub const HEADER_CLIENT_ID: &str = "X-Client-Id";
pub const HEADER_CACHE_SERVER: &str = "X-Cache-Server";
pub const HEADER_LOCATION: &str = "X-Location";
pub const HEADER_ERROR: &str = "X-Error";
pub const HEADER_FORWARDED_FOR: &str = "X-Forwarded-For";

pub const MEDIA_PATH_PREFIX: &str = "/videos/media/ts";
pub const CLUSTER_BALANCE_PATH: &str = "/api/balancer/cluster/cache-nodes";
