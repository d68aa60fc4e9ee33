use serde::{Deserialize, Serialize};
use sockeye::endpoint::IpEndpoint;
use sockeye_timing::Duration;

/// Resolver construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Name servers queried in rotation.
    pub servers: Vec<IpEndpoint>,
    /// Total query attempts across all servers.
    pub attempts: u32,
    /// Per-attempt response timeout.
    pub timeout: Duration,
    /// Cache successful lookups.
    pub positive_cache: bool,
    /// Cache authoritative empty answers.
    pub negative_cache: bool,
    /// Order v4 addresses before v6 in mixed results.
    pub sort_v4_first: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            attempts: 2,
            timeout: Duration::from_secs(5),
            positive_cache: true,
            negative_cache: true,
            sort_v4_first: true,
        }
    }
}
