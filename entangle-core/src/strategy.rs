use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Policy selecting between serving the query cache and fetching from the network.
/// The string identifiers are stable and used for serialization.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategy {
    /// Serve the cache if present, even stale; fail with a cache miss otherwise.
    CacheOrThrow,
    /// Serve the cache if present and fresh; fetch otherwise.
    #[default]
    CacheOrFallbackNetwork,
    /// Serve the cache immediately and refresh it in the background.
    CacheAndNetwork,
    /// Always fetch and wait for the result.
    Network,
    /// Fetch and replace the cache wholesale.
    NetworkRecreateCache,
    /// Fetch and return the result without touching any cache.
    NetworkSkipCaching,
}

impl FetchStrategy {
    pub const ALL: [FetchStrategy; 6] = [
        FetchStrategy::CacheOrThrow,
        FetchStrategy::CacheOrFallbackNetwork,
        FetchStrategy::CacheAndNetwork,
        FetchStrategy::Network,
        FetchStrategy::NetworkRecreateCache,
        FetchStrategy::NetworkSkipCaching,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::CacheOrThrow => "cache-or-throw",
            FetchStrategy::CacheOrFallbackNetwork => "cache-or-fallback-network",
            FetchStrategy::CacheAndNetwork => "cache-and-network",
            FetchStrategy::Network => "network",
            FetchStrategy::NetworkRecreateCache => "network-recreate-cache",
            FetchStrategy::NetworkSkipCaching => "network-skip-caching",
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FetchStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FetchStrategy::ALL
            .iter()
            .find(|strategy| strategy.as_str() == s)
            .copied()
            .ok_or_else(|| Error::config_error(format!("Unknown fetch strategy '{}'", s)))
    }
}
