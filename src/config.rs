//! Application configuration
//!
//! Every operational tunable is externally supplied: a `config/default`
//! file overlaid by `AISINGEST__`-prefixed environment variables.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Upstream feed endpoint and the credential set rotated across sessions.
#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub uri: String,
    #[serde(default = "default_feed_port")]
    pub port: u16,
    pub client_id: String,
    pub credentials: Vec<String>,
    /// Optional unfiltered discovery session over a geographic box
    #[serde(default)]
    pub discovery: Option<DiscoveryConfig>,
}

/// Bounding box for the discovery session, WGS84 decimal degrees.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct DiscoveryConfig {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Admission filter thresholds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum known length in meters
    pub min_length: u16,
    /// Inclusive category band; defaults cover cargo and tanker codes
    pub min_category: u8,
    pub max_category: u8,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_length: 100,
            min_category: 70,
            max_category: 89,
        }
    }
}

/// Session pool shape. Both limits come from the upstream provider's
/// per-connection terms, not from this process.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    /// Vessel identifiers one session may subscribe to
    pub session_quota: usize,
    /// Concurrent sessions one credential may back
    pub sessions_per_credential: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session_quota: 50,
            sessions_per_credential: 3,
        }
    }
}

/// Per-session reconnect backoff.
#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub base: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatsConfig {
    /// Emit one snapshot every this many processed frames, process-wide
    pub frame_interval: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            frame_interval: 1000,
        }
    }
}

fn default_feed_port() -> u16 {
    443
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("AISINGEST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("feed.credentials"),
            )
            .build()?;

        config.try_deserialize()
    }
}
