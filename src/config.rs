//! Configuration management for Tollbooth.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TollboothError};
use crate::http::FailurePolicy;
use crate::ratelimit::{Quota, Rate, TimeWindow};
use crate::store::RedisStoreConfig;

/// Prefix for environment variable overrides, e.g.
/// `TOLLBOOTH__RATE_LIMITING__BURST=5`.
const ENV_PREFIX: &str = "TOLLBOOTH";

/// Main configuration for the Tollbooth demo servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollboothConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
}

/// Listen addresses for the demo servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server limited with the configured quota, keyed by client address
    #[serde(default = "default_addr")]
    pub default_addr: SocketAddr,

    /// Server keyed by API key header with a JSON rejection body
    #[serde(default = "default_custom_addr")]
    pub custom_addr: SocketAddr,

    /// Server backed by the Redis store
    #[serde(default = "default_redis_addr")]
    pub redis_addr: SocketAddr,

    /// Server limiting a single route
    #[serde(default = "default_per_route_addr")]
    pub per_route_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_addr: default_addr(),
            custom_addr: default_custom_addr(),
            redis_addr: default_redis_addr(),
            per_route_addr: default_per_route_addr(),
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_custom_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_redis_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8082))
}

fn default_per_route_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8083))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Tokens added per unit of time
    #[serde(default = "default_requests_per_unit")]
    pub requests_per_unit: u64,

    /// The time unit
    #[serde(default = "default_unit")]
    pub unit: TimeWindow,

    /// Bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// What to do when the store cannot be reached
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Where limiter state lives
    #[serde(default)]
    pub store: StoreSettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_unit: default_requests_per_unit(),
            unit: default_unit(),
            burst: default_burst(),
            failure_policy: FailurePolicy::default(),
            store: StoreSettings::default(),
        }
    }
}

impl RateLimitSettings {
    /// The quota described by these settings.
    pub fn quota(&self) -> Quota {
        Quota::new(Rate::per(self.requests_per_unit, self.unit), self.burst)
    }
}

fn default_requests_per_unit() -> u64 {
    1
}

fn default_unit() -> TimeWindow {
    TimeWindow::Second
}

fn default_burst() -> u32 {
    1
}

/// Limiter store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreSettings {
    /// In-process store
    Memory {
        /// How often idle limiters are evicted; 0 disables eviction
        #[serde(default = "default_sweep_interval")]
        sweep_interval_secs: u64,
    },
    /// Shared Redis store
    Redis(RedisStoreConfig),
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::Memory {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl TollboothConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollboothError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from defaults, an optional file, and
    /// `TOLLBOOTH__`-prefixed environment variables, in increasing priority.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollboothError::Config(format!("Failed to load configuration: {}", e)))
    }
}
