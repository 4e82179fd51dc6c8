use std::env;
use std::time::Duration;

use crate::error::TrackerError;

/// Runtime configuration, env-keyed. `.env` is honored via dotenv.
#[derive(Debug, Clone)]
pub struct Config {
    pub stream: StreamConfig,
    pub rpc: RpcConfig,
    pub database_path: String,
    pub checkpoint_path: String,
    pub monitoring: MonitoringConfig,
    pub enrichment: EnrichmentConfig,
    /// Wallets to track at startup, comma separated in `TRACKED_WALLETS`.
    pub tracked_wallets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint: String,
    pub x_token: Option<String>,
    /// Slots between checkpoint file saves.
    pub checkpoint_save_interval: u64,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Per-session lifetime. A session that sees no sell signal within this
    /// window times out.
    pub max_duration: Duration,
    pub sample_interval: Duration,
    /// Consecutive sampler failures before the session is forced out.
    pub max_sampler_errors: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(60),
            sample_interval: Duration::from_secs(1),
            max_sampler_errors: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub creator_history_api_url: Option<String>,
    pub metadata_api_key: Option<String>,
    /// Pause before querying the creator-history API, letting it index the
    /// new mint first.
    pub creator_count_delay: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, TrackerError> {
        let stream = StreamConfig {
            endpoint: require("STREAM_URL")?,
            x_token: env::var("STREAM_TOKEN").ok().filter(|t| !t.is_empty()),
            checkpoint_save_interval: parse_or("CHECKPOINT_SAVE_INTERVAL", 1000),
        };

        let rpc = RpcConfig {
            endpoint: require("SOLANA_RPC_URL")?,
            timeout: Duration::from_secs(parse_or("RPC_TIMEOUT_SECS", 10)),
        };

        let monitoring = MonitoringConfig {
            max_duration: Duration::from_secs(parse_or("POOL_MONITORING_MAX_DURATION", 60)),
            sample_interval: Duration::from_millis(parse_or("POOL_SAMPLE_INTERVAL_MS", 1000)),
            max_sampler_errors: parse_or("POOL_MAX_SAMPLER_ERRORS", 5),
        };

        let enrichment = EnrichmentConfig {
            creator_history_api_url: env::var("CREATOR_HISTORY_API_URL").ok(),
            metadata_api_key: env::var("METADATA_API_KEY").ok(),
            creator_count_delay: Duration::from_secs(parse_or("CREATOR_COUNT_DELAY_SECS", 45)),
        };

        let tracked_wallets = env::var("TRACKED_WALLETS")
            .unwrap_or_default()
            .split(',')
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();

        Ok(Self {
            stream,
            rpc,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "data/tracker.db".to_string()),
            checkpoint_path: env::var("CHECKPOINT_PATH")
                .unwrap_or_else(|_| "data/checkpoint.json".to_string()),
            monitoring,
            enrichment,
            tracked_wallets,
        })
    }
}

fn require(key: &'static str) -> Result<String, TrackerError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(TrackerError::ConfigMissing(key))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
