//! Configuration file support for degenscore.
//!
//! Loads optional TOML config from `~/.config/degenscore/config.toml`.
//! Every key is optional; CLI flags take precedence over file values.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::analyzer::PartialFailurePolicy;
use crate::scoring::{RankTable, RankTier};

/// Application configuration loaded from TOML file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Explorer API URL (defaults to the Etherscan v2 multichain endpoint)
    pub api_url: Option<String>,
    /// Explorer API key (`ETHERSCAN_API_KEY` also works)
    pub api_key: Option<String>,
    /// Chain id passed to the explorer (default: 8453, Base mainnet)
    pub chain_id: Option<u64>,
    /// Server bind address (e.g., "127.0.0.1:8080")
    pub bind: Option<String>,
    /// Rate limit in requests per minute per IP
    pub rate_limit_rpm: Option<u32>,
    /// Cache TTL in seconds (default: 300)
    pub cache_ttl_seconds: Option<u64>,
    /// Maximum cache entries (default: 10000)
    pub cache_max_entries: Option<u64>,
    /// Seconds between expired-entry sweeps (default: 60)
    pub sweep_interval_seconds: Option<u64>,
    /// Per-attempt explorer timeout in seconds (default: 10)
    pub request_timeout_seconds: Option<u64>,
    /// Extra attempts after a retryable explorer failure (default: 1)
    pub max_retries: Option<u32>,
    /// "strict" or "degrade" (default: strict)
    pub partial_failure: Option<PartialFailurePolicy>,
    /// Allowed CORS origins (None/empty = allow any)
    pub allowed_origins: Option<Vec<String>>,
    /// Custom rank tiers; must include a tier at 0
    pub rank_tiers: Option<Vec<RankTier>>,
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_default()
            .join("degenscore")
            .join("config.toml")
    }

    /// Load config from the default path, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Load config from `path`, falling back to defaults on any error.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// The configured rank table, or the built-in one.
    pub fn rank_table(&self) -> eyre::Result<RankTable> {
        match &self.rank_tiers {
            Some(tiers) => RankTable::new(tiers.clone())
                .map_err(|e| eyre::eyre!("invalid rank_tiers in config: {e}")),
            None => Ok(RankTable::default()),
        }
    }
}
