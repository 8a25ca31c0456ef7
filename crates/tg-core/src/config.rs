//! Engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};

/// Scores at or above this are blocked.
pub const DEFAULT_BLOCK_THRESHOLD: u8 = 60;
/// Scores at or above this (and below the block threshold) are warned.
pub const DEFAULT_WARN_THRESHOLD: u8 = 20;
/// Lifetime of automatic and allow-once entries.
pub const DEFAULT_ALLOW_TTL_MS: u64 = 60 * 1000;
/// Period of the expired-allow cleanup.
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REMOTE_ENDPOINT: &str = "https://www.virustotal.com/api/v3";
pub const DEFAULT_EXTENSION_BASE_URL: &str = "chrome-extension://threatguard/";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("warn_threshold ({warn}) must not exceed block_threshold ({block})")]
    ThresholdOrder { warn: u8, block: u8 },
    #[error("block_threshold ({0}) exceeds 100")]
    ThresholdRange(u8),
    #[error("prune_interval_secs must be positive")]
    ZeroPruneInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub block_threshold: u8,
    pub warn_threshold: u8,
    pub allow_ttl_ms: u64,
    pub prune_interval_secs: u64,
    /// Root URL of the extension's own pages, with trailing slash.
    pub extension_base_url: String,
    /// Base URL of the reputation API.
    pub remote_endpoint: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_threshold: DEFAULT_BLOCK_THRESHOLD,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            allow_ttl_ms: DEFAULT_ALLOW_TTL_MS,
            prune_interval_secs: DEFAULT_PRUNE_INTERVAL_SECS,
            extension_base_url: DEFAULT_EXTENSION_BASE_URL.to_string(),
            remote_endpoint: DEFAULT_REMOTE_ENDPOINT.to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON config, filling absent fields with defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Reject threshold combinations the decision ladder cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warn_threshold > self.block_threshold {
            return Err(ConfigError::ThresholdOrder {
                warn: self.warn_threshold,
                block: self.block_threshold,
            });
        }
        if self.block_threshold > 100 {
            return Err(ConfigError::ThresholdRange(self.block_threshold));
        }
        if self.prune_interval_secs == 0 {
            return Err(ConfigError::ZeroPruneInterval);
        }
        Ok(())
    }
}
