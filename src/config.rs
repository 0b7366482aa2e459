//! Store configuration (`modeled.toml`).
//!
//! Every section and key is optional; omitted values take the defaults
//! below. Unknown keys are rejected so typos surface at startup.
//!
//! ```toml
//! [pool]
//! max_size = 8
//! acquire_timeout_ms = 5000
//!
//! [storage]
//! returning = true
//! transactions = true
//!
//! [security]
//! scope_matching = "exact"      # or "hierarchical"
//! snapshot_ttl_secs = 60
//! membership_max_age_secs = 900
//! token_cache_ttl_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::ScopeMatching;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub pool: PoolConfig,
    pub storage: StorageOptions,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum handles checked out at once.
    pub max_size: usize,
    /// How long `acquire` blocks before failing with a pool timeout.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 8,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Backend capabilities the storage adapters may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageOptions {
    /// Read generated values back from the insert itself instead of a
    /// follow-up read.
    pub returning: bool,
    /// Run graph saves inside one transaction.
    pub transactions: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        StorageOptions {
            returning: true,
            transactions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    pub scope_matching: ScopeMatching,
    /// Lifetime of a cached security snapshot.
    pub snapshot_ttl_secs: u64,
    /// Age after which a directory-synchronized group is reported stale.
    pub membership_max_age_secs: u64,
    /// Lifetime of fetched API token secrets.
    pub token_cache_ttl_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            scope_matching: ScopeMatching::Exact,
            snapshot_ttl_secs: 60,
            membership_max_age_secs: 900,
            token_cache_ttl_secs: 300,
        }
    }
}

impl SecurityConfig {
    pub fn snapshot_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.snapshot_ttl_secs as i64)
    }

    pub fn membership_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.membership_max_age_secs as i64)
    }

    pub fn token_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_cache_ttl_secs as i64)
    }
}

impl StoreConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "loaded store configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid {
                field: "pool.max_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "pool.acquire_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        // chrono durations hold milliseconds in an i64
        const MAX_SECS: u64 = (i64::MAX / 1_000) as u64;
        for (field, secs) in [
            ("security.snapshot_ttl_secs", self.security.snapshot_ttl_secs),
            ("security.membership_max_age_secs", self.security.membership_max_age_secs),
            ("security.token_cache_ttl_secs", self.security.token_cache_ttl_secs),
        ] {
            if secs > MAX_SECS {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must be at most {}", MAX_SECS),
                });
            }
        }
        Ok(())
    }
}
