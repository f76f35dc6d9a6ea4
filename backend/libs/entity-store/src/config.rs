//! Store and repository settings

use db_pool::env_utils::{parse_env_bool, parse_env_millis, parse_env_secs, parse_env_with_default};
use db_pool::DbConfig;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50_000;

/// Per-repository behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySettings {
    pub cache_enabled: bool,
    /// Sliding expiration of cached reads
    pub cache_duration: Duration,
    /// Deadline for each single-statement operation attempt
    pub query_timeout: Duration,
    /// Deadline for a whole bulk insert or bulk update
    pub bulk_timeout: Duration,
    /// Rows per bulk batch
    pub max_batch_size: usize,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_duration: DEFAULT_CACHE_DURATION,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            bulk_timeout: DEFAULT_BULK_TIMEOUT,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl RepositorySettings {
    pub fn from_env() -> Self {
        Self {
            cache_enabled: parse_env_bool("STORE_CACHE_ENABLED", true),
            cache_duration: parse_env_secs("STORE_CACHE_DURATION_SECS", DEFAULT_CACHE_DURATION),
            query_timeout: parse_env_millis("STORE_QUERY_TIMEOUT_MS", DEFAULT_QUERY_TIMEOUT),
            bulk_timeout: parse_env_secs("STORE_BULK_TIMEOUT_SECS", DEFAULT_BULK_TIMEOUT),
            max_batch_size: parse_env_with_default("STORE_MAX_BATCH_SIZE", DEFAULT_MAX_BATCH_SIZE)
                .max(1),
        }
    }
}

/// Connection and repository settings for an [`EntityStore`](crate::EntityStore)
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db: DbConfig,
    pub repository: RepositorySettings,
}

impl StoreConfig {
    pub fn new(db: DbConfig) -> Self {
        Self {
            db,
            repository: RepositorySettings::default(),
        }
    }

    pub fn from_env(service_name: &str) -> Result<Self, String> {
        Ok(Self {
            db: DbConfig::from_env(service_name)?,
            repository: RepositorySettings::from_env(),
        })
    }

    pub fn log_config(&self) {
        self.db.log_config();
        info!(
            "Entity Store Configuration: cache_enabled={}, cache_duration={}s, query_timeout={}ms, bulk_timeout={}s, max_batch_size={}",
            self.repository.cache_enabled,
            self.repository.cache_duration.as_secs(),
            self.repository.query_timeout.as_millis(),
            self.repository.bulk_timeout.as_secs(),
            self.repository.max_batch_size
        );
    }
}
