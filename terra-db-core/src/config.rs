//! Storage configuration.
//!
//! Configuration is plain serde data with defaults for every field, so a
//! partial JSON document is enough. Selected values can be overridden from
//! the environment with [`StorageConfig::with_env_overrides`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Environment variable overriding [`StorageConfig::storage_id`].
pub const ENV_STORAGE_ID: &str = "TERRA_STORAGE_ID";
/// Environment variable overriding [`StorageConfig::hard_cap`].
pub const ENV_HARD_CAP: &str = "TERRA_HARD_CAP";
/// Environment variable overriding [`StorageConfig::pool_max_idle`].
pub const ENV_POOL_MAX_IDLE: &str = "TERRA_POOL_MAX_IDLE";
/// Environment variable overriding [`StorageConfig::cache_max_entries`].
pub const ENV_CACHE_MAX_ENTRIES: &str = "TERRA_CACHE_MAX_ENTRIES";

/// Storage-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Identity of the storage; must match the identity reported by the driver.
    pub storage_id: Arc<str>,
    /// Application id stamped into metadata when a session does not set one.
    pub app_id: Arc<str>,
    /// Ceiling applied to every read query regardless of the soft limit.
    pub hard_cap: usize,
    /// Idle connections kept by the pool.
    pub pool_max_idle: usize,
    /// Tuple cache capacity (entries). 0 disables the cache.
    pub cache_max_entries: u64,
    /// Payload parts at least this large are zstd-compressed. `None` disables compression.
    pub compress_threshold: Option<usize>,
    /// Dotted feature paths excluded from the content hash.
    pub volatile_paths: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_id: Arc::from("terra"),
            app_id: Arc::from("terra"),
            hard_cap: 1_000_000,
            pool_max_idle: 8,
            cache_max_entries: 10_000,
            compress_threshold: Some(4096),
            volatile_paths: vec!["properties.@ns:terra".to_string()],
        }
    }
}

impl StorageConfig {
    pub fn new(storage_id: impl Into<Arc<str>>) -> Self {
        Self {
            storage_id: storage_id.into(),
            ..Default::default()
        }
    }

    /// Parse from a JSON document; missing fields take their defaults.
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let config: StorageConfig = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_app_id(mut self, app_id: impl Into<Arc<str>>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_hard_cap(mut self, hard_cap: usize) -> Self {
        self.hard_cap = hard_cap;
        self
    }

    pub fn with_pool_max_idle(mut self, max_idle: usize) -> Self {
        self.pool_max_idle = max_idle;
        self
    }

    pub fn with_cache_max_entries(mut self, entries: u64) -> Self {
        self.cache_max_entries = entries;
        self
    }

    pub fn with_compress_threshold(mut self, threshold: Option<usize>) -> Self {
        self.compress_threshold = threshold;
        self
    }

    /// Apply `TERRA_*` environment overrides. Empty variables are ignored.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(id) = get(ENV_STORAGE_ID) {
            self.storage_id = Arc::from(id);
        }
        if let Some(cap) = get(ENV_HARD_CAP) {
            self.hard_cap = parse_number(ENV_HARD_CAP, &cap)?;
        }
        if let Some(idle) = get(ENV_POOL_MAX_IDLE) {
            self.pool_max_idle = parse_number(ENV_POOL_MAX_IDLE, &idle)?;
        }
        if let Some(entries) = get(ENV_CACHE_MAX_ENTRIES) {
            self.cache_max_entries = parse_number(ENV_CACHE_MAX_ENTRIES, &entries)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_id.is_empty() {
            return Err(Error::illegal_argument("storageId must not be empty"));
        }
        if self.hard_cap == 0 {
            return Err(Error::illegal_argument("hardCap must be positive"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| Error::illegal_argument(format!("{name}='{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = StorageConfig::from_json(&json!({"storageId": "s1", "hardCap": 50})).unwrap();
        assert_eq!(&*config.storage_id, "s1");
        assert_eq!(config.hard_cap, 50);
        assert_eq!(config.pool_max_idle, StorageConfig::default().pool_max_idle);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [(ENV_HARD_CAP, "12"), (ENV_STORAGE_ID, "")].into();
        let config = StorageConfig::new("s1")
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.hard_cap, 12);
        assert_eq!(&*config.storage_id, "s1");

        let bad: HashMap<&str, &str> = [(ENV_HARD_CAP, "lots")].into();
        let err = StorageConfig::new("s1").with_overrides(|k| bad.get(k).map(|v| v.to_string()));
        assert!(matches!(err, Err(Error::IllegalArgument(_))));
    }

    #[test]
    fn test_rejects_zero_hard_cap() {
        assert!(StorageConfig::from_json(&json!({"hardCap": 0})).is_err());
    }
}
