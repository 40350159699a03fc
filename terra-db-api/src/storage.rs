//! Storage handle.

use crate::session::Session;
use std::fmt;
use std::sync::Arc;
use terra_db_connection::{
    ConnectionPool, Driver, InvalidationNotifier, MokaTupleCache, NoCache, TupleCache,
};
use terra_db_core::{Catalog, Error, Result, StorageConfig};

pub(crate) struct StorageInner {
    pub(crate) config: StorageConfig,
    pub(crate) catalog: Catalog,
    pub(crate) pool: ConnectionPool,
    pub(crate) notifier: InvalidationNotifier,
    pub(crate) cache: Arc<dyn TupleCache>,
}

/// One opened storage: configuration, catalog, connection pool and the
/// shared tuple cache. Cheap to clone.
#[derive(Clone)]
pub struct GeoStorage {
    pub(crate) inner: Arc<StorageInner>,
}

impl fmt::Debug for GeoStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoStorage")
            .field("storage_id", &self.inner.config.storage_id)
            .field("pool", &self.inner.pool)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl GeoStorage {
    /// Open a storage over `driver`.
    ///
    /// Fails with `IdentityMismatch` when the driver talks to a storage other
    /// than the configured one.
    pub fn open(config: StorageConfig, driver: Arc<dyn Driver>, catalog: Catalog) -> Result<Self> {
        config.validate()?;
        if driver.storage_id() != &*config.storage_id {
            return Err(Error::IdentityMismatch {
                expected: config.storage_id.to_string(),
                found: driver.storage_id().to_string(),
            });
        }

        let notifier = InvalidationNotifier::new();
        let cache: Arc<dyn TupleCache> = if config.cache_max_entries == 0 {
            Arc::new(NoCache)
        } else {
            Arc::new(MokaTupleCache::with_max_entries(
                config.cache_max_entries,
                &notifier,
            ))
        };
        let pool = ConnectionPool::new(driver, config.pool_max_idle);

        tracing::info!(
            storage_id = %config.storage_id,
            hard_cap = config.hard_cap,
            cache_max_entries = config.cache_max_entries,
            "storage opened"
        );
        Ok(Self {
            inner: Arc::new(StorageInner {
                config,
                catalog,
                pool,
                notifier,
                cache,
            }),
        })
    }

    /// Open a session on a pooled connection.
    pub async fn session(&self) -> Result<Session> {
        let conn = self.inner.pool.acquire().await?;
        Ok(Session::new(self.clone(), conn))
    }

    pub fn storage_id(&self) -> &str {
        &self.inner.config.storage_id
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn cache(&self) -> &Arc<dyn TupleCache> {
        &self.inner.cache
    }
}
