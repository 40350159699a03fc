//! Per-session write state.

use std::sync::Arc;
use terra_db_connection::Connection;
use terra_db_core::{Error, Result, StorageConfig, TupleAddress, Version};

/// Static inputs of metadata composition.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub storage_id: Arc<str>,
    pub app_id: Arc<str>,
    pub author: Option<Arc<str>>,
    pub compress_threshold: Option<usize>,
    pub volatile_paths: Arc<[String]>,
}

impl WriteContext {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            storage_id: Arc::clone(&config.storage_id),
            app_id: Arc::clone(&config.app_id),
            author: None,
            compress_threshold: config.compress_threshold,
            volatile_paths: config.volatile_paths.clone().into(),
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<Arc<str>>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<Arc<str>>) -> Self {
        self.author = Some(author.into());
        self
    }
}

/// Transaction bookkeeping of one session.
///
/// The version is allocated on the first write of a transaction and shared
/// by every mutation in it. The uid counter spans the whole session.
#[derive(Debug, Default)]
pub struct TxnState {
    version: Option<Version>,
    next_uid: i32,
    invalidated: Vec<TupleAddress>,
}

impl TxnState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of the open transaction, allocating it if needed.
    pub async fn version(&mut self, conn: &mut dyn Connection) -> Result<Version> {
        if let Some(v) = self.version {
            return Ok(v);
        }
        let v = conn.next_version().await?;
        tracing::debug!(version = v.0, "transaction version allocated");
        self.version = Some(v);
        Ok(v)
    }

    pub fn current_version(&self) -> Option<Version> {
        self.version
    }

    pub fn next_uid(&mut self) -> Result<i32> {
        let uid = self.next_uid;
        self.next_uid = uid
            .checked_add(1)
            .ok_or_else(|| Error::illegal_state("session uid counter exhausted"))?;
        Ok(uid)
    }

    /// Record addresses whose cached copies become stale on commit.
    pub fn record_invalidated(&mut self, addresses: impl IntoIterator<Item = TupleAddress>) {
        self.invalidated.extend(addresses);
    }

    /// Close the transaction after a commit, returning the addresses to invalidate.
    pub fn finish(&mut self) -> Vec<TupleAddress> {
        self.version = None;
        std::mem::take(&mut self.invalidated)
    }

    /// Close the transaction after a rollback.
    pub fn abort(&mut self) {
        self.version = None;
        self.invalidated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_db_connection::{Driver, MemoryDriver};

    #[tokio::test]
    async fn test_version_is_lazy_and_per_transaction() {
        let driver = MemoryDriver::new("s");
        let mut conn = driver.connect().await.unwrap();
        let mut txn = TxnState::new();
        assert_eq!(txn.current_version(), None);

        let v1 = txn.version(conn.as_mut()).await.unwrap();
        assert_eq!(txn.version(conn.as_mut()).await.unwrap(), v1);
        txn.finish();
        let v2 = txn.version(conn.as_mut()).await.unwrap();
        assert!(v2 > v1);
    }

    #[test]
    fn test_uid_survives_transactions() {
        let mut txn = TxnState::new();
        assert_eq!(txn.next_uid().unwrap(), 0);
        txn.abort();
        assert_eq!(txn.next_uid().unwrap(), 1);
    }
}
