//! Tuple source backing result sets of a session.
//!
//! Tuples come from the shared cache when possible and from the session's
//! connection otherwise, so a result set sees the session's uncommitted
//! writes. Once the session is closed, reads go through a fresh pooled
//! connection. While the session has an open write transaction the cache is
//! bypassed in both directions.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use terra_db_connection::{ConnectionPool, FetchStatement, PooledConnection, TupleCache};
use terra_db_core::{Columns, Result, Tuple, TupleAddress};
use terra_db_query::TupleSource;
use tokio::sync::Mutex;

pub(crate) type SharedConnection = Arc<Mutex<Option<PooledConnection>>>;

#[derive(Debug)]
pub(crate) struct SessionTupleSource {
    pub(crate) conn: SharedConnection,
    pub(crate) pool: ConnectionPool,
    pub(crate) cache: Arc<dyn TupleCache>,
    /// Set while the session holds uncommitted writes
    pub(crate) dirty: Arc<AtomicBool>,
}

impl SessionTupleSource {
    fn use_cache(&self) -> bool {
        !self.dirty.load(Ordering::Acquire)
    }

    async fn fetch_rows(&self, statement: &FetchStatement) -> Result<Vec<Tuple>> {
        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.fetch(statement).await,
            None => {
                drop(guard);
                let mut conn = self.pool.acquire().await?;
                conn.fetch(statement).await
            }
        }
    }

    async fn fetch_ids(&self, addresses: &[TupleAddress]) -> Result<Vec<(TupleAddress, String)>> {
        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.fetch_feature_ids(addresses).await,
            None => {
                drop(guard);
                let mut conn = self.pool.acquire().await?;
                conn.fetch_feature_ids(addresses).await
            }
        }
    }
}

#[async_trait]
impl TupleSource for SessionTupleSource {
    async fn fetch(&self, addresses: &[TupleAddress], columns: Columns) -> Result<Vec<Option<Tuple>>> {
        let use_cache = self.use_cache();
        let mut out: Vec<Option<Tuple>> = vec![None; addresses.len()];
        let mut missing = Vec::new();
        for (slot, address) in out.iter_mut().zip(addresses) {
            match use_cache.then(|| self.cache.get(address)).flatten() {
                Some(tuple) => *slot = Some(tuple.project(&columns)),
                None => missing.push(*address),
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        // only full tuples are cached
        let fetch_columns = if use_cache { Columns::ALL } else { columns };
        let epoch = self.cache.epoch();
        let rows = self
            .fetch_rows(&FetchStatement::new(missing, fetch_columns))
            .await?;
        let mut by_address: FxHashMap<TupleAddress, Tuple> =
            rows.into_iter().map(|t| (t.address, t)).collect();

        for (slot, address) in out.iter_mut().zip(addresses) {
            if slot.is_some() {
                continue;
            }
            if let Some(tuple) = by_address.remove(address) {
                let projected = tuple.project(&columns);
                if use_cache {
                    self.cache.put(tuple, epoch);
                }
                *slot = Some(projected);
            }
        }
        Ok(out)
    }

    async fn feature_ids(&self, addresses: &[TupleAddress]) -> Result<Vec<Option<String>>> {
        let use_cache = self.use_cache();
        let mut out: Vec<Option<String>> = vec![None; addresses.len()];
        let mut missing = Vec::new();
        for (slot, address) in out.iter_mut().zip(addresses) {
            match use_cache.then(|| self.cache.get(address)).flatten() {
                Some(tuple) => *slot = Some(tuple.meta.id),
                None => missing.push(*address),
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        let ids: FxHashMap<TupleAddress, String> =
            self.fetch_ids(&missing).await?.into_iter().collect();
        for (slot, address) in out.iter_mut().zip(addresses) {
            if slot.is_none() {
                *slot = ids.get(address).cloned();
            }
        }
        Ok(out)
    }
}
