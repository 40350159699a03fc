//! Connection pool.
//!
//! Connections are opened on demand and returned to an idle list when the
//! [`PooledConnection`] guard is dropped. A returned connection is rolled back
//! by its owner first; the pool never hands out a connection with staged
//! writes. At most `max_idle` connections are kept.

use crate::driver::{Connection, Driver};
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use terra_db_core::Result;

struct PoolInner {
    driver: Arc<dyn Driver>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    max_idle: usize,
}

/// Shared pool of connections of one driver.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &self.inner.driver)
            .field("idle", &self.idle_count())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(driver: Arc<dyn Driver>, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                idle: Mutex::new(Vec::new()),
                max_idle,
            }),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    /// Take an idle connection or open a new one.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let idle = self.inner.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                tracing::debug!(storage = self.inner.driver.storage_id(), "opening connection");
                self.inner.driver.connect().await?
            }
        };
        Ok(PooledConnection {
            conn: ManuallyDrop::new(conn),
            pool: Arc::clone(&self.inner),
            discarded: false,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct PooledConnection {
    /// Moved out only in `drop`
    conn: ManuallyDrop<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    discarded: bool,
}

impl PooledConnection {
    /// Close the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.discarded = true;
    }
}

impl Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // SAFETY: `conn` is never touched again after this take.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        if self.discarded {
            return;
        }
        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.max_idle {
            idle.push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;

    #[tokio::test]
    async fn test_connections_are_reused() {
        let driver = MemoryDriver::new("s");
        let pool = ConnectionPool::new(Arc::new(driver.clone()), 1);

        {
            let mut a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            a.next_version().await.unwrap();
        }
        assert_eq!(driver.connect_count(), 2);
        assert_eq!(pool.idle_count(), 1);

        let _c = pool.acquire().await.unwrap();
        assert_eq!(driver.connect_count(), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_discard_skips_idle_list() {
        let driver = MemoryDriver::new("s");
        let pool = ConnectionPool::new(Arc::new(driver.clone()), 4);
        pool.acquire().await.unwrap().discard();
        assert_eq!(pool.idle_count(), 0);

        {
            let kept = pool.acquire().await.unwrap();
            let mut dropped = pool.acquire().await.unwrap();
            dropped.next_version().await.unwrap();
            dropped.discard();
            drop(kept);
        }
        assert_eq!(driver.connect_count(), 3);
        assert_eq!(pool.idle_count(), 1);

        let mut reused = pool.acquire().await.unwrap();
        reused.next_version().await.unwrap();
        assert_eq!(driver.connect_count(), 3);
    }
}
