//! Sessions.
//!
//! A [`Session`] owns one pooled connection and therefore one open
//! transaction at a time. Writes stay private to the session until
//! [`Session::commit`]; reads issued through the session see them.

use crate::source::{SessionTupleSource, SharedConnection};
use crate::storage::GeoStorage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use terra_db_connection::PooledConnection;
use terra_db_core::{Columns, Error, Result};
use terra_db_query::{QueryBuilder, ReadRequest, ResultHandle, ResultSet, TupleSource};
use terra_db_transact::{
    write_batch, TxnState, WriteContext, WriteInstruction, WriteOptions, WriteResult,
};
use tokio::sync::Mutex;
use tracing::Instrument;

pub struct Session {
    storage: GeoStorage,
    conn: SharedConnection,
    dirty: Arc<AtomicBool>,
    txn: TxnState,
    ctx: WriteContext,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("storage_id", &self.storage.storage_id())
            .field("txn", &self.txn)
            .field("author", &self.ctx.author)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(storage: GeoStorage, conn: PooledConnection) -> Self {
        let ctx = WriteContext::from_config(storage.config());
        Self {
            storage,
            conn: Arc::new(Mutex::new(Some(conn))),
            dirty: Arc::new(AtomicBool::new(false)),
            txn: TxnState::new(),
            ctx,
        }
    }

    /// Author recorded on every tuple this session writes.
    pub fn with_author(mut self, author: impl Into<Arc<str>>) -> Self {
        self.ctx.author = Some(author.into());
        self
    }

    /// Application id recorded on every tuple this session writes.
    pub fn with_app_id(mut self, app_id: impl Into<Arc<str>>) -> Self {
        self.ctx.app_id = app_id.into();
        self
    }

    pub fn storage(&self) -> &GeoStorage {
        &self.storage
    }

    /// Whether the open transaction holds uncommitted writes.
    pub fn has_pending_writes(&self) -> bool {
        self.txn.current_version().is_some()
    }

    /// Execute a write batch inside the open transaction.
    pub async fn write_batch(
        &mut self,
        instructions: &[WriteInstruction],
        opts: WriteOptions,
    ) -> Result<WriteResult> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let result = write_batch(
            &mut **conn,
            self.storage.catalog(),
            &self.ctx,
            &mut self.txn,
            instructions,
            opts,
        )
        .await;
        self.dirty
            .store(self.txn.current_version().is_some(), Ordering::Release);
        result
    }

    /// Run a read. Only addresses are loaded here; tuples are fetched as
    /// windows of the returned [`ResultSet`] are requested.
    pub async fn read(&self, request: &ReadRequest) -> Result<ResultSet> {
        let config = self.storage.config();
        let span = tracing::info_span!(
            "read_query",
            collections = request.collections().len(),
            order = ?request.order(),
            addresses = tracing::field::Empty,
            state = tracing::field::Empty,
        );
        async {
            let built = QueryBuilder::new(self.storage.catalog(), &config.storage_id, config.hard_cap)
                .build(request)?;
            let addresses = {
                let mut guard = self.conn.lock().await;
                let conn = guard.as_mut().ok_or_else(closed)?;
                built.execute(&mut **conn).await?
            };
            let span = tracing::Span::current();
            span.record("addresses", addresses.len());

            let result = ResultSet::from_query(
                self.source(),
                config.storage_id.to_string(),
                request,
                &built,
                addresses,
            );
            span.record("state", tracing::field::debug(result.state()));
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Resume a result set from a continuation handle.
    pub async fn read_handle(&self, handle: &str) -> Result<ResultSet> {
        let handle = ResultHandle::decode(handle)?;
        if handle.storage_id != self.storage.storage_id() {
            return Err(Error::illegal_argument(format!(
                "handle belongs to storage '{}', not '{}'",
                handle.storage_id,
                self.storage.storage_id()
            )));
        }
        tracing::debug!(
            remaining = handle.addresses.len() - handle.resume,
            order = ?handle.order,
            "resuming from handle"
        );
        Ok(ResultSet::from_handle(self.source(), handle, Columns::ALL))
    }

    /// Commit the open transaction and invalidate cached copies of every
    /// tuple it superseded.
    pub async fn commit(&mut self) -> Result<()> {
        let span = tracing::info_span!(
            "session_commit",
            version = self.txn.current_version().map(|v| v.0),
            invalidated = tracing::field::Empty,
        );
        async {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or_else(closed)?;
            conn.commit().await?;
            let invalidated = self.txn.finish();
            self.dirty.store(false, Ordering::Release);
            tracing::Span::current().record("invalidated", invalidated.len());
            if !invalidated.is_empty() {
                self.storage.inner.notifier.invalidate(invalidated);
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Discard the open transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        conn.rollback().await?;
        self.txn.abort();
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Roll back any open transaction and return the connection to the pool.
    pub async fn close(mut self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            conn.rollback().await?;
        }
        self.txn.abort();
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn source(&self) -> Arc<dyn TupleSource> {
        Arc::new(SessionTupleSource {
            conn: Arc::clone(&self.conn),
            pool: self.storage.pool().clone(),
            cache: Arc::clone(self.storage.cache()),
            dirty: Arc::clone(&self.dirty),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A connection with staged writes must not go back to the pool.
        if let Ok(mut guard) = self.conn.try_lock() {
            if let Some(conn) = guard.take() {
                if self.txn.current_version().is_some() {
                    tracing::debug!("session dropped with pending writes, discarding connection");
                    conn.discard();
                }
            }
        }
    }
}

fn closed() -> Error {
    Error::illegal_state("session is closed")
}
