//! Driver boundary.
//!
//! A [`Driver`] opens [`Connection`]s to one storage. A connection is one
//! database session with exactly one open transaction at a time; writes
//! become visible to other connections on [`Connection::commit`].
//!
//! All methods are async: they are the only I/O seam of the store.

use crate::statement::{FetchStatement, LookupStatement, ReadStatement, RowOutcome, TableBatch};
use async_trait::async_trait;
use std::fmt::Debug;
use terra_db_core::{Columns, Result, Tuple, TupleAddress, Version};

/// Factory of connections to one storage.
#[async_trait]
pub trait Driver: Debug + Send + Sync {
    /// Identity of the storage this driver talks to.
    fn storage_id(&self) -> &str;

    /// Open a new connection with a fresh transaction.
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// One database session.
#[async_trait]
pub trait Connection: Debug + Send + Sync {
    /// Allocate the next transaction version from the storage sequence.
    async fn next_version(&mut self) -> Result<Version>;

    /// Current rows of `statement.ids` in one table partition, full payload.
    async fn lookup(&mut self, statement: &LookupStatement) -> Result<Vec<Tuple>>;

    /// Execute a homogeneous batch. Returns one outcome per row, in row order.
    async fn execute_batch(&mut self, batch: &TableBatch) -> Result<Vec<RowOutcome>>;

    /// Run a read query; returns the zstd-compressed address blob.
    async fn query_addresses(&mut self, statement: &ReadStatement) -> Result<Vec<u8>>;

    /// Fetch tuples by address, projected to `statement.columns`.
    ///
    /// Addresses that no longer resolve are silently omitted; the order of
    /// the returned tuples is unspecified.
    async fn fetch(&mut self, statement: &FetchStatement) -> Result<Vec<Tuple>>;

    /// Feature id of each resolvable address.
    async fn fetch_feature_ids(
        &mut self,
        addresses: &[TupleAddress],
    ) -> Result<Vec<(TupleAddress, String)>> {
        let statement = FetchStatement::new(addresses.to_vec(), Columns::METADATA_ONLY);
        let tuples = self.fetch(&statement).await?;
        Ok(tuples.into_iter().map(|t| (t.address, t.meta.id)).collect())
    }

    /// Make all writes of the open transaction visible and start a new one.
    async fn commit(&mut self) -> Result<()>;

    /// Undo all writes of the open transaction and start a new one.
    async fn rollback(&mut self) -> Result<()>;
}
