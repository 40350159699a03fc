//! # Terra DB Connection
//!
//! Everything between the engines and a relational server:
//!
//! - `statement`: table naming, write batches, lookups, read plans and fetches
//! - `driver`: the async [`Driver`]/[`Connection`] seam
//! - `memory`: an in-memory engine implementing the seam
//! - `pool`: connection pooling
//! - `cache`: the tuple cache and commit-time invalidation fan-out

pub mod cache;
pub mod driver;
pub mod memory;
pub mod pool;
pub mod statement;

pub use cache::{CacheEvent, CacheStats, InvalidationNotifier, MokaTupleCache, NoCache, TupleCache};
pub use driver::{Connection, Driver};
pub use memory::{MemoryConnection, MemoryDriver};
pub use pool::{ConnectionPool, PooledConnection};
pub use statement::{
    table_name, CmpOp, FetchStatement, LookupStatement, MetaColumn, Predicate, ReadPlan,
    ReadStatement, RowMutation, RowOutcome, SqlParam, StatementKind, SubSelect, TableBatch,
    TableKind,
};
