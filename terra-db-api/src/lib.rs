//! # Terra DB API
//!
//! Entry point of the Terra feature store.
//!
//! ```ignore
//! let storage = GeoStorage::open(config, driver, catalog)?;
//! let mut session = storage.session().await?.with_author("alice");
//!
//! session
//!     .write_batch(&[WriteInstruction::create(&map, &roads, feature)], WriteOptions::default())
//!     .await?;
//! session.commit().await?;
//!
//! let request = ReadRequest::builder(&map).collection(&roads).return_handle(true).build()?;
//! let mut results = session.read(&request).await?;
//! let page = results.window(0, 100).await?;
//! let handle = results.handle().await?;
//! ```
//!
//! A [`GeoStorage`] owns the catalog, the connection pool and the tuple
//! cache. A [`Session`] owns one connection and one open transaction.

mod session;
mod source;
mod storage;

pub use session::Session;
pub use storage::GeoStorage;

pub use terra_db_connection::{CacheStats, Driver, MemoryDriver, TableKind, TupleCache};
pub use terra_db_core::{
    geo_types, Catalog, CollectionConfig, CollectionId, Columns, Error, Feature, Guid, MapId,
    Result, StorageConfig, Tuple, TupleAddress, Version,
};
pub use terra_db_query::{
    filter_fn, payload_filter_fn, CmpOp, FilterChain, MetaColumn, PropertyQuery, PropertyRef,
    ReadRequest, ResultOrder, ResultSet, ResultState, SpatialQuery, TagQuery, TupleFilter,
};
pub use terra_db_transact::{
    ExecutedOp, WriteInstruction, WriteOp, WriteOptions, WriteResult, Written,
};
