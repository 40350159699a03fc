//! # Terra DB Query
//!
//! The read path.
//!
//! ```text
//! ReadRequest ──QueryBuilder──▶ ReadStatement ──Connection──▶ address blob
//!                                                                 │
//!              window / handle ◀── ResultSet (order, FilterChain) ◀┘
//! ```
//!
//! Statements only ever return tuple addresses. A [`ResultSet`] loads
//! payloads through a [`TupleSource`] as windows are requested.

pub mod builder;
pub mod filter;
pub mod handle;
pub mod request;
pub mod result_set;

pub use builder::{BuiltQuery, QueryBuilder};
pub use filter::{filter_fn, payload_filter_fn, FilterChain, FnFilter, TupleFilter};
pub use handle::ResultHandle;
pub use request::{
    PropertyQuery, PropertyRef, ReadRequest, ReadRequestBuilder, ResultOrder, SpatialQuery,
    TagQuery,
};
pub use result_set::{ResultSet, ResultState, TupleSource};
pub use terra_db_connection::{CmpOp, MetaColumn};
pub use terra_db_core::{Error, Result};
