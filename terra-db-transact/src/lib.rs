//! # Terra DB Transact
//!
//! The versioned write path.
//!
//! This crate provides:
//! - [`WriteInstruction`]s: create, update, upsert, delete and purge, optionally
//!   conditional on an expected [`Guid`](terra_db_core::Guid)
//! - [`write_batch`]: batching, optimistic concurrency, history and
//!   deleted-shadow maintenance
//! - [`TxnState`]: lazy per-transaction version and the session uid counter
//!
//! ## Lifecycle
//!
//! ```text
//!            CREATE/UPSERT              UPDATE/UPSERT
//!   (none) ───────────────▶ head ───────────────────────▶ head (old → history)
//!                            │
//!                            │ DELETE                         PURGE
//!                            └───────▶ deleted shadow ─────────────▶ (none)
//! ```

mod batch;
pub mod engine;
pub mod instruction;
pub mod outcome;
pub mod txn;

pub use engine::write_batch;
pub use instruction::{WriteInstruction, WriteOp, WriteOptions};
pub use outcome::{ExecutedOp, WriteResult, Written};
pub use terra_db_core::{Error, Result};
pub use txn::{TxnState, WriteContext};
