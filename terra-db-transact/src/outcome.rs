//! Per-instruction write results.

use std::fmt;
use terra_db_core::{CollectionId, Error, Guid, Result, Tuple};

/// What a successful instruction did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutedOp {
    Created,
    Updated,
    Deleted,
    Purged,
    /// Nothing to do (delete/purge of an absent feature)
    Retained,
}

impl fmt::Display for ExecutedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutedOp::Created => "created",
            ExecutedOp::Updated => "updated",
            ExecutedOp::Deleted => "deleted",
            ExecutedOp::Purged => "purged",
            ExecutedOp::Retained => "retained",
        };
        f.write_str(s)
    }
}

/// A successfully executed instruction.
#[derive(Debug, Clone)]
pub struct Written {
    pub op: ExecutedOp,
    pub collection: CollectionId,
    pub feature_id: String,
    /// Resulting tuple; `None` for `Retained` or when results are off
    pub tuple: Option<Tuple>,
    /// Identity of the resulting version; `None` for `Retained`
    pub guid: Option<Guid>,
}

/// Outcome of a write batch, in instruction order.
#[derive(Debug)]
pub struct WriteResult {
    pub results: Vec<Result<Written>>,
}

impl WriteResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Result<Written>> {
        self.results.get(index)
    }

    /// Whether every instruction succeeded.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    pub fn errors(&self) -> impl Iterator<Item = (usize, &Error)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
    }

    pub fn written(&self) -> impl Iterator<Item = &Written> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }
}
