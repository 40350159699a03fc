//! Client-side tuple filters.
//!
//! A [`FilterChain`] runs its filters last-registered-first. Each filter
//! returns the (possibly transformed) tuple or `None` to drop it; the chain
//! stops at the first drop. Filters are process-local and never serialized.

use std::fmt;
use std::sync::Arc;
use terra_db_core::Tuple;

/// One predicate/transformer over tuples.
pub trait TupleFilter: Send + Sync {
    fn filter(&self, tuple: Tuple) -> Option<Tuple>;

    /// Whether the filter reads feature, geometry or tags. Metadata-only
    /// filters run on tuples fetched without payload.
    fn needs_payload(&self) -> bool {
        false
    }
}

/// Closure adapter, see [`filter_fn`] and [`payload_filter_fn`].
pub struct FnFilter<F> {
    f: F,
    payload: bool,
}

impl<F> TupleFilter for FnFilter<F>
where
    F: Fn(Tuple) -> Option<Tuple> + Send + Sync,
{
    fn filter(&self, tuple: Tuple) -> Option<Tuple> {
        (self.f)(tuple)
    }

    fn needs_payload(&self) -> bool {
        self.payload
    }
}

/// A metadata-only filter from a closure.
pub fn filter_fn<F>(f: F) -> FnFilter<F>
where
    F: Fn(Tuple) -> Option<Tuple> + Send + Sync,
{
    FnFilter { f, payload: false }
}

/// A filter from a closure that inspects the payload.
pub fn payload_filter_fn<F>(f: F) -> FnFilter<F>
where
    F: Fn(Tuple) -> Option<Tuple> + Send + Sync,
{
    FnFilter { f, payload: true }
}

/// Ordered list of filters, applied LIFO.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn TupleFilter>>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .field("needs_payload", &self.needs_payload())
            .finish()
    }
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: impl TupleFilter + 'static) {
        self.filters.push(Arc::new(filter));
    }

    pub fn with(mut self, filter: impl TupleFilter + 'static) -> Self {
        self.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn needs_payload(&self) -> bool {
        self.filters.iter().any(|f| f.needs_payload())
    }

    pub fn apply(&self, tuple: Tuple) -> Option<Tuple> {
        self.filters
            .iter()
            .rev()
            .try_fold(tuple, |tuple, filter| filter.filter(tuple))
    }
}
