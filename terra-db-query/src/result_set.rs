//! Lazy, windowed result sets.
//!
//! A [`ResultSet`] owns the address sequence a read statement produced. It
//! orders the sequence on first access and, when filters are configured,
//! validates it incrementally: each round fetches a slightly larger window
//! than asked for, runs the [`FilterChain`], and compacts rejected entries
//! out of the sequence. Validation only ever moves forward.

use crate::builder::BuiltQuery;
use crate::filter::FilterChain;
use crate::handle::ResultHandle;
use crate::request::{ReadRequest, ResultOrder};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use terra_db_core::{Columns, Error, Result, Tuple, TupleAddress};
use tracing::Instrument;

/// Fixed extra entries fetched per validation round.
const VALIDATION_MARGIN: usize = 16;

/// Anything able to load tuples by address for a result set.
#[async_trait]
pub trait TupleSource: Debug + Send + Sync {
    /// Fetch tuples aligned with `addresses`; vanished rows are `None`.
    async fn fetch(&self, addresses: &[TupleAddress], columns: Columns) -> Result<Vec<Option<Tuple>>>;

    /// Feature ids aligned with `addresses`.
    async fn feature_ids(&self, addresses: &[TupleAddress]) -> Result<Vec<Option<String>>>;
}

/// Coverage state of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    /// The sequence is a strict prefix of the true match set
    Incomplete,
    /// The full sequence is known but not yet fully validated
    Partial,
    /// Validation covered the whole sequence
    Complete,
}

#[derive(Debug)]
pub struct ResultSet {
    source: Arc<dyn TupleSource>,
    storage_id: String,
    addresses: Vec<TupleAddress>,
    order: ResultOrder,
    incomplete: bool,
    ordered: bool,
    /// Length of the validated prefix of `addresses`
    validated: usize,
    /// Filtered tuples of the validated prefix, aligned with it
    tuples: Vec<Tuple>,
    filters: FilterChain,
    columns: Columns,
    /// End of the furthest window handed out
    consumed: usize,
}

impl ResultSet {
    /// Wrap the addresses a built query returned.
    ///
    /// The statement over-fetches by one row, so more than the soft limit or
    /// the hard cap means rows were cut off: the sequence is truncated and
    /// the set is incomplete.
    pub fn from_query(
        source: Arc<dyn TupleSource>,
        storage_id: impl Into<String>,
        request: &ReadRequest,
        built: &BuiltQuery,
        mut addresses: Vec<TupleAddress>,
    ) -> Self {
        let keep = built
            .soft_limit_pushed
            .map_or(built.hard_cap, |limit| limit.min(built.hard_cap));
        let incomplete = addresses.len() > keep;
        addresses.truncate(keep);
        let found = addresses.len();
        let filters = request.filters().clone();
        let validated = if filters.is_empty() { found } else { 0 };
        Self {
            source,
            storage_id: storage_id.into(),
            addresses,
            order: request.order(),
            incomplete,
            ordered: request.order() == ResultOrder::Deterministic,
            validated,
            tuples: Vec::new(),
            filters,
            columns: request.columns(),
            consumed: 0,
        }
    }

    /// Resume from a decoded handle: a complete set over the addresses not
    /// yet consumed, in the order they were handed out.
    pub fn from_handle(source: Arc<dyn TupleSource>, handle: ResultHandle, columns: Columns) -> Self {
        let mut addresses = handle.addresses;
        addresses.drain(..handle.resume);
        Self {
            source,
            storage_id: handle.storage_id,
            validated: addresses.len(),
            addresses,
            order: handle.order,
            incomplete: false,
            ordered: true,
            tuples: Vec::new(),
            filters: FilterChain::new(),
            columns,
            consumed: 0,
        }
    }

    pub fn state(&self) -> ResultState {
        if self.incomplete {
            ResultState::Incomplete
        } else if self.validated >= self.addresses.len() {
            ResultState::Complete
        } else {
            ResultState::Partial
        }
    }

    pub fn order(&self) -> ResultOrder {
        self.order
    }

    /// Current length of the sequence. Shrinks as validation drops entries.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn validated_len(&self) -> usize {
        self.validated
    }

    /// Addresses in their current order. Ordering is applied lazily; call
    /// [`ResultSet::window`] first to observe the final order.
    pub fn addresses(&self) -> &[TupleAddress] {
        &self.addresses
    }

    /// Tuples at `[offset, offset + limit)` of the validated sequence.
    ///
    /// Fewer tuples come back at the end of the sequence, or when rows
    /// vanished since the query ran.
    pub async fn window(&mut self, offset: usize, limit: usize) -> Result<Vec<Tuple>> {
        self.ensure_ordered().await?;
        let wanted_end = offset.saturating_add(limit);
        self.validate_to(wanted_end).await?;

        let end = wanted_end.min(self.validated);
        if offset >= end {
            return Ok(Vec::new());
        }
        self.consumed = self.consumed.max(end);

        if !self.filters.is_empty() {
            return Ok(self.tuples[offset..end]
                .iter()
                .map(|t| t.project(&self.columns))
                .collect());
        }
        let fetched = self
            .source
            .fetch(&self.addresses[offset..end], self.columns)
            .await?;
        Ok(fetched.into_iter().flatten().collect())
    }

    /// Encode a continuation handle resuming after the furthest window
    /// consumed so far.
    pub async fn handle(&mut self) -> Result<String> {
        if self.incomplete {
            return Err(Error::illegal_state(
                "result set is incomplete, raise the soft limit or narrow the query",
            ));
        }
        self.ensure_ordered().await?;
        self.validate_to(self.addresses.len()).await?;
        ResultHandle {
            storage_id: self.storage_id.clone(),
            order: self.order,
            resume: self.consumed,
            addresses: self.addresses.clone(),
        }
        .encode()
    }

    async fn ensure_ordered(&mut self) -> Result<()> {
        if self.ordered {
            return Ok(());
        }
        match self.order {
            ResultOrder::Deterministic => {}
            ResultOrder::Version => {
                self.addresses
                    .sort_by(|a, b| b.locator.cmp_position(&a.locator));
            }
            ResultOrder::Id => {
                let ids = self.source.feature_ids(&self.addresses).await?;
                let mut keyed: Vec<(String, TupleAddress)> = self
                    .addresses
                    .iter()
                    .zip(ids)
                    .filter_map(|(address, id)| id.map(|id| (id, *address)))
                    .collect();
                keyed.sort_by(|(id_a, a), (id_b, b)| {
                    id_a.cmp(id_b)
                        .then_with(|| b.locator.cmp_position(&a.locator))
                });
                self.addresses = keyed.into_iter().map(|(_, address)| address).collect();
                if self.filters.is_empty() {
                    self.validated = self.addresses.len();
                }
            }
        }
        self.ordered = true;
        Ok(())
    }

    /// Extend the validated prefix to cover `end` (or the whole sequence).
    async fn validate_to(&mut self, end: usize) -> Result<()> {
        if self.filters.is_empty() {
            return Ok(());
        }
        let columns = if self.filters.needs_payload() {
            Columns::ALL
        } else {
            self.columns
        };

        let span = tracing::debug_span!(
            "result_set_validate",
            from = self.validated,
            to = end,
            rounds = tracing::field::Empty,
            dropped = tracing::field::Empty,
        );
        async {
            let mut rounds = 0usize;
            let mut dropped = 0usize;
            while self.validated < end.min(self.addresses.len()) {
                let missing = end.min(self.addresses.len()) - self.validated;
                let batch = (missing + missing.div_ceil(10) + VALIDATION_MARGIN)
                    .min(self.addresses.len() - self.validated);
                let range = self.validated..self.validated + batch;
                let fetched = self.source.fetch(&self.addresses[range.clone()], columns).await?;

                let mut kept_addresses = Vec::with_capacity(batch);
                for (address, tuple) in self.addresses[range.clone()].iter().zip(fetched) {
                    if let Some(tuple) = tuple.and_then(|t| self.filters.apply(t)) {
                        kept_addresses.push(*address);
                        self.tuples.push(tuple);
                    }
                }
                dropped += batch - kept_addresses.len();
                self.validated += kept_addresses.len();
                self.addresses.splice(range, kept_addresses);
                rounds += 1;
            }
            let span = tracing::Span::current();
            span.record("rounds", rounds);
            span.record("dropped", dropped);
            Ok(())
        }
        .instrument(span)
        .await
    }
}
