//! Tuple cache and cross-session invalidation.
//!
//! Tuples are immutable per address except for `next_version`, which is set
//! when a head is superseded. Committing sessions publish the addresses they
//! superseded or removed through an [`InvalidationNotifier`]; every cache
//! holds a subscription and drains it before answering a lookup. Each
//! publication also bumps a commit epoch: a tuple fetched before a commit
//! is only stored if no commit was published since its fetch began.

use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use terra_db_core::{Tuple, TupleAddress};
use tokio::sync::broadcast;

/// Event published after a commit.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// These addresses changed and must be refetched
    Invalidate(Arc<[TupleAddress]>),
}

/// Fan-out of [`CacheEvent`]s to every cache of a storage.
#[derive(Debug, Clone)]
pub struct InvalidationNotifier {
    tx: broadcast::Sender<CacheEvent>,
    epoch: Arc<AtomicU64>,
}

impl Default for InvalidationNotifier {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            tx,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl InvalidationNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    /// Number of invalidations published so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Publish invalidated addresses. The epoch moves before the event is
    /// sent.
    pub fn invalidate(&self, addresses: Vec<TupleAddress>) {
        if addresses.is_empty() {
            return;
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let _ = self.tx.send(CacheEvent::Invalidate(addresses.into()));
    }
}

/// Process-wide cache of full tuples keyed by address.
pub trait TupleCache: Debug + Send + Sync {
    fn get(&self, address: &TupleAddress) -> Option<Tuple>;

    /// Commit epoch to read before fetching a tuple that may be stored.
    fn epoch(&self) -> u64;

    /// Store a full tuple (all payload columns) fetched at `epoch`. Dropped
    /// when a commit was published since.
    fn put(&self, tuple: Tuple, epoch: u64);

    fn invalidate(&self, addresses: &[TupleAddress]);
}

/// Cache that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl TupleCache for NoCache {
    fn get(&self, _address: &TupleAddress) -> Option<Tuple> {
        None
    }

    fn epoch(&self) -> u64 {
        0
    }

    fn put(&self, _tuple: Tuple, _epoch: u64) {}

    fn invalidate(&self, _addresses: &[TupleAddress]) {}
}

/// Hit/miss counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct AtomicCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Bounded TinyLFU tuple cache backed by `moka`.
pub struct MokaTupleCache {
    cache: moka::sync::Cache<TupleAddress, Arc<Tuple>>,
    events: Mutex<broadcast::Receiver<CacheEvent>>,
    epoch: Arc<AtomicU64>,
    stats: AtomicCacheStats,
}

impl Debug for MokaTupleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaTupleCache")
            .field("entry_count", &self.cache.entry_count())
            .field("stats", &self.stats())
            .finish()
    }
}

impl MokaTupleCache {
    pub fn with_max_entries(max_entries: u64, notifier: &InvalidationNotifier) -> Self {
        Self {
            cache: moka::sync::Cache::builder().max_capacity(max_entries).build(),
            events: Mutex::new(notifier.subscribe()),
            epoch: Arc::clone(&notifier.epoch),
            stats: AtomicCacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    fn drain_events(&self) {
        self.drain(&mut self.events.lock());
    }

    fn drain(&self, events: &mut broadcast::Receiver<CacheEvent>) {
        loop {
            match events.try_recv() {
                Ok(CacheEvent::Invalidate(addresses)) => self.invalidate(&addresses),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "tuple cache lagged behind invalidations, clearing");
                    self.cache.invalidate_all();
                }
                Err(_) => break,
            }
        }
    }
}

impl TupleCache for MokaTupleCache {
    fn get(&self, address: &TupleAddress) -> Option<Tuple> {
        self.drain_events();
        match self.cache.get(address) {
            Some(tuple) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(tuple.as_ref().clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn put(&self, tuple: Tuple, epoch: u64) {
        // events stay locked until the insert, so a later publication is
        // drained after it
        let mut events = self.events.lock();
        self.drain(&mut events);
        if self.epoch.load(Ordering::Acquire) != epoch {
            tracing::trace!(address = ?tuple.address, "commit since fetch, not caching");
            return;
        }
        self.cache.insert(tuple.address, Arc::new(tuple));
    }

    fn invalidate(&self, addresses: &[TupleAddress]) {
        for address in addresses {
            self.cache.invalidate(address);
        }
        self.stats
            .invalidations
            .fetch_add(addresses.len() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use terra_db_core::{
        Action, CollectionNumber, Feature, MapNumber, Metadata, RowLocator, Version,
    };

    fn tuple(version: i64) -> Tuple {
        let payload = Feature::new("a")
            .with_document(json!({"n": version}))
            .encode(None)
            .unwrap();
        let flags = payload.flags.with_action(Action::Created);
        let address = TupleAddress::new(
            MapNumber(1),
            CollectionNumber(1),
            0,
            RowLocator::new(Version(version), 0, flags),
        );
        let meta = Metadata {
            id: "a".into(),
            created_at: 0,
            updated_at: 0,
            author_ts: 0,
            version: Version(version),
            uid: 0,
            prev_version: None,
            puid: None,
            next_version: None,
            hash: String::new(),
            geo_grid: 0,
            flags,
            app_id: "test".into(),
            author: None,
            feature_type: None,
            change_count: 1,
        };
        Tuple::from_payload(address, meta, &payload)
    }

    #[test]
    fn test_published_invalidation_evicts() {
        let notifier = InvalidationNotifier::new();
        let cache = MokaTupleCache::with_max_entries(100, &notifier);
        let t = tuple(1);
        cache.put(t.clone(), cache.epoch());
        assert_eq!(cache.get(&t.address), Some(t.clone()));

        notifier.invalidate(vec![t.address]);
        assert_eq!(cache.get(&t.address), None);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                invalidations: 1
            }
        );
    }

    #[test]
    fn test_fetch_older_than_a_commit_is_not_stored() {
        let notifier = InvalidationNotifier::new();
        let cache = MokaTupleCache::with_max_entries(100, &notifier);
        let t = tuple(3);

        let fetched_at = cache.epoch();
        notifier.invalidate(vec![t.address]);
        cache.put(t.clone(), fetched_at);
        assert_eq!(cache.get(&t.address), None);

        cache.put(t.clone(), notifier.epoch());
        assert_eq!(cache.get(&t.address), Some(t));
        assert_eq!(notifier.epoch(), 1);
    }

    #[test]
    fn test_no_cache_stores_nothing() {
        let t = tuple(2);
        NoCache.put(t.clone(), NoCache.epoch());
        assert!(NoCache.get(&t.address).is_none());
    }
}
