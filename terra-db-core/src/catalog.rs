//! Map and collection routing.
//!
//! A storage hosts maps; a map hosts collections. Clients address both by
//! string id, tuple addresses carry the numeric forms. Routing to an absent
//! map or collection is [`Error::NotFound`].

use crate::error::{Error, Result};
use crate::ids::{CollectionNumber, MapNumber, Partition};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

/// String id of a map.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct MapId(pub Arc<str>);

/// String id of a collection.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct CollectionId(pub Arc<str>);

impl MapId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl CollectionId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-collection storage behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Keep every previous state in the history table.
    pub history: bool,
    /// Drop deleted features directly instead of keeping a deleted-shadow row.
    pub auto_purge: bool,
    /// Number of physical partitions (>= 1).
    pub partition_count: u16,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            history: true,
            auto_purge: false,
            partition_count: 1,
        }
    }
}

impl CollectionConfig {
    pub fn with_history(mut self, history: bool) -> Self {
        self.history = history;
        self
    }

    pub fn with_auto_purge(mut self, auto_purge: bool) -> Self {
        self.auto_purge = auto_purge;
        self
    }

    pub fn with_partitions(mut self, partition_count: u16) -> Self {
        self.partition_count = partition_count;
        self
    }

    /// `xxh64(featureId) mod partitionCount`.
    pub fn partition_of(&self, feature_id: &str) -> Partition {
        partition_of(feature_id, self.partition_count)
    }
}

/// `xxh64(featureId) mod partitionCount`. A count of 0 is treated as 1.
pub fn partition_of(feature_id: &str, partition_count: u16) -> Partition {
    let count = u64::from(partition_count.max(1));
    (xxh64(feature_id.as_bytes(), 0) % count) as Partition
}

/// A fully resolved collection: both id forms plus its config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRef {
    pub map_id: MapId,
    pub map: MapNumber,
    pub id: CollectionId,
    pub number: CollectionNumber,
    pub config: CollectionConfig,
}

impl CollectionRef {
    /// Base name of the collection's physical tables.
    pub fn table_base(&self) -> String {
        format!("{}.{}", self.map_id, self.id)
    }

    pub fn partition_of(&self, feature_id: &str) -> Partition {
        self.config.partition_of(feature_id)
    }
}

#[derive(Debug, Clone)]
struct MapEntry {
    number: MapNumber,
    collections: FxHashMap<CollectionId, (CollectionNumber, CollectionConfig)>,
}

/// Registry of maps and collections of one storage.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    maps: FxHashMap<MapId, MapEntry>,
    next_map: u32,
    next_collection: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a map, returning its number. Idempotent.
    pub fn register_map(&mut self, map_id: &MapId) -> MapNumber {
        if let Some(entry) = self.maps.get(map_id) {
            return entry.number;
        }
        self.next_map += 1;
        let number = MapNumber(self.next_map);
        self.maps.insert(
            map_id.clone(),
            MapEntry {
                number,
                collections: FxHashMap::default(),
            },
        );
        number
    }

    /// Register (or reconfigure) a collection inside a map.
    ///
    /// The map is registered on demand. Changing the partition count of an
    /// existing collection is rejected since stored addresses depend on it.
    pub fn register_collection(
        &mut self,
        map_id: &MapId,
        id: &CollectionId,
        config: CollectionConfig,
    ) -> Result<CollectionRef> {
        if config.partition_count == 0 {
            return Err(Error::illegal_argument(format!(
                "collection '{id}' needs at least one partition"
            )));
        }
        let map = self.register_map(map_id);
        let next_collection = self.next_collection + 1;
        let entry = self
            .maps
            .get_mut(map_id)
            .ok_or_else(|| Error::not_found(format!("map '{map_id}'")))?;

        let number = match entry.collections.get_mut(id) {
            Some((number, existing)) => {
                if existing.partition_count != config.partition_count {
                    return Err(Error::illegal_state(format!(
                        "collection '{id}' already has {} partitions",
                        existing.partition_count
                    )));
                }
                *existing = config;
                *number
            }
            None => {
                let number = CollectionNumber(next_collection);
                entry.collections.insert(id.clone(), (number, config));
                self.next_collection = next_collection;
                number
            }
        };

        Ok(CollectionRef {
            map_id: map_id.clone(),
            map,
            id: id.clone(),
            number,
            config,
        })
    }

    /// Resolve a collection by string ids.
    pub fn resolve(&self, map_id: &MapId, id: &CollectionId) -> Result<CollectionRef> {
        let entry = self
            .maps
            .get(map_id)
            .ok_or_else(|| Error::not_found(format!("map '{map_id}'")))?;
        let (number, config) = entry
            .collections
            .get(id)
            .ok_or_else(|| Error::not_found(format!("collection '{id}' in map '{map_id}'")))?;
        Ok(CollectionRef {
            map_id: map_id.clone(),
            map: entry.number,
            id: id.clone(),
            number: *number,
            config: *config,
        })
    }

    /// Resolve a collection by the numbers carried in a tuple address.
    pub fn resolve_numbers(&self, map: MapNumber, number: CollectionNumber) -> Result<CollectionRef> {
        for (map_id, entry) in &self.maps {
            if entry.number != map {
                continue;
            }
            for (id, (n, config)) in &entry.collections {
                if *n == number {
                    return Ok(CollectionRef {
                        map_id: map_id.clone(),
                        map,
                        id: id.clone(),
                        number,
                        config: *config,
                    });
                }
            }
        }
        Err(Error::not_found(format!(
            "collection #{} in map #{}",
            number.0, map.0
        )))
    }
}
