//! Shared harness for terra-db-api integration tests.

// Not every test crate uses every helper.
#![allow(dead_code)]

pub mod span_capture;

use serde_json::json;
use std::sync::Arc;
use terra_db_api::geo_types::{point, Geometry};
use terra_db_api::{
    Catalog, CollectionConfig, CollectionId, Feature, GeoStorage, MapId, MemoryDriver, ResultSet,
    Session, StorageConfig, Tuple, WriteInstruction, WriteOptions, WriteResult, Written,
};

pub const STORAGE_ID: &str = "test-store";

// =============================================================================
// Storage fixture
// =============================================================================

pub struct Fixture {
    pub storage: GeoStorage,
    pub driver: MemoryDriver,
    pub map: MapId,
    /// History on
    pub roads: CollectionId,
    /// History off, auto-purge on
    pub pins: CollectionId,
}

pub fn fixture() -> Fixture {
    fixture_with(StorageConfig::new(STORAGE_ID))
}

pub fn fixture_with(config: StorageConfig) -> Fixture {
    let map = MapId::new("city");
    let roads = CollectionId::new("roads");
    let pins = CollectionId::new("pins");
    let mut catalog = Catalog::new();
    catalog
        .register_collection(&map, &roads, CollectionConfig::default().with_partitions(4))
        .expect("register roads");
    catalog
        .register_collection(
            &map,
            &pins,
            CollectionConfig::default()
                .with_history(false)
                .with_auto_purge(true),
        )
        .expect("register pins");

    let driver = MemoryDriver::new(STORAGE_ID);
    let storage =
        GeoStorage::open(config, Arc::new(driver.clone()), catalog).expect("open storage");
    Fixture {
        storage,
        driver,
        map,
        roads,
        pins,
    }
}

impl Fixture {
    pub async fn session(&self) -> Session {
        self.storage.session().await.expect("session")
    }

    pub fn create(&self, feature: Feature) -> WriteInstruction {
        WriteInstruction::create(&self.map, &self.roads, feature)
    }

    pub fn update(&self, feature: Feature) -> WriteInstruction {
        WriteInstruction::update(&self.map, &self.roads, feature)
    }

    /// Write and commit, panicking on any failure.
    pub async fn commit(&self, session: &mut Session, instructions: Vec<WriteInstruction>) -> WriteResult {
        let result = session
            .write_batch(&instructions, WriteOptions::default())
            .await
            .expect("write batch");
        assert!(result.is_success(), "write failed: {:?}", result.errors().collect::<Vec<_>>());
        session.commit().await.expect("commit");
        result
    }
}

// =============================================================================
// Features
// =============================================================================

/// A road at `(x, y)` with a name and lane count.
pub fn road(id: &str, name: &str, lanes: i64, x: f64, y: f64) -> Feature {
    Feature::new(id)
        .with_document(json!({
            "type": "Road",
            "properties": {"name": name, "lanes": lanes}
        }))
        .with_geometry(Geometry::Point(point!(x: x, y: y)))
}

pub fn written(result: &WriteResult, index: usize) -> &Written {
    match result.get(index) {
        Some(Ok(written)) => written,
        other => panic!("instruction {index} did not succeed: {other:?}"),
    }
}

// =============================================================================
// Reads
// =============================================================================

pub async fn all(results: &mut ResultSet) -> Vec<Tuple> {
    results.window(0, usize::MAX / 2).await.expect("window")
}

pub fn ids(tuples: &[Tuple]) -> Vec<String> {
    tuples.iter().map(|t| t.meta.id.clone()).collect()
}

pub fn positions(tuples: &[Tuple]) -> Vec<(String, i64, i32)> {
    tuples
        .iter()
        .map(|t| (t.meta.id.clone(), t.meta.version.0, t.meta.uid))
        .collect()
}
