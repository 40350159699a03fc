//! # Terra DB Core
//!
//! Runtime-agnostic building blocks of the Terra feature store.
//!
//! This crate provides:
//! - Identifiers: `Version`, `RowFlags`, `RowLocator`, `TupleAddress`, `Guid`
//! - The versioned `Metadata` envelope and content hashing
//! - `Feature`/`Tuple` payload codecs (JSON, WKT, optional zstd)
//! - Map/collection routing (`Catalog`) and partitioning
//! - `StorageConfig`
//! - The shared `Error` taxonomy
//!
//! No I/O happens here; the connection crate owns the driver boundary.

pub mod address;
pub mod catalog;
pub mod config;
pub mod error;
pub mod geometry;
pub mod guid;
pub mod ids;
pub mod metadata;
pub mod tuple;

pub use address::{TupleAddress, ADDRESS_WIDTH};
pub use catalog::{partition_of, Catalog, CollectionConfig, CollectionId, CollectionRef, MapId};
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use guid::Guid;
pub use ids::{
    Action, CollectionNumber, FeatureEncoding, GeometryEncoding, MapNumber, Partition, RowFlags,
    RowLocator, Version,
};
pub use metadata::{content_hash, Metadata};
pub use tuple::{json_to_tags, tags_to_json, Columns, EncodedPayload, Feature, Tuple};

// Geometry types appear in public signatures (features, spatial queries).
pub use geo_types;
