//! Versioned envelope around a feature.
//!
//! One [`Metadata`] exists per tuple version. `prev_version`/`puid` point to
//! the previous version's locator, forming a backward-linked chain. The head
//! tuple has `next_version == None`; every tuple with a successor is
//! historical and immutable.

use crate::ids::{RowFlags, RowLocator, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Metadata of one tuple version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Feature id
    pub id: String,
    /// Epoch millis of the first version
    pub created_at: i64,
    /// Epoch millis of this version
    pub updated_at: i64,
    /// Epoch millis at which the author last changed the feature
    pub author_ts: i64,
    pub version: Version,
    pub uid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub puid: Option<i32>,
    /// Set once the tuple has a successor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_version: Option<Version>,
    /// Content fingerprint (hex SHA-256) over feature, geometry and tags
    pub hash: String,
    /// Spatial clustering key
    pub geo_grid: i32,
    pub flags: RowFlags,
    pub app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
    /// 1 on create, incremented on every update and delete
    pub change_count: u32,
}

impl Metadata {
    #[inline]
    pub fn locator(&self) -> RowLocator {
        RowLocator::new(self.version, self.uid, self.flags)
    }

    /// Locator of the previous version, if any.
    pub fn prev_locator(&self) -> Option<(Version, i32)> {
        match (self.prev_version, self.puid) {
            (Some(v), Some(u)) => Some((v, u)),
            _ => None,
        }
    }

    /// Whether this tuple is (still) a head, i.e. has no successor.
    #[inline]
    pub fn is_head(&self) -> bool {
        self.next_version.is_none()
    }

    /// Copy of this metadata marked as superseded by `next`.
    pub fn superseded_by(&self, next: Version) -> Self {
        Self {
            next_version: Some(next),
            ..self.clone()
        }
    }
}

/// Fingerprint over the feature document, encoded geometry and tags.
///
/// `volatile_paths` are dotted member paths (e.g. `properties.@ns:terra`)
/// removed from the document before hashing, so bookkeeping members never
/// change the hash.
pub fn content_hash(
    feature: &JsonValue,
    geometry_wkt: Option<&str>,
    tags: &JsonValue,
    volatile_paths: &[String],
) -> String {
    let mut stable = feature.clone();
    for path in volatile_paths {
        remove_path(&mut stable, path);
    }

    let mut hasher = Sha256::new();
    hasher.update(stable.to_string().as_bytes());
    hasher.update([0u8]);
    if let Some(wkt) = geometry_wkt {
        hasher.update(wkt.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(tags.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn remove_path(value: &mut JsonValue, path: &str) {
    let mut segments = path.split('.').peekable();
    let mut current = value;
    while let Some(segment) = segments.next() {
        let JsonValue::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.remove(segment);
            return;
        }
        match map.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}
