//! Features, encoded payloads and tuples.
//!
//! A [`Feature`] is what a client writes. It is encoded once into an
//! [`EncodedPayload`] (feature JSON, WKT geometry, WKT reference point, tags
//! JSON), each part optionally zstd-compressed as recorded in the row flags.
//! A [`Tuple`] is one stored version: address, metadata and whatever payload
//! parts the reader asked for.

use crate::address::TupleAddress;
use crate::error::{Error, Result};
use crate::geometry::{parse_wkt, to_wkt};
use crate::ids::{FeatureEncoding, GeometryEncoding, RowFlags};
use crate::metadata::Metadata;
use geo_types::{Geometry, Point};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

const PAYLOAD_ZSTD_LEVEL: i32 = 3;

/// A feature as written by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    /// Feature document (everything except geometry and tags)
    pub document: JsonValue,
    pub geometry: Option<Geometry<f64>>,
    /// Explicit clustering point; defaults to the geometry centroid
    pub reference_point: Option<Point<f64>>,
    /// `key=value` or bare `key` tags
    pub tags: Vec<String>,
}

impl Feature {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document: JsonValue::Object(Map::new()),
            geometry: None,
            reference_point: None,
            tags: Vec::new(),
        }
    }

    pub fn with_document(mut self, document: JsonValue) -> Self {
        self.document = document;
        self
    }

    pub fn with_geometry(mut self, geometry: Geometry<f64>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_reference_point(mut self, point: Point<f64>) -> Self {
        self.reference_point = Some(point);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// The `type` member of the document, if it is a string.
    pub fn feature_type(&self) -> Option<String> {
        self.document
            .get("type")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    }

    /// Point used for the geo-grid key.
    pub fn clustering_point(&self) -> Option<Point<f64>> {
        self.reference_point
            .or_else(|| self.geometry.as_ref().and_then(crate::geometry::reference_point))
    }

    /// Encode all payload parts.
    ///
    /// Parts whose encoded size reaches `compress_threshold` bytes are
    /// zstd-compressed; `None` disables compression.
    pub fn encode(&self, compress_threshold: Option<usize>) -> Result<EncodedPayload> {
        let feature_raw = serde_json::to_vec(&self.document)?;
        let geometry_wkt = self.geometry.as_ref().map(to_wkt);
        let reference_point = self
            .reference_point
            .map(|p| to_wkt(&Geometry::Point(p)).into_bytes());
        let tags_json = tags_to_json(&self.tags);
        let tags_raw = serde_json::to_vec(&tags_json)?;

        let should_compress =
            |len: usize| compress_threshold.is_some_and(|threshold| len >= threshold);
        let feature_zstd = should_compress(feature_raw.len());
        let geometry_zstd = geometry_wkt
            .as_ref()
            .is_some_and(|wkt| should_compress(wkt.len()));
        let tags_zstd = should_compress(tags_raw.len());

        let feature = maybe_compress(feature_raw, feature_zstd)?;
        let geometry = geometry_wkt
            .clone()
            .map(|wkt| maybe_compress(wkt.into_bytes(), geometry_zstd))
            .transpose()?;
        let tags = maybe_compress(tags_raw, tags_zstd)?;

        let flags = RowFlags::default()
            .with_encodings(FeatureEncoding::Json, GeometryEncoding::Wkt)
            .with_compression(feature_zstd, geometry_zstd, tags_zstd);

        Ok(EncodedPayload {
            feature,
            geometry,
            reference_point,
            tags,
            flags,
            geometry_wkt,
            tags_json,
        })
    }
}

/// Encoded payload parts plus the plain forms needed for hashing.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub feature: Vec<u8>,
    pub geometry: Option<Vec<u8>>,
    pub reference_point: Option<Vec<u8>>,
    pub tags: Vec<u8>,
    /// Encoding and compression bits; the action bits are left at zero
    pub flags: RowFlags,
    pub geometry_wkt: Option<String>,
    pub tags_json: JsonValue,
}

/// Which payload parts a reader wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Columns {
    pub feature: bool,
    pub geometry: bool,
    pub reference_point: bool,
    pub tags: bool,
}

impl Columns {
    pub const ALL: Columns = Columns {
        feature: true,
        geometry: true,
        reference_point: true,
        tags: true,
    };

    pub const METADATA_ONLY: Columns = Columns {
        feature: false,
        geometry: false,
        reference_point: false,
        tags: false,
    };

    pub fn is_metadata_only(&self) -> bool {
        *self == Self::METADATA_ONLY
    }

    /// Whether a tuple fetched with `self` satisfies a request for `other`.
    pub fn covers(&self, other: &Columns) -> bool {
        (self.feature || !other.feature)
            && (self.geometry || !other.geometry)
            && (self.reference_point || !other.reference_point)
            && (self.tags || !other.tags)
    }

    pub fn union(&self, other: &Columns) -> Columns {
        Columns {
            feature: self.feature || other.feature,
            geometry: self.geometry || other.geometry,
            reference_point: self.reference_point || other.reference_point,
            tags: self.tags || other.tags,
        }
    }
}

impl Default for Columns {
    fn default() -> Self {
        Self::ALL
    }
}

/// One stored tuple version.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    pub address: TupleAddress,
    pub meta: Metadata,
    pub feature: Option<Vec<u8>>,
    pub geometry: Option<Vec<u8>>,
    pub reference_point: Option<Vec<u8>>,
    pub tags: Option<Vec<u8>>,
}

impl Tuple {
    /// Build a full tuple from metadata and an encoded payload.
    pub fn from_payload(address: TupleAddress, meta: Metadata, payload: &EncodedPayload) -> Self {
        Self {
            address,
            meta,
            feature: Some(payload.feature.clone()),
            geometry: payload.geometry.clone(),
            reference_point: payload.reference_point.clone(),
            tags: Some(payload.tags.clone()),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    #[inline]
    pub fn flags(&self) -> RowFlags {
        self.meta.flags
    }

    /// Copy with withheld payload parts.
    pub fn project(&self, columns: &Columns) -> Tuple {
        Tuple {
            address: self.address,
            meta: self.meta.clone(),
            feature: if columns.feature { self.feature.clone() } else { None },
            geometry: if columns.geometry { self.geometry.clone() } else { None },
            reference_point: if columns.reference_point {
                self.reference_point.clone()
            } else {
                None
            },
            tags: if columns.tags { self.tags.clone() } else { None },
        }
    }

    /// Decode the feature document. `None` if the part was withheld.
    pub fn decode_feature(&self) -> Result<Option<JsonValue>> {
        self.feature
            .as_deref()
            .map(|bytes| {
                let raw = maybe_decompress(bytes, self.flags().feature_zstd())?;
                Ok(serde_json::from_slice(&raw)?)
            })
            .transpose()
    }

    /// Decode the geometry. `None` if absent or withheld.
    pub fn decode_geometry(&self) -> Result<Option<Geometry<f64>>> {
        self.geometry
            .as_deref()
            .map(|bytes| {
                let raw = maybe_decompress(bytes, self.flags().geometry_zstd())?;
                let wkt = std::str::from_utf8(&raw)
                    .map_err(|e| Error::codec(format!("geometry is not UTF-8: {e}")))?;
                parse_wkt(wkt)
            })
            .transpose()
    }

    /// Decode the explicit reference point, if any.
    pub fn decode_reference_point(&self) -> Result<Option<Point<f64>>> {
        let Some(bytes) = self.reference_point.as_deref() else {
            return Ok(None);
        };
        let wkt = std::str::from_utf8(bytes)
            .map_err(|e| Error::codec(format!("reference point is not UTF-8: {e}")))?;
        match parse_wkt(wkt)? {
            Geometry::Point(p) => Ok(Some(p)),
            other => Err(Error::codec(format!(
                "reference point must be a POINT, got {other:?}"
            ))),
        }
    }

    /// Decode tags as a JSON object (`{"key": "value", "bare": true}`).
    pub fn decode_tags_json(&self) -> Result<Option<JsonValue>> {
        self.tags
            .as_deref()
            .map(|bytes| {
                let raw = maybe_decompress(bytes, self.flags().tags_zstd())?;
                Ok(serde_json::from_slice(&raw)?)
            })
            .transpose()
    }

    /// Decode tags back into `key=value` strings (sorted by key).
    pub fn decode_tags(&self) -> Result<Option<Vec<String>>> {
        Ok(self.decode_tags_json()?.map(|json| json_to_tags(&json)))
    }

    /// Approximate in-memory size, used as cache weight.
    pub fn size_bytes(&self) -> usize {
        let part = |p: &Option<Vec<u8>>| p.as_ref().map_or(0, Vec::len);
        std::mem::size_of::<Tuple>()
            + self.meta.id.len()
            + self.meta.hash.len()
            + self.meta.app_id.len()
            + part(&self.feature)
            + part(&self.geometry)
            + part(&self.reference_point)
            + part(&self.tags)
    }
}

/// Tags as a JSON object. `key=value` becomes a string member, a bare `key`
/// becomes `true`. Later duplicates win.
pub fn tags_to_json(tags: &[String]) -> JsonValue {
    let mut map = BTreeMap::new();
    for tag in tags {
        match tag.split_once('=') {
            Some((key, value)) => map.insert(key.to_string(), JsonValue::String(value.to_string())),
            None => map.insert(tag.clone(), JsonValue::Bool(true)),
        };
    }
    JsonValue::Object(map.into_iter().collect())
}

/// Inverse of [`tags_to_json`].
pub fn json_to_tags(json: &JsonValue) -> Vec<String> {
    let Some(map) = json.as_object() else {
        return Vec::new();
    };
    let mut tags: Vec<String> = map
        .iter()
        .map(|(key, value)| match value {
            JsonValue::Bool(true) => key.clone(),
            JsonValue::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect();
    tags.sort();
    tags
}

fn maybe_compress(raw: Vec<u8>, compress: bool) -> Result<Vec<u8>> {
    if !compress {
        return Ok(raw);
    }
    zstd::encode_all(&raw[..], PAYLOAD_ZSTD_LEVEL)
        .map_err(|e| Error::codec(format!("payload compression failed: {e}")))
}

fn maybe_decompress(bytes: &[u8], compressed: bool) -> Result<std::borrow::Cow<'_, [u8]>> {
    if !compressed {
        return Ok(std::borrow::Cow::Borrowed(bytes));
    }
    zstd::decode_all(bytes)
        .map(std::borrow::Cow::Owned)
        .map_err(|e| Error::codec(format!("payload decompression failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::parse_wkt;
    use crate::ids::{Action, CollectionNumber, MapNumber, RowLocator, Version};
    use serde_json::json;

    fn meta_with(flags: RowFlags) -> Metadata {
        Metadata {
            id: "f1".into(),
            created_at: 0,
            updated_at: 0,
            author_ts: 0,
            version: Version(1),
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
        }
    }

    fn tuple_for(feature: &Feature, threshold: Option<usize>) -> Tuple {
        let payload = feature.encode(threshold).unwrap();
        let flags = payload.flags.with_action(Action::Created);
        let address = TupleAddress::new(
            MapNumber(1),
            CollectionNumber(1),
            0,
            RowLocator::new(Version(1), 0, flags),
        );
        Tuple::from_payload(address, meta_with(flags), &payload)
    }

    #[test]
    fn test_encode_decode_with_compression() {
        let feature = Feature::new("f1")
            .with_document(json!({"type": "Road", "properties": {"name": "x".repeat(500)}}))
            .with_geometry(parse_wkt("LINESTRING(0 0, 1 1, 2 2)").unwrap())
            .with_tags(["highway=primary", "verified"]);

        let tuple = tuple_for(&feature, Some(64));
        assert!(tuple.flags().feature_zstd());
        assert!(!tuple.flags().geometry_zstd());

        assert_eq!(tuple.decode_feature().unwrap().unwrap(), feature.document);
        assert_eq!(tuple.decode_geometry().unwrap(), feature.geometry);
        assert_eq!(
            tuple.decode_tags().unwrap().unwrap(),
            vec!["highway=primary".to_string(), "verified".to_string()]
        );
        assert_eq!(feature.feature_type().as_deref(), Some("Road"));
    }

    #[test]
    fn test_projection_withholds_parts() {
        let feature = Feature::new("f1")
            .with_geometry(parse_wkt("POINT(1 2)").unwrap())
            .with_reference_point(Point::new(1.0, 2.0));
        let tuple = tuple_for(&feature, None);
        assert_eq!(tuple.decode_reference_point().unwrap(), Some(Point::new(1.0, 2.0)));

        let meta_only = tuple.project(&Columns::METADATA_ONLY);
        assert!(meta_only.decode_feature().unwrap().is_none());
        assert!(meta_only.decode_geometry().unwrap().is_none());
        assert_eq!(meta_only.meta, tuple.meta);
        assert!(Columns::ALL.covers(&Columns::METADATA_ONLY));
        assert!(!Columns::METADATA_ONLY.covers(&Columns::ALL));
    }
}
