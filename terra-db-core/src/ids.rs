//! Typed identifiers for versions, row locators and routing numbers.
//!
//! Each numeric type is `#[repr(transparent)]` + `Copy`, so wrapping a raw
//! primitive costs nothing at runtime.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Logical transaction number (i64), allocated from a per-storage sequence.
///
/// Totally orders every write in a storage and acts as a commit timestamp.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Version(pub i64);

impl Version {
    #[inline]
    pub fn as_i64(self) -> i64 {
        self.0
    }
    #[inline]
    pub fn from_i64(v: i64) -> Self {
        Self(v)
    }
    #[inline]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Routing numbers
// ---------------------------------------------------------------------------

/// Numeric map identifier used inside tuple addresses (u32).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MapNumber(pub u32);

/// Numeric collection identifier used inside tuple addresses (u64).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CollectionNumber(pub u64);

/// Physical partition of a collection (u16). `hash(featureId) mod partitionCount`.
pub type Partition = u16;

// ---------------------------------------------------------------------------
// RowFlags
// ---------------------------------------------------------------------------

/// Action recorded in the low two bits of [`RowFlags`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Created = 0,
    Updated = 1,
    Deleted = 2,
}

/// Encoding of the feature payload.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
#[repr(u8)]
pub enum FeatureEncoding {
    #[default]
    Json = 0,
}

/// Encoding of the geometry and reference point payloads.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
#[repr(u8)]
pub enum GeometryEncoding {
    #[default]
    Wkt = 0,
}

/// Per-tuple bit field: action, payload encodings and compression.
///
/// ```text
/// bits 0-1  action (created/updated/deleted)
/// bits 2-3  feature encoding
/// bit  4    feature zstd
/// bits 5-6  geometry encoding
/// bit  7    geometry zstd
/// bit  8    tags zstd
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RowFlags(pub u32);

impl RowFlags {
    const ACTION_MASK: u32 = 0b11;
    const FEATURE_ENCODING_SHIFT: u32 = 2;
    const FEATURE_ZSTD: u32 = 1 << 4;
    const GEOMETRY_ENCODING_SHIFT: u32 = 5;
    const GEOMETRY_ZSTD: u32 = 1 << 7;
    const TAGS_ZSTD: u32 = 1 << 8;

    pub fn new(action: Action) -> Self {
        Self(action as u32)
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Action bits. Unknown values (3) read as `Updated`.
    pub fn action(self) -> Action {
        match self.0 & Self::ACTION_MASK {
            0 => Action::Created,
            2 => Action::Deleted,
            _ => Action::Updated,
        }
    }

    pub fn with_action(self, action: Action) -> Self {
        Self((self.0 & !Self::ACTION_MASK) | action as u32)
    }

    pub fn is_deleted(self) -> bool {
        self.action() == Action::Deleted
    }

    pub fn feature_encoding(self) -> FeatureEncoding {
        FeatureEncoding::Json
    }

    pub fn geometry_encoding(self) -> GeometryEncoding {
        GeometryEncoding::Wkt
    }

    pub fn with_encodings(self, feature: FeatureEncoding, geometry: GeometryEncoding) -> Self {
        let cleared = self.0 & !(0b11 << Self::FEATURE_ENCODING_SHIFT) & !(0b11 << Self::GEOMETRY_ENCODING_SHIFT);
        Self(
            cleared
                | (feature as u32) << Self::FEATURE_ENCODING_SHIFT
                | (geometry as u32) << Self::GEOMETRY_ENCODING_SHIFT,
        )
    }

    pub fn feature_zstd(self) -> bool {
        self.0 & Self::FEATURE_ZSTD != 0
    }

    pub fn geometry_zstd(self) -> bool {
        self.0 & Self::GEOMETRY_ZSTD != 0
    }

    pub fn tags_zstd(self) -> bool {
        self.0 & Self::TAGS_ZSTD != 0
    }

    /// Set or clear all three compression bits.
    pub fn with_compression(self, feature: bool, geometry: bool, tags: bool) -> Self {
        let mut bits = self.0 & !(Self::FEATURE_ZSTD | Self::GEOMETRY_ZSTD | Self::TAGS_ZSTD);
        if feature {
            bits |= Self::FEATURE_ZSTD;
        }
        if geometry {
            bits |= Self::GEOMETRY_ZSTD;
        }
        if tags {
            bits |= Self::TAGS_ZSTD;
        }
        Self(bits)
    }
}

impl fmt::Debug for RowFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowFlags")
            .field("action", &self.action())
            .field("feature_zstd", &self.feature_zstd())
            .field("geometry_zstd", &self.geometry_zstd())
            .field("tags_zstd", &self.tags_zstd())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RowLocator
// ---------------------------------------------------------------------------

/// `(version, uid, flags)`: identifies one tuple version within a collection.
///
/// Batched writes share one `version` and increment `uid`. Ordering and
/// equality of the *position* use `(version, uid)`; see [`RowLocator::cmp_position`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct RowLocator {
    pub version: Version,
    pub uid: i32,
    pub flags: RowFlags,
}

impl RowLocator {
    pub fn new(version: Version, uid: i32, flags: RowFlags) -> Self {
        Self {
            version,
            uid,
            flags,
        }
    }

    /// Compare by `(version, uid)`, ignoring flags.
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.uid.cmp(&other.uid))
    }

    /// Same `(version, uid)` position.
    pub fn same_position(&self, other: &Self) -> bool {
        self.cmp_position(other) == Ordering::Equal
    }
}

impl fmt::Display for RowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version.0, self.uid)
    }
}
