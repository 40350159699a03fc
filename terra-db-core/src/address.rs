//! Fixed-width binary tuple addresses.
//!
//! A [`TupleAddress`] is the only thing a read query transfers. Addresses are
//! encoded as 32 big-endian bytes; signed fields have their sign bit flipped
//! so that the byte order of two encodings equals their numeric order:
//!
//! ```text
//! map:u32 | collection:u64 | partition:u16 | reserved:u16 | version:i64 | uid:i32 | flags:u32
//! ```
//!
//! A result blob is the zstd-compressed concatenation of encoded addresses.

use crate::error::{Error, Result};
use crate::ids::{CollectionNumber, MapNumber, Partition, RowFlags, RowLocator, Version};
use std::fmt;

/// Width of one encoded address in bytes.
pub const ADDRESS_WIDTH: usize = 32;

const BLOB_ZSTD_LEVEL: i32 = 3;

/// Storage-wide locator of a single tuple version.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TupleAddress {
    pub map: MapNumber,
    pub collection: CollectionNumber,
    pub partition: Partition,
    pub locator: RowLocator,
}

impl TupleAddress {
    pub fn new(
        map: MapNumber,
        collection: CollectionNumber,
        partition: Partition,
        locator: RowLocator,
    ) -> Self {
        Self {
            map,
            collection,
            partition,
            locator,
        }
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.locator.version
    }

    #[inline]
    pub fn uid(&self) -> i32 {
        self.locator.uid
    }

    /// Storage order: `(map, collection, partition, version, uid)`.
    pub fn storage_key(&self) -> (u32, u64, u16, i64, i32) {
        (
            self.map.0,
            self.collection.0,
            self.partition,
            self.locator.version.0,
            self.locator.uid,
        )
    }

    /// Encode into the fixed-width representation.
    pub fn encode(&self) -> [u8; ADDRESS_WIDTH] {
        let mut out = [0u8; ADDRESS_WIDTH];
        out[0..4].copy_from_slice(&self.map.0.to_be_bytes());
        out[4..12].copy_from_slice(&self.collection.0.to_be_bytes());
        out[12..14].copy_from_slice(&self.partition.to_be_bytes());
        // 14..16 reserved
        out[16..24].copy_from_slice(&flip_i64(self.locator.version.0).to_be_bytes());
        out[24..28].copy_from_slice(&flip_i32(self.locator.uid).to_be_bytes());
        out[28..32].copy_from_slice(&self.locator.flags.0.to_be_bytes());
        out
    }

    /// Decode one address from exactly [`ADDRESS_WIDTH`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDRESS_WIDTH {
            return Err(Error::codec(format!(
                "tuple address must be {} bytes, got {}",
                ADDRESS_WIDTH,
                bytes.len()
            )));
        }
        let map = u32::from_be_bytes(array(&bytes[0..4]));
        let collection = u64::from_be_bytes(array(&bytes[4..12]));
        let partition = u16::from_be_bytes(array(&bytes[12..14]));
        let version = unflip_i64(u64::from_be_bytes(array(&bytes[16..24])));
        let uid = unflip_i32(u32::from_be_bytes(array(&bytes[24..28])));
        let flags = u32::from_be_bytes(array(&bytes[28..32]));
        Ok(Self {
            map: MapNumber(map),
            collection: CollectionNumber(collection),
            partition,
            locator: RowLocator::new(Version(version), uid, RowFlags(flags)),
        })
    }

    /// Concatenate encoded addresses without compression.
    pub fn concat(addresses: &[TupleAddress]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(addresses.len() * ADDRESS_WIDTH);
        for addr in addresses {
            raw.extend_from_slice(&addr.encode());
        }
        raw
    }

    /// Split a concatenation produced by [`TupleAddress::concat`].
    pub fn split(raw: &[u8]) -> Result<Vec<TupleAddress>> {
        if raw.len() % ADDRESS_WIDTH != 0 {
            return Err(Error::codec(format!(
                "address blob length {} is not a multiple of {}",
                raw.len(),
                ADDRESS_WIDTH
            )));
        }
        raw.chunks_exact(ADDRESS_WIDTH)
            .map(TupleAddress::decode)
            .collect()
    }

    /// Encode a sequence into a compressed blob.
    pub fn pack_blob(addresses: &[TupleAddress]) -> Result<Vec<u8>> {
        let raw = Self::concat(addresses);
        zstd::encode_all(&raw[..], BLOB_ZSTD_LEVEL)
            .map_err(|e| Error::codec(format!("address blob compression failed: {e}")))
    }

    /// Decode a compressed blob. An empty blob decodes to an empty sequence.
    pub fn unpack_blob(blob: &[u8]) -> Result<Vec<TupleAddress>> {
        if blob.is_empty() {
            return Ok(Vec::new());
        }
        let raw = zstd::decode_all(blob)
            .map_err(|e| Error::codec(format!("address blob decompression failed: {e}")))?;
        Self::split(&raw)
    }
}

impl fmt::Display for TupleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.map.0, self.collection.0, self.partition, self.locator
        )
    }
}

#[inline]
fn flip_i64(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

#[inline]
fn unflip_i64(v: u64) -> i64 {
    (v ^ (1 << 63)) as i64
}

#[inline]
fn flip_i32(v: i32) -> u32 {
    (v as u32) ^ (1 << 31)
}

#[inline]
fn unflip_i32(v: u32) -> i32 {
    (v ^ (1 << 31)) as i32
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Action;

    fn addr(version: i64, uid: i32) -> TupleAddress {
        TupleAddress::new(
            MapNumber(1),
            CollectionNumber(7),
            3,
            RowLocator::new(Version(version), uid, RowFlags::new(Action::Updated)),
        )
    }

    #[test]
    fn test_encoding_is_order_stable() {
        let low = addr(-5, 9);
        let mid = addr(3, -1);
        let high = addr(3, 2);
        assert!(low.encode() < mid.encode());
        assert!(mid.encode() < high.encode());
    }

    #[test]
    fn test_blob_preserves_sequence() {
        let seq = vec![addr(10, 0), addr(2, 1), addr(i64::MAX, i32::MIN)];
        let blob = TupleAddress::pack_blob(&seq).unwrap();
        assert_eq!(TupleAddress::unpack_blob(&blob).unwrap(), seq);
    }

    #[test]
    fn test_decode_rejects_bad_width() {
        assert!(matches!(TupleAddress::decode(&[0u8; 31]), Err(Error::Codec(_))));
        assert!(TupleAddress::split(&[0u8; 33]).is_err());
        assert!(TupleAddress::unpack_blob(&[]).unwrap().is_empty());
    }
}
