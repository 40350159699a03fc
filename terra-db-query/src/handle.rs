//! Continuation handles.
//!
//! A handle is the base64url (unpadded) form of a zstd-compressed frame:
//!
//! ```text
//! "TRH1" | u16 storage-id length | storage-id bytes | order u8
//!        | resume u64 | count u32 | count × 32-byte tuple address
//! ```
//!
//! All integers are big-endian. The frame carries the full address
//! sequence, so resuming never re-runs the query.

use crate::request::ResultOrder;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use terra_db_core::{Error, Result, TupleAddress, ADDRESS_WIDTH};

const MAGIC: &[u8; 4] = b"TRH1";
const HANDLE_ZSTD_LEVEL: i32 = 3;

/// Decoded continuation handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultHandle {
    pub storage_id: String,
    pub order: ResultOrder,
    /// Index of the first address not yet consumed
    pub resume: usize,
    pub addresses: Vec<TupleAddress>,
}

impl ResultHandle {
    pub fn encode(&self) -> Result<String> {
        let storage = self.storage_id.as_bytes();
        let storage_len = u16::try_from(storage.len())
            .map_err(|_| Error::illegal_argument("storage id too long for a handle"))?;
        let count = u32::try_from(self.addresses.len())
            .map_err(|_| Error::illegal_argument("too many addresses for a handle"))?;

        let mut frame =
            Vec::with_capacity(4 + 2 + storage.len() + 1 + 8 + 4 + self.addresses.len() * ADDRESS_WIDTH);
        frame.extend_from_slice(MAGIC);
        frame.extend_from_slice(&storage_len.to_be_bytes());
        frame.extend_from_slice(storage);
        frame.push(self.order.to_byte());
        frame.extend_from_slice(&(self.resume as u64).to_be_bytes());
        frame.extend_from_slice(&count.to_be_bytes());
        frame.extend_from_slice(&TupleAddress::concat(&self.addresses));

        let packed = zstd::encode_all(&frame[..], HANDLE_ZSTD_LEVEL)
            .map_err(|e| Error::codec(format!("handle compression failed: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(packed))
    }

    /// Decode a handle string. Anything malformed is an `IllegalArgument`.
    pub fn decode(handle: &str) -> Result<Self> {
        let packed = URL_SAFE_NO_PAD
            .decode(handle.trim())
            .map_err(|e| Error::illegal_argument(format!("handle is not base64url: {e}")))?;
        let frame = zstd::decode_all(&packed[..])
            .map_err(|e| Error::illegal_argument(format!("handle is not a compressed frame: {e}")))?;

        let mut reader = FrameReader { frame: &frame };
        if reader.take(4)? != MAGIC {
            return Err(Error::illegal_argument("handle has an unknown format"));
        }
        let storage_len = u16::from_be_bytes(reader.array()?) as usize;
        let storage_id = std::str::from_utf8(reader.take(storage_len)?)
            .map_err(|_| Error::illegal_argument("handle storage id is not UTF-8"))?
            .to_string();
        let order = ResultOrder::from_byte(reader.take(1)?[0])?;
        let resume = u64::from_be_bytes(reader.array()?) as usize;
        let count = u32::from_be_bytes(reader.array()?) as usize;
        let raw = reader.take(count * ADDRESS_WIDTH)?;
        if !reader.frame.is_empty() {
            return Err(Error::illegal_argument("trailing bytes after handle"));
        }
        let addresses =
            TupleAddress::split(raw).map_err(|e| Error::illegal_argument(e.to_string()))?;
        if resume > addresses.len() {
            return Err(Error::illegal_argument(format!(
                "handle resumes at {resume} past its {} addresses",
                addresses.len()
            )));
        }
        Ok(Self {
            storage_id,
            order,
            resume,
            addresses,
        })
    }
}

struct FrameReader<'a> {
    frame: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.frame.len() < n {
            return Err(Error::illegal_argument("handle is truncated"));
        }
        let (head, rest) = self.frame.split_at(n);
        self.frame = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_db_core::{Action, CollectionNumber, MapNumber, RowFlags, RowLocator, Version};

    fn address(version: i64) -> TupleAddress {
        TupleAddress::new(
            MapNumber(1),
            CollectionNumber(2),
            3,
            RowLocator::new(Version(version), -1, RowFlags::new(Action::Updated)),
        )
    }

    #[test]
    fn test_handle_survives_encoding() {
        let handle = ResultHandle {
            storage_id: "store-ä".into(),
            order: ResultOrder::Id,
            resume: 2,
            addresses: (1..=5).map(address).collect(),
        };
        let text = handle.encode().unwrap();
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(ResultHandle::decode(&text).unwrap(), handle);
    }

    #[test]
    fn test_malformed_handles_are_illegal_arguments() {
        let not_zstd = URL_SAFE_NO_PAD.encode(b"not zstd");
        for bad in ["", "!!!", "AAAA", not_zstd.as_str()] {
            assert!(
                matches!(ResultHandle::decode(bad), Err(Error::IllegalArgument(_))),
                "{bad:?}"
            );
        }

        let mut frame = b"TRH1".to_vec();
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.push(b's');
        frame.push(0);
        frame.extend_from_slice(&9u64.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        let text = URL_SAFE_NO_PAD.encode(zstd::encode_all(&frame[..], 1).unwrap());
        assert!(matches!(
            ResultHandle::decode(&text),
            Err(Error::IllegalArgument(msg)) if msg.contains("past")
        ));
    }
}
