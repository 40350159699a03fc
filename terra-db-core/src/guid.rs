//! Fully-qualified version identity used for optimistic concurrency.
//!
//! String form: `urn:terra:{storage}:{collection}:{feature}:{version}:{uid}:{flags-hex}`.
//! The three string components are percent-encoded so that any feature id
//! survives a round trip.

use crate::error::{Error, Result};
use crate::ids::{RowFlags, RowLocator, Version};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const GUID_PREFIX: &str = "urn:terra:";

/// `(storageId, collectionId, featureId, RowLocator)`, compared structurally.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Guid {
    pub storage_id: Arc<str>,
    pub collection_id: Arc<str>,
    pub feature_id: Arc<str>,
    pub locator: RowLocator,
}

impl Guid {
    pub fn new(
        storage_id: impl Into<Arc<str>>,
        collection_id: impl Into<Arc<str>>,
        feature_id: impl Into<Arc<str>>,
        locator: RowLocator,
    ) -> Self {
        Self {
            storage_id: storage_id.into(),
            collection_id: collection_id.into(),
            feature_id: feature_id.into(),
            locator,
        }
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.locator.version
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}:{}:{}:{}:{:x}",
            GUID_PREFIX,
            escape(&self.storage_id),
            escape(&self.collection_id),
            escape(&self.feature_id),
            self.locator.version.0,
            self.locator.uid,
            self.locator.flags.0
        )
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(GUID_PREFIX)
            .ok_or_else(|| Error::illegal_argument(format!("not a guid: '{s}'")))?;
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::illegal_argument(format!(
                "guid '{s}' must have 6 components, found {}",
                parts.len()
            )));
        }
        let version = parts[3]
            .parse::<i64>()
            .map_err(|e| Error::illegal_argument(format!("guid version '{}': {e}", parts[3])))?;
        let uid = parts[4]
            .parse::<i32>()
            .map_err(|e| Error::illegal_argument(format!("guid uid '{}': {e}", parts[4])))?;
        let flags = u32::from_str_radix(parts[5], 16)
            .map_err(|e| Error::illegal_argument(format!("guid flags '{}': {e}", parts[5])))?;
        Ok(Guid::new(
            unescape(parts[0])?,
            unescape(parts[1])?,
            unescape(parts[2])?,
            RowLocator::new(Version(version), uid, RowFlags(flags)),
        ))
    }
}

fn escape(s: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(s)
}

fn unescape(s: &str) -> Result<String> {
    urlencoding::decode(s)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| Error::illegal_argument(format!("guid component '{s}': {e}")))
}
