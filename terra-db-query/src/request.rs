//! Read requests.
//!
//! A [`ReadRequest`] is one flat description of a read, built through
//! [`ReadRequest::builder`] and validated once by
//! [`ReadRequestBuilder::build`]. Every later stage can rely on it being
//! well formed.

use crate::filter::{FilterChain, TupleFilter};
use geo_types::Geometry;
use serde_json::Value as JsonValue;
use terra_db_connection::{CmpOp, MetaColumn};
use terra_db_core::{CollectionId, Columns, Error, Guid, MapId, Result};

/// Spatial predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SpatialQuery {
    Intersects(Geometry<f64>),
    Not(Box<SpatialQuery>),
    And(Vec<SpatialQuery>),
    Or(Vec<SpatialQuery>),
}

impl SpatialQuery {
    pub fn intersects(geometry: impl Into<Geometry<f64>>) -> Self {
        SpatialQuery::Intersects(geometry.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        SpatialQuery::Not(Box::new(self))
    }
}

/// Property addressed by a property predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyRef {
    /// A metadata column
    Meta(MetaColumn),
    /// Member path inside the feature document
    Feature(Vec<String>),
}

impl PropertyRef {
    /// Dotted feature path, e.g. `properties.name`.
    pub fn path(dotted: &str) -> Self {
        PropertyRef::Feature(dotted.split('.').map(str::to_string).collect())
    }
}

/// Property predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyQuery {
    Compare {
        property: PropertyRef,
        op: CmpOp,
        value: JsonValue,
    },
    IsNull(PropertyRef),
    Not(Box<PropertyQuery>),
    And(Vec<PropertyQuery>),
    Or(Vec<PropertyQuery>),
}

impl PropertyQuery {
    pub fn compare(property: PropertyRef, op: CmpOp, value: impl Into<JsonValue>) -> Self {
        PropertyQuery::Compare {
            property,
            op,
            value: value.into(),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        PropertyQuery::Not(Box::new(self))
    }
}

/// Tag predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TagQuery {
    /// Tag present (bare or with any value)
    Exists(String),
    /// `key=value` present
    Equals(String, String),
    Not(Box<TagQuery>),
    And(Vec<TagQuery>),
    Or(Vec<TagQuery>),
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultOrder {
    /// Storage order, no resort
    #[default]
    Deterministic,
    /// `(version desc, uid desc)`
    Version,
    /// `(feature id asc, version desc, uid desc)`
    Id,
}

impl ResultOrder {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            ResultOrder::Deterministic => 0,
            ResultOrder::Version => 1,
            ResultOrder::Id => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ResultOrder::Deterministic),
            1 => Ok(ResultOrder::Version),
            2 => Ok(ResultOrder::Id),
            other => Err(Error::illegal_argument(format!("unknown result order {other}"))),
        }
    }
}

/// A validated read request.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    map: MapId,
    collections: Vec<CollectionId>,
    feature_ids: Option<Vec<String>>,
    guids: Vec<Guid>,
    spatial: Option<SpatialQuery>,
    property: Option<PropertyQuery>,
    tags: Option<TagQuery>,
    include_deleted: bool,
    include_history: bool,
    soft_limit: Option<usize>,
    order: ResultOrder,
    return_handle: bool,
    columns: Columns,
    filters: FilterChain,
    versions: Option<usize>,
}

impl ReadRequest {
    pub fn builder(map: &MapId) -> ReadRequestBuilder {
        ReadRequestBuilder {
            request: ReadRequest {
                map: map.clone(),
                collections: Vec::new(),
                feature_ids: None,
                guids: Vec::new(),
                spatial: None,
                property: None,
                tags: None,
                include_deleted: false,
                include_history: false,
                soft_limit: None,
                order: ResultOrder::Deterministic,
                return_handle: false,
                columns: Columns::ALL,
                filters: FilterChain::new(),
                versions: None,
            },
        }
    }

    pub fn map(&self) -> &MapId {
        &self.map
    }

    pub fn collections(&self) -> &[CollectionId] {
        &self.collections
    }

    pub fn feature_ids(&self) -> Option<&[String]> {
        self.feature_ids.as_deref()
    }

    pub fn guids(&self) -> &[Guid] {
        &self.guids
    }

    pub fn spatial(&self) -> Option<&SpatialQuery> {
        self.spatial.as_ref()
    }

    pub fn property(&self) -> Option<&PropertyQuery> {
        self.property.as_ref()
    }

    pub fn tags(&self) -> Option<&TagQuery> {
        self.tags.as_ref()
    }

    pub fn include_deleted(&self) -> bool {
        self.include_deleted
    }

    pub fn include_history(&self) -> bool {
        self.include_history
    }

    pub fn soft_limit(&self) -> Option<usize> {
        self.soft_limit
    }

    pub fn order(&self) -> ResultOrder {
        self.order
    }

    pub fn return_handle(&self) -> bool {
        self.return_handle
    }

    pub fn columns(&self) -> Columns {
        self.columns
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn versions(&self) -> Option<usize> {
        self.versions
    }

    /// Whether the soft limit may be pushed into the sub-selects.
    pub fn pushes_soft_limit(&self) -> bool {
        self.soft_limit.is_some()
            && self.order == ResultOrder::Deterministic
            && !self.return_handle
            && self.filters.is_empty()
            && self.versions.is_none()
    }
}

/// Builder for [`ReadRequest`].
#[derive(Debug, Clone)]
pub struct ReadRequestBuilder {
    request: ReadRequest,
}

impl ReadRequestBuilder {
    pub fn collection(mut self, id: &CollectionId) -> Self {
        self.request.collections.push(id.clone());
        self
    }

    pub fn collections<'a>(mut self, ids: impl IntoIterator<Item = &'a CollectionId>) -> Self {
        self.request.collections.extend(ids.into_iter().cloned());
        self
    }

    pub fn feature_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request
            .feature_ids
            .get_or_insert_with(Vec::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn guids(mut self, guids: impl IntoIterator<Item = Guid>) -> Self {
        self.request.guids.extend(guids);
        self
    }

    pub fn spatial(mut self, query: SpatialQuery) -> Self {
        self.request.spatial = Some(query);
        self
    }

    pub fn property(mut self, query: PropertyQuery) -> Self {
        self.request.property = Some(query);
        self
    }

    pub fn tags(mut self, query: TagQuery) -> Self {
        self.request.tags = Some(query);
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.request.include_deleted = include;
        self
    }

    pub fn include_history(mut self, include: bool) -> Self {
        self.request.include_history = include;
        self
    }

    pub fn soft_limit(mut self, limit: usize) -> Self {
        self.request.soft_limit = Some(limit);
        self
    }

    pub fn order(mut self, order: ResultOrder) -> Self {
        self.request.order = order;
        self
    }

    pub fn return_handle(mut self, handle: bool) -> Self {
        self.request.return_handle = handle;
        self
    }

    pub fn columns(mut self, columns: Columns) -> Self {
        self.request.columns = columns;
        self
    }

    pub fn filter(mut self, filter: impl TupleFilter + 'static) -> Self {
        self.request.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: FilterChain) -> Self {
        self.request.filters = filters;
        self
    }

    /// Maximum versions per feature; more than one needs history.
    pub fn versions(mut self, versions: usize) -> Self {
        self.request.versions = Some(versions);
        self
    }

    pub fn build(self) -> Result<ReadRequest> {
        let r = self.request;
        if r.collections.is_empty() {
            return Err(Error::illegal_argument("read request names no collection"));
        }
        if r.soft_limit == Some(0) {
            return Err(Error::illegal_argument("soft limit must be positive"));
        }
        match r.versions {
            Some(0) => return Err(Error::illegal_argument("versions must be positive")),
            Some(v) if v > 1 && !r.include_history => {
                return Err(Error::illegal_argument(format!(
                    "{v} versions per feature requested without history"
                )))
            }
            _ => {}
        }
        if let Some(property) = &r.property {
            validate_property(property)?;
        }
        Ok(r)
    }
}

fn validate_property(query: &PropertyQuery) -> Result<()> {
    match query {
        PropertyQuery::Compare { property, op, value } => {
            if *op == CmpOp::StartsWith && !value.is_string() {
                return Err(Error::illegal_argument(format!(
                    "prefix match on {property:?} needs a string, got {value}"
                )));
            }
            if let PropertyRef::Feature(path) = property {
                if path.is_empty() || path.iter().any(String::is_empty) {
                    return Err(Error::illegal_argument("empty feature path segment"));
                }
            }
            if value.is_array() || value.is_object() {
                return Err(Error::unsupported(format!(
                    "comparison of {property:?} with a structured value"
                )));
            }
            Ok(())
        }
        PropertyQuery::IsNull(_) => Ok(()),
        PropertyQuery::Not(inner) => validate_property(inner),
        PropertyQuery::And(terms) | PropertyQuery::Or(terms) => {
            terms.iter().try_for_each(validate_property)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> ReadRequestBuilder {
        ReadRequest::builder(&MapId::new("m")).collection(&CollectionId::new("c"))
    }

    #[test]
    fn test_requires_collections() {
        let err = ReadRequest::builder(&MapId::new("m")).build().unwrap_err();
        assert!(matches!(err, Error::IllegalArgument(_)));
    }

    #[test]
    fn test_versions_need_history() {
        assert!(matches!(
            base().versions(3).build(),
            Err(Error::IllegalArgument(_))
        ));
        assert!(base().versions(3).include_history(true).build().is_ok());
        assert!(base().versions(1).build().is_ok());
    }

    #[test]
    fn test_property_validation() {
        let bad_prefix = PropertyQuery::compare(PropertyRef::path("properties.name"), CmpOp::StartsWith, 3);
        assert!(matches!(
            base().property(bad_prefix).build(),
            Err(Error::IllegalArgument(_))
        ));
        let structured = PropertyQuery::compare(PropertyRef::path("properties"), CmpOp::Eq, json!({"a": 1}));
        assert!(matches!(
            base().property(structured.not()).build(),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_soft_limit_pushdown_rules() {
        assert!(base().soft_limit(10).build().unwrap().pushes_soft_limit());
        assert!(!base().soft_limit(10).return_handle(true).build().unwrap().pushes_soft_limit());
        assert!(!base().soft_limit(10).order(ResultOrder::Version).build().unwrap().pushes_soft_limit());
        assert!(!base()
            .soft_limit(10)
            .filter(crate::filter::filter_fn(Some))
            .build()
            .unwrap()
            .pushes_soft_limit());
        assert!(!base().build().unwrap().pushes_soft_limit());
    }
}
