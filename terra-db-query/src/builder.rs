//! Lowering of [`ReadRequest`]s into address-only read statements.
//!
//! Each requested collection contributes one sub-select per table (head,
//! and when asked for, deleted shadow and history). The sub-selects are
//! joined with a de-duplicating `UNION`, optionally thinned to the newest
//! versions per feature, ordered in storage order when the result must be
//! reproducible, and capped. Limits and the cap ask for one row more than
//! they keep, so the result set can tell a cut sequence from an exact fit.
//! The statement returns a single compressed blob of tuple addresses;
//! payloads are fetched separately.

use crate::request::{PropertyQuery, PropertyRef, ReadRequest, SpatialQuery, TagQuery};
use rustc_hash::FxHashMap;
use serde_json::Value as JsonValue;
use terra_db_connection::{
    table_name, CmpOp, Connection, Predicate, ReadPlan, ReadStatement, SqlParam, SubSelect,
    TableKind,
};
use terra_db_core::geometry::to_wkt;
use terra_db_core::{Catalog, CollectionRef, Error, Guid, Result, TupleAddress, Version};

const ADDRESS_COLUMNS: &str = "map_no, coll_no, partition, version, uid, flags, id";
const STORAGE_ORDER: &str = "map_no, coll_no, partition, version, uid";

/// A built read statement plus what the result set needs to know about it.
#[derive(Debug, Clone)]
pub struct BuiltQuery {
    pub statement: ReadStatement,
    /// Soft limit pushed into every sub-select, if any
    pub soft_limit_pushed: Option<usize>,
    /// Addresses kept at most; the statement asks for one more
    pub hard_cap: usize,
}

impl BuiltQuery {
    /// Run the statement and unpack the address blob it returns.
    pub async fn execute(&self, conn: &mut dyn Connection) -> Result<Vec<TupleAddress>> {
        let blob = conn.query_addresses(&self.statement).await?;
        TupleAddress::unpack_blob(&blob)
    }
}

/// Builds read statements against one storage's catalog.
#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder<'a> {
    catalog: &'a Catalog,
    storage_id: &'a str,
    hard_cap: usize,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(catalog: &'a Catalog, storage_id: &'a str, hard_cap: usize) -> Self {
        Self {
            catalog,
            storage_id,
            hard_cap,
        }
    }

    pub fn build(&self, request: &ReadRequest) -> Result<BuiltQuery> {
        let collections = request
            .collections()
            .iter()
            .map(|id| self.catalog.resolve(request.map(), id))
            .collect::<Result<Vec<_>>>()?;
        let wants_history =
            request.include_history() || request.versions().is_some_and(|v| v > 1);
        if let Some(plain) = collections.iter().find(|c| wants_history && !c.config.history) {
            return Err(Error::illegal_argument(format!(
                "collection '{}' keeps no history",
                plain.id
            )));
        }
        let guids = self.guids_by_collection(request, &collections)?;

        let pushed = request.pushes_soft_limit().then(|| request.soft_limit()).flatten();
        let mut tables = vec![TableKind::Head];
        if request.include_deleted() {
            tables.push(TableKind::Deleted);
        }
        if request.include_history() {
            tables.push(TableKind::History);
        }

        let shared = shared_terms(request);
        let mut selects = Vec::new();
        for collection in &collections {
            let mut terms = shared.clone();
            if !request.guids().is_empty() {
                match guids.get(collection.id.as_str()) {
                    Some(targets) => terms.push(Predicate::GuidIn(targets.clone())),
                    // guids name other collections only
                    None => continue,
                }
            }
            let predicate = Predicate::and_all(terms);
            for &table in &tables {
                selects.push(SubSelect {
                    collection: collection.clone(),
                    table,
                    predicate: predicate.clone(),
                    limit: pushed.map(|limit| limit.saturating_add(1)),
                });
            }
        }

        let plan = ReadPlan {
            selects,
            order_by_storage: pushed.is_none(),
            max_versions: request.versions(),
            hard_cap: self.hard_cap.saturating_add(1),
        };
        let (sql, params) = render(&plan);
        tracing::debug!(
            selects = plan.selects.len(),
            params = params.len(),
            soft_limit = ?pushed,
            "read statement built"
        );
        Ok(BuiltQuery {
            statement: ReadStatement { sql, params, plan },
            soft_limit_pushed: pushed,
            hard_cap: self.hard_cap,
        })
    }

    /// Group requested guids by collection, rejecting foreign ones.
    fn guids_by_collection(
        &self,
        request: &ReadRequest,
        collections: &[CollectionRef],
    ) -> Result<FxHashMap<String, Vec<(String, Version, i32)>>> {
        let mut grouped: FxHashMap<String, Vec<(String, Version, i32)>> = FxHashMap::default();
        for guid in request.guids() {
            self.check_guid(guid, collections)?;
            grouped
                .entry(guid.collection_id.to_string())
                .or_default()
                .push((guid.feature_id.to_string(), guid.version(), guid.locator.uid));
        }
        Ok(grouped)
    }

    fn check_guid(&self, guid: &Guid, collections: &[CollectionRef]) -> Result<()> {
        if &*guid.storage_id != self.storage_id {
            return Err(Error::illegal_argument(format!(
                "guid {guid} belongs to storage '{}', not '{}'",
                guid.storage_id, self.storage_id
            )));
        }
        if !collections.iter().any(|c| c.id.as_str() == &*guid.collection_id) {
            return Err(Error::illegal_argument(format!(
                "guid {guid} names a collection outside the request"
            )));
        }
        Ok(())
    }
}

/// Terms applied to every collection alike.
fn shared_terms(request: &ReadRequest) -> Vec<Predicate> {
    let mut terms = Vec::new();
    if let Some(ids) = request.feature_ids() {
        terms.push(Predicate::IdIn(ids.to_vec()));
    }
    if let Some(spatial) = request.spatial() {
        terms.push(lower_spatial(spatial));
    }
    if let Some(property) = request.property() {
        terms.push(lower_property(property));
    }
    if let Some(tags) = request.tags() {
        terms.push(lower_tags(tags));
    }
    terms
}

fn lower_spatial(query: &SpatialQuery) -> Predicate {
    match query {
        SpatialQuery::Intersects(geometry) => Predicate::Intersects(geometry.clone()),
        SpatialQuery::Not(inner) => Predicate::Not(Box::new(lower_spatial(inner))),
        SpatialQuery::And(terms) => Predicate::And(terms.iter().map(lower_spatial).collect()),
        SpatialQuery::Or(terms) => Predicate::Or(terms.iter().map(lower_spatial).collect()),
    }
}

fn lower_property(query: &PropertyQuery) -> Predicate {
    match query {
        PropertyQuery::Compare {
            property,
            op,
            value,
        } => compare(property, *op, value.clone()),
        PropertyQuery::IsNull(property) => compare(property, CmpOp::Eq, JsonValue::Null),
        PropertyQuery::Not(inner) => Predicate::Not(Box::new(lower_property(inner))),
        PropertyQuery::And(terms) => Predicate::And(terms.iter().map(lower_property).collect()),
        PropertyQuery::Or(terms) => Predicate::Or(terms.iter().map(lower_property).collect()),
    }
}

fn compare(property: &PropertyRef, op: CmpOp, value: JsonValue) -> Predicate {
    match property {
        PropertyRef::Meta(column) => Predicate::Meta {
            column: *column,
            op,
            value,
        },
        PropertyRef::Feature(path) => Predicate::FeaturePath {
            path: path.clone(),
            op,
            value,
        },
    }
}

fn lower_tags(query: &TagQuery) -> Predicate {
    match query {
        TagQuery::Exists(name) => Predicate::TagExists(name.clone()),
        TagQuery::Equals(name, value) => Predicate::Tag {
            name: name.clone(),
            op: CmpOp::Eq,
            value: value.clone(),
        },
        TagQuery::Not(inner) => Predicate::Not(Box::new(lower_tags(inner))),
        TagQuery::And(terms) => Predicate::And(terms.iter().map(lower_tags).collect()),
        TagQuery::Or(terms) => Predicate::Or(terms.iter().map(lower_tags).collect()),
    }
}

// ============================================================================
// SQL rendering
// ============================================================================

/// Positional parameter sink.
#[derive(Default)]
struct Params {
    values: Vec<SqlParam>,
}

impl Params {
    fn bind(&mut self, param: SqlParam) -> String {
        self.values.push(param);
        format!("${}", self.values.len())
    }
}

fn render(plan: &ReadPlan) -> (String, Vec<SqlParam>) {
    let mut params = Params::default();
    let union = if plan.selects.is_empty() {
        // typed empty relation
        format!("SELECT {ADDRESS_COLUMNS} FROM terra_empty_addresses()")
    } else {
        plan.selects
            .iter()
            .map(|select| format!("({})", render_select(select, &mut params)))
            .collect::<Vec<_>>()
            .join(" UNION ")
    };

    let inner = match plan.max_versions {
        Some(max) => {
            let max = params.bind(SqlParam::Int8(max as i64));
            format!(
                "SELECT {ADDRESS_COLUMNS} FROM (SELECT u.*, ROW_NUMBER() OVER \
                 (PARTITION BY map_no, coll_no, id ORDER BY version DESC, uid DESC) AS rn \
                 FROM ({union}) u) r WHERE rn <= {max}"
            )
        }
        None => union,
    };

    let order = if plan.order_by_storage {
        format!(" ORDER BY {STORAGE_ORDER}")
    } else {
        String::new()
    };
    let sql = format!(
        "WITH q AS ({inner}) \
         SELECT terra_pack_addresses(map_no, coll_no, partition, version, uid, flags) \
         FROM (SELECT * FROM q{order} LIMIT {}) s",
        plan.hard_cap
    );
    (sql, params.values)
}

fn render_select(select: &SubSelect, params: &mut Params) -> String {
    let collection = &select.collection;
    let mut sql = format!(
        "SELECT {}::int4 AS map_no, {}::int8 AS coll_no, partition, version, uid, flags, id \
         FROM {} WHERE {}",
        collection.map.0,
        collection.number.0,
        table_name(collection, select.table, None),
        render_predicate(&select.predicate, params)
    );
    if let Some(limit) = select.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    sql
}

fn render_predicate(predicate: &Predicate, params: &mut Params) -> String {
    match predicate {
        Predicate::True => "TRUE".to_string(),
        Predicate::IdIn(ids) => {
            format!("id = ANY({})", params.bind(SqlParam::TextArray(ids.clone())))
        }
        Predicate::GuidIn(targets) => {
            if targets.is_empty() {
                return "FALSE".to_string();
            }
            let alternatives: Vec<String> = targets
                .iter()
                .map(|(id, version, uid)| {
                    format!(
                        "(id, version, uid) = ({}, {}, {})",
                        params.bind(SqlParam::Text(id.clone())),
                        params.bind(SqlParam::Int8(version.0)),
                        params.bind(SqlParam::Int4(*uid))
                    )
                })
                .collect();
            format!("({})", alternatives.join(" OR "))
        }
        Predicate::Intersects(geometry) => {
            let wkt = to_wkt(geometry).into_bytes();
            format!(
                "ST_Intersects(geo, ST_GeomFromText({}))",
                params.bind(SqlParam::Geometry(wkt))
            )
        }
        Predicate::Meta { column, op, value } => {
            render_comparison(column.sql_name().to_string(), *op, value, params)
        }
        Predicate::FeaturePath { path, op, value } => {
            let path = params.bind(SqlParam::TextArray(path.clone()));
            let lhs = if value.is_number() && *op != CmpOp::StartsWith {
                format!("(feature #>> {path})::numeric")
            } else {
                format!("feature #>> {path}")
            };
            render_comparison(lhs, *op, value, params)
        }
        Predicate::TagExists(name) => {
            format!("tags ? {}", params.bind(SqlParam::Text(name.clone())))
        }
        Predicate::Tag { name, op, value } => {
            let name = params.bind(SqlParam::Text(name.clone()));
            let value = params.bind(SqlParam::Text(value.clone()));
            format!("tags ->> {name} {} {value}", op.sql())
        }
        Predicate::Not(inner) => format!("NOT ({})", render_predicate(inner, params)),
        Predicate::And(terms) => render_junction(terms, " AND ", "TRUE", params),
        Predicate::Or(terms) => render_junction(terms, " OR ", "FALSE", params),
    }
}

fn render_junction(terms: &[Predicate], joiner: &str, empty: &str, params: &mut Params) -> String {
    if terms.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<String> = terms.iter().map(|t| render_predicate(t, params)).collect();
    format!("({})", rendered.join(joiner))
}

fn render_comparison(lhs: String, op: CmpOp, value: &JsonValue, params: &mut Params) -> String {
    if value.is_null() {
        return match op {
            CmpOp::Ne => format!("{lhs} IS NOT NULL"),
            CmpOp::Eq => format!("{lhs} IS NULL"),
            // SQL comparison with NULL never holds
            _ => "FALSE".to_string(),
        };
    }
    let param = match value {
        JsonValue::String(s) => SqlParam::Text(s.clone()),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlParam::Int8(i),
            None => SqlParam::Json(value.clone()),
        },
        other => SqlParam::Json(other.clone()),
    };
    format!("{lhs} {} {}", op.sql(), params.bind(param))
}
