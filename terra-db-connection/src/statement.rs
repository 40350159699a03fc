//! Statement model shared by the engines and the drivers.
//!
//! Every statement carries the SQL text a relational server would execute
//! together with the structured form it was rendered from. Remote drivers
//! send `sql` + parameters; the in-memory engine interprets the structure.

use geo_types::Geometry;
use serde_json::Value as JsonValue;
use std::fmt;
use terra_db_core::{Columns, CollectionRef, Partition, Tuple, TupleAddress, Version};

// ============================================================================
// Tables
// ============================================================================

/// The three logical tables of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    /// Current state, one row per live feature
    Head,
    /// Last state of deleted-but-not-purged features
    Deleted,
    /// Append-only previous states
    History,
}

impl TableKind {
    pub fn suffix(self) -> &'static str {
        match self {
            TableKind::Head => "",
            TableKind::Deleted => "$del",
            TableKind::History => "$hst",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Head => f.write_str("head"),
            TableKind::Deleted => f.write_str("del"),
            TableKind::History => f.write_str("hst"),
        }
    }
}

/// Quoted physical table name: `"{map}.{collection}{suffix}"`, with a
/// `$p{NNN}` partition suffix when the collection has several partitions.
pub fn table_name(collection: &CollectionRef, table: TableKind, partition: Option<Partition>) -> String {
    let mut name = format!("{}{}", collection.table_base(), table.suffix());
    if let Some(p) = partition {
        if collection.config.partition_count > 1 {
            name.push_str(&format!("$p{p:03}"));
        }
    }
    format!("\"{}\"", name.replace('"', "\"\""))
}

const TUPLE_COLUMNS_META: &str =
    "id, version, uid, flags, partition, created_at, updated_at, author_ts, prev_version, puid, \
     next_version, hash, geo_grid, app_id, author, type, change_count";
const TUPLE_COLUMNS: &str =
    "id, version, uid, flags, partition, created_at, updated_at, author_ts, prev_version, puid, \
     next_version, hash, geo_grid, app_id, author, type, change_count, feature, geo, ref_point, tags";

// ============================================================================
// Writes
// ============================================================================

/// Prepared statement kind of a write batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatementKind {
    /// Plain insert; a duplicate key is a unique violation
    Insert,
    /// Insert or replace
    Upsert,
    /// Replace the row only if it is still at the expected position
    UpdateIf,
    /// Remove the row only if it is still at the expected position
    DeleteIf,
    /// Remove the row if present
    Delete,
}

/// One row of a write batch.
#[derive(Debug, Clone)]
pub struct RowMutation {
    /// Target feature id
    pub id: String,
    /// New row content (`Insert`, `Upsert`, `UpdateIf`)
    pub tuple: Option<Tuple>,
    /// Expected `(version, uid)` of the current row (`UpdateIf`, `DeleteIf`)
    pub expected: Option<(Version, i32)>,
}

impl RowMutation {
    pub fn write(tuple: Tuple) -> Self {
        Self {
            id: tuple.meta.id.clone(),
            tuple: Some(tuple),
            expected: None,
        }
    }

    pub fn update_if(tuple: Tuple, expected: (Version, i32)) -> Self {
        Self {
            id: tuple.meta.id.clone(),
            tuple: Some(tuple),
            expected: Some(expected),
        }
    }

    pub fn delete_if(id: impl Into<String>, expected: (Version, i32)) -> Self {
        Self {
            id: id.into(),
            tuple: None,
            expected: Some(expected),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tuple: None,
            expected: None,
        }
    }
}

/// Per-row result code of a batch execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// Executed; number of affected rows (0 = condition not met / nothing to delete)
    Applied(u64),
    /// Insert hit an existing key (or a row owned by another open transaction)
    UniqueViolation,
    /// Driver-level failure for this row
    Failed(String),
}

impl RowOutcome {
    pub fn affected(&self) -> u64 {
        match self {
            RowOutcome::Applied(n) => *n,
            _ => 0,
        }
    }
}

/// A homogeneous bulk statement against one physical table.
#[derive(Debug, Clone)]
pub struct TableBatch {
    pub collection: CollectionRef,
    pub table: TableKind,
    pub partition: Partition,
    pub kind: StatementKind,
    pub sql: String,
    pub rows: Vec<RowMutation>,
}

impl TableBatch {
    pub fn new(
        collection: CollectionRef,
        table: TableKind,
        partition: Partition,
        kind: StatementKind,
    ) -> Self {
        let sql = render_write_sql(&collection, table, partition, kind);
        Self {
            collection,
            table,
            partition,
            kind,
            sql,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: RowMutation) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn render_write_sql(
    collection: &CollectionRef,
    table: TableKind,
    partition: Partition,
    kind: StatementKind,
) -> String {
    let name = table_name(collection, table, Some(partition));
    let placeholders = (1..=21).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ");
    match kind {
        StatementKind::Insert => {
            format!("INSERT INTO {name} ({TUPLE_COLUMNS}) VALUES ({placeholders})")
        }
        StatementKind::Upsert => format!(
            "INSERT INTO {name} ({TUPLE_COLUMNS}) VALUES ({placeholders}) \
             ON CONFLICT (id) DO UPDATE SET ({TUPLE_COLUMNS}) = ({placeholders})"
        ),
        StatementKind::UpdateIf => format!(
            "UPDATE {name} SET ({TUPLE_COLUMNS}) = ({placeholders}) \
             WHERE id = $1 AND version = $22 AND uid = $23"
        ),
        StatementKind::DeleteIf => {
            format!("DELETE FROM {name} WHERE id = $1 AND version = $2 AND uid = $3")
        }
        StatementKind::Delete => format!("DELETE FROM {name} WHERE id = $1"),
    }
}

/// Bulk lookup of rows by feature id in one table partition.
#[derive(Debug, Clone)]
pub struct LookupStatement {
    pub collection: CollectionRef,
    pub table: TableKind,
    pub partition: Partition,
    pub ids: Vec<String>,
    pub sql: String,
}

impl LookupStatement {
    pub fn new(collection: CollectionRef, table: TableKind, partition: Partition, ids: Vec<String>) -> Self {
        let sql = format!(
            "SELECT {TUPLE_COLUMNS} FROM {} WHERE id = ANY($1)",
            table_name(&collection, table, Some(partition))
        );
        Self {
            collection,
            table,
            partition,
            ids,
            sql,
        }
    }
}

// ============================================================================
// Reads
// ============================================================================

/// Metadata columns addressable by property predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaColumn {
    Id,
    Version,
    Uid,
    CreatedAt,
    UpdatedAt,
    AuthorTs,
    Author,
    AppId,
    Type,
    ChangeCount,
    GeoGrid,
    Hash,
}

impl MetaColumn {
    pub fn sql_name(self) -> &'static str {
        match self {
            MetaColumn::Id => "id",
            MetaColumn::Version => "version",
            MetaColumn::Uid => "uid",
            MetaColumn::CreatedAt => "created_at",
            MetaColumn::UpdatedAt => "updated_at",
            MetaColumn::AuthorTs => "author_ts",
            MetaColumn::Author => "author",
            MetaColumn::AppId => "app_id",
            MetaColumn::Type => "type",
            MetaColumn::ChangeCount => "change_count",
            MetaColumn::GeoGrid => "geo_grid",
            MetaColumn::Hash => "hash",
        }
    }
}

/// Comparison operator of property/tag predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    StartsWith,
}

impl CmpOp {
    pub fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::StartsWith => "^@",
        }
    }
}

/// Lowered WHERE clause of one sub-select.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// No restriction
    True,
    /// `id = ANY($ids)`
    IdIn(Vec<String>),
    /// `(id, version, uid) = (...)`, OR-combined
    GuidIn(Vec<(String, Version, i32)>),
    /// `ST_Intersects(geo, $geometry)`
    Intersects(Geometry<f64>),
    /// Metadata column comparison. A `Null` value with `Eq`/`Ne` means
    /// `IS NULL`/`IS NOT NULL`.
    Meta {
        column: MetaColumn,
        op: CmpOp,
        value: JsonValue,
    },
    /// Comparison on a member path of the feature document
    FeaturePath {
        path: Vec<String>,
        op: CmpOp,
        value: JsonValue,
    },
    /// `tags ? $name`
    TagExists(String),
    /// `tags ->> $name <op> $value`
    Tag {
        name: String,
        op: CmpOp,
        value: String,
    },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// AND-combine, dropping `True` terms.
    pub fn and_all(terms: Vec<Predicate>) -> Predicate {
        let mut terms: Vec<Predicate> = terms.into_iter().filter(|p| *p != Predicate::True).collect();
        match terms.len() {
            0 => Predicate::True,
            1 => terms.remove(0),
            _ => Predicate::And(terms),
        }
    }

    /// Whether evaluating this predicate needs the feature payload.
    pub fn needs_feature(&self) -> bool {
        match self {
            Predicate::FeaturePath { .. } => true,
            Predicate::Not(inner) => inner.needs_feature(),
            Predicate::And(terms) | Predicate::Or(terms) => terms.iter().any(Predicate::needs_feature),
            _ => false,
        }
    }
}

/// One member of the read union.
#[derive(Debug, Clone)]
pub struct SubSelect {
    pub collection: CollectionRef,
    pub table: TableKind,
    pub predicate: Predicate,
    /// Soft limit pushed down into the sub-select
    pub limit: Option<usize>,
}

/// Structured form of a read query.
#[derive(Debug, Clone)]
pub struct ReadPlan {
    pub selects: Vec<SubSelect>,
    /// Emit an outer ORDER BY in storage order
    pub order_by_storage: bool,
    /// Keep at most this many newest versions per feature
    pub max_versions: Option<usize>,
    /// Outer ceiling
    pub hard_cap: usize,
}

/// Bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Int4(i32),
    Int8(i64),
    Text(String),
    TextArray(Vec<String>),
    /// Encoded geometry (WKT bytes)
    Geometry(Vec<u8>),
    Json(JsonValue),
}

/// A read query returning a compressed address blob.
#[derive(Debug, Clone)]
pub struct ReadStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub plan: ReadPlan,
}

/// Fetch of full (or projected) tuples by address.
#[derive(Debug, Clone)]
pub struct FetchStatement {
    pub sql: String,
    pub addresses: Vec<TupleAddress>,
    pub columns: Columns,
}

impl FetchStatement {
    /// Addresses travel as one packed blob parameter; the server-side
    /// function resolves them across head, deleted and history tables.
    pub fn new(addresses: Vec<TupleAddress>, columns: Columns) -> Self {
        let mut select = vec![TUPLE_COLUMNS_META];
        if columns.feature {
            select.push("feature");
        }
        if columns.geometry {
            select.push("geo");
        }
        if columns.reference_point {
            select.push("ref_point");
        }
        if columns.tags {
            select.push("tags");
        }
        let sql = format!("SELECT {} FROM terra_fetch_tuples($1)", select.join(", "));
        Self {
            sql,
            addresses,
            columns,
        }
    }
}
