//! In-memory relational engine.
//!
//! Reference [`Driver`] used by tests and embedded deployments. Committed
//! rows live in one ordered map per `(collection, table)`. Each connection
//! stages its writes in a private overlay that only it can see; commit
//! merges the overlay, rollback (or dropping the connection) discards it.
//!
//! A row staged by one connection is owned by it until commit or rollback.
//! Other connections that try to write an owned row get the outcome a
//! relational server reports after losing a race: a unique violation for
//! inserts, "0 rows" for conditional statements.

use crate::driver::{Connection, Driver};
use crate::statement::{
    CmpOp, FetchStatement, LookupStatement, MetaColumn, Predicate, ReadStatement, RowMutation,
    RowOutcome, StatementKind, TableBatch, TableKind,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use terra_db_core::geometry::intersects;
use terra_db_core::{
    CollectionNumber, CollectionRef, MapNumber, Partition, Result, Tuple, TupleAddress, Version,
};

type TableKey = (MapNumber, CollectionNumber, TableKind);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RowKey {
    partition: Partition,
    id: String,
    /// `(version, uid)` for history rows; head and deleted rows are keyed by id
    position: Option<(i64, i32)>,
}

type CellKey = (TableKey, RowKey);

#[derive(Default)]
struct EngineState {
    committed: FxHashMap<TableKey, BTreeMap<RowKey, Tuple>>,
    /// Staged writes per connection; `None` stages a delete
    pending: FxHashMap<u64, BTreeMap<CellKey, Option<Tuple>>>,
    owners: FxHashMap<CellKey, u64>,
}

impl EngineState {
    fn current(&self, conn: u64, cell: &CellKey) -> Option<&Tuple> {
        if let Some(staged) = self.pending.get(&conn).and_then(|p| p.get(cell)) {
            return staged.as_ref();
        }
        self.committed.get(&cell.0).and_then(|rows| rows.get(&cell.1))
    }

    /// Rows of one table as seen by `conn`, in key order.
    fn visible(&self, conn: u64, table: TableKey) -> Vec<&Tuple> {
        let mut merged: BTreeMap<&RowKey, Option<&Tuple>> = BTreeMap::new();
        if let Some(rows) = self.committed.get(&table) {
            merged.extend(rows.iter().map(|(k, t)| (k, Some(t))));
        }
        if let Some(staged) = self.pending.get(&conn) {
            for ((table_key, row_key), value) in staged {
                if *table_key == table {
                    merged.insert(row_key, value.as_ref());
                }
            }
        }
        merged.into_values().flatten().collect()
    }

    fn stage(&mut self, conn: u64, cell: CellKey, value: Option<Tuple>) {
        self.owners.insert(cell.clone(), conn);
        self.pending.entry(conn).or_default().insert(cell, value);
    }

    fn owned_by_other(&self, conn: u64, cell: &CellKey) -> bool {
        self.owners.get(cell).is_some_and(|owner| *owner != conn)
    }

    fn release(&mut self, conn: u64) -> Option<BTreeMap<CellKey, Option<Tuple>>> {
        let staged = self.pending.remove(&conn)?;
        for cell in staged.keys() {
            if self.owners.get(cell) == Some(&conn) {
                self.owners.remove(cell);
            }
        }
        Some(staged)
    }
}

struct MemoryEngine {
    storage_id: String,
    version_seq: AtomicI64,
    next_connection: AtomicU64,
    state: RwLock<EngineState>,
    fail_next: Mutex<Option<TableKind>>,
    connects: AtomicU64,
    fetches: AtomicU64,
}

/// In-memory storage driver.
#[derive(Clone)]
pub struct MemoryDriver {
    engine: Arc<MemoryEngine>,
}

impl Debug for MemoryDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.engine.state.read();
        f.debug_struct("MemoryDriver")
            .field("storage_id", &self.engine.storage_id)
            .field("table_count", &state.committed.len())
            .field("open_transactions", &state.pending.len())
            .finish()
    }
}

impl MemoryDriver {
    pub fn new(storage_id: impl Into<String>) -> Self {
        Self {
            engine: Arc::new(MemoryEngine {
                storage_id: storage_id.into(),
                version_seq: AtomicI64::new(0),
                next_connection: AtomicU64::new(1),
                state: RwLock::new(EngineState::default()),
                fail_next: Mutex::new(None),
                connects: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Make the next batch against `table` fail every row with a driver error.
    pub fn inject_batch_failure(&self, table: TableKind) {
        *self.engine.fail_next.lock() = Some(table);
    }

    /// Committed rows of one collection table, in storage key order.
    pub fn committed_rows(&self, collection: &CollectionRef, table: TableKind) -> Vec<Tuple> {
        let state = self.engine.state.read();
        state
            .committed
            .get(&(collection.map, collection.number, table))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of connections opened so far.
    pub fn connect_count(&self) -> u64 {
        self.engine.connects.load(AtomicOrdering::Relaxed)
    }

    /// Number of fetch statements executed so far.
    pub fn fetch_count(&self) -> u64 {
        self.engine.fetches.load(AtomicOrdering::Relaxed)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn storage_id(&self) -> &str {
        &self.engine.storage_id
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.engine.connects.fetch_add(1, AtomicOrdering::Relaxed);
        let id = self.engine.next_connection.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(Box::new(MemoryConnection {
            id,
            engine: Arc::clone(&self.engine),
        }))
    }
}

/// One session against a [`MemoryDriver`].
pub struct MemoryConnection {
    id: u64,
    engine: Arc<MemoryEngine>,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection").field("id", &self.id).finish()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.engine.state.write().release(self.id);
    }
}

impl MemoryConnection {
    fn apply_row(
        &self,
        state: &mut EngineState,
        table: TableKey,
        partition: Partition,
        kind: StatementKind,
        row: &RowMutation,
    ) -> RowOutcome {
        let position = match (table.2, &row.tuple) {
            (TableKind::History, Some(tuple)) => Some((tuple.meta.version.0, tuple.meta.uid)),
            (TableKind::History, None) => {
                return RowOutcome::Failed("history rows are addressed by tuple".to_string())
            }
            _ => None,
        };
        let cell: CellKey = (
            table,
            RowKey {
                partition,
                id: row.id.clone(),
                position,
            },
        );

        if state.owned_by_other(self.id, &cell) {
            return match kind {
                StatementKind::Insert => RowOutcome::UniqueViolation,
                _ => RowOutcome::Applied(0),
            };
        }

        let current_position = state
            .current(self.id, &cell)
            .map(|t| (t.meta.version, t.meta.uid));
        let matches_expected = |expected: Option<(Version, i32)>| {
            expected.is_some() && current_position.is_some() && current_position == expected
        };

        match kind {
            StatementKind::Insert => {
                if current_position.is_some() {
                    return RowOutcome::UniqueViolation;
                }
                state.stage(self.id, cell, row.tuple.clone());
                RowOutcome::Applied(1)
            }
            StatementKind::Upsert => {
                state.stage(self.id, cell, row.tuple.clone());
                RowOutcome::Applied(1)
            }
            StatementKind::UpdateIf => {
                if !matches_expected(row.expected) {
                    return RowOutcome::Applied(0);
                }
                state.stage(self.id, cell, row.tuple.clone());
                RowOutcome::Applied(1)
            }
            StatementKind::DeleteIf => {
                if !matches_expected(row.expected) {
                    return RowOutcome::Applied(0);
                }
                state.stage(self.id, cell, None);
                RowOutcome::Applied(1)
            }
            StatementKind::Delete => {
                if current_position.is_none() {
                    return RowOutcome::Applied(0);
                }
                state.stage(self.id, cell, None);
                RowOutcome::Applied(1)
            }
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn next_version(&mut self) -> Result<Version> {
        let v = self.engine.version_seq.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        Ok(Version(v))
    }

    async fn lookup(&mut self, statement: &LookupStatement) -> Result<Vec<Tuple>> {
        let table = (
            statement.collection.map,
            statement.collection.number,
            statement.table,
        );
        let state = self.engine.state.read();
        let rows = statement
            .ids
            .iter()
            .filter_map(|id| {
                let cell = (
                    table,
                    RowKey {
                        partition: statement.partition,
                        id: id.clone(),
                        position: None,
                    },
                );
                state.current(self.id, &cell).cloned()
            })
            .collect();
        Ok(rows)
    }

    async fn execute_batch(&mut self, batch: &TableBatch) -> Result<Vec<RowOutcome>> {
        let injected = {
            let mut fail = self.engine.fail_next.lock();
            if *fail == Some(batch.table) {
                fail.take()
            } else {
                None
            }
        };
        if injected.is_some() {
            return Ok(batch
                .rows
                .iter()
                .map(|_| RowOutcome::Failed("injected batch failure".to_string()))
                .collect());
        }

        let table = (batch.collection.map, batch.collection.number, batch.table);
        let mut state = self.engine.state.write();
        let outcomes: Vec<RowOutcome> = batch
            .rows
            .iter()
            .map(|row| self.apply_row(&mut state, table, batch.partition, batch.kind, row))
            .collect();
        tracing::trace!(
            table = %batch.table,
            kind = ?batch.kind,
            rows = outcomes.len(),
            "memory batch executed"
        );
        Ok(outcomes)
    }

    async fn query_addresses(&mut self, statement: &ReadStatement) -> Result<Vec<u8>> {
        let plan = &statement.plan;
        let state = self.engine.state.read();
        let mut seen: FxHashSet<TupleAddress> = FxHashSet::default();
        let mut matched: Vec<&Tuple> = Vec::new();

        for select in &plan.selects {
            let table = (select.collection.map, select.collection.number, select.table);
            let mut taken = 0usize;
            for tuple in state.visible(self.id, table) {
                if select.limit.is_some_and(|limit| taken >= limit) {
                    break;
                }
                if !evaluate(&select.predicate, tuple)? {
                    continue;
                }
                taken += 1;
                if seen.insert(tuple.address) {
                    matched.push(tuple);
                }
            }
        }

        if let Some(max) = plan.max_versions {
            matched = newest_versions(matched, max);
        }
        let mut out: Vec<TupleAddress> = matched.iter().map(|t| t.address).collect();
        if plan.order_by_storage {
            out.sort_by_key(TupleAddress::storage_key);
        }
        out.truncate(plan.hard_cap);
        TupleAddress::pack_blob(&out)
    }

    async fn fetch(&mut self, statement: &FetchStatement) -> Result<Vec<Tuple>> {
        self.engine.fetches.fetch_add(1, AtomicOrdering::Relaxed);
        let wanted: FxHashSet<TupleAddress> = statement.addresses.iter().copied().collect();
        let collections: FxHashSet<(MapNumber, CollectionNumber)> =
            wanted.iter().map(|a| (a.map, a.collection)).collect();

        let state = self.engine.state.read();
        let mut found: FxHashMap<TupleAddress, Tuple> = FxHashMap::default();
        for (map, collection) in collections {
            for table in [TableKind::Head, TableKind::Deleted, TableKind::History] {
                for tuple in state.visible(self.id, (map, collection, table)) {
                    if wanted.contains(&tuple.address) && !found.contains_key(&tuple.address) {
                        found.insert(tuple.address, tuple.project(&statement.columns));
                    }
                }
            }
        }
        Ok(found.into_values().collect())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.engine.state.write();
        if let Some(staged) = state.release(self.id) {
            for ((table, row_key), value) in staged {
                let rows = state.committed.entry(table).or_default();
                match value {
                    Some(tuple) => {
                        rows.insert(row_key, tuple);
                    }
                    None => {
                        rows.remove(&row_key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.engine.state.write().release(self.id);
        Ok(())
    }
}

/// `ROW_NUMBER() OVER (PARTITION BY collection, id ORDER BY version DESC, uid DESC) <= max`,
/// keeping the input order of the survivors.
fn newest_versions<'a>(matched: Vec<&'a Tuple>, max: usize) -> Vec<&'a Tuple> {
    let mut per_feature: FxHashMap<(MapNumber, CollectionNumber, &str), Vec<(Version, i32)>> =
        FxHashMap::default();
    for tuple in matched.iter().copied() {
        per_feature
            .entry((tuple.address.map, tuple.address.collection, tuple.meta.id.as_str()))
            .or_default()
            .push((tuple.meta.version, tuple.meta.uid));
    }
    for positions in per_feature.values_mut() {
        positions.sort_unstable_by(|a, b| b.cmp(a));
        positions.truncate(max);
    }
    matched
        .into_iter()
        .filter(|t| {
            per_feature
                .get(&(t.address.map, t.address.collection, t.meta.id.as_str()))
                .is_some_and(|kept| kept.contains(&(t.meta.version, t.meta.uid)))
        })
        .collect()
}

// ============================================================================
// Predicate evaluation
// ============================================================================

fn evaluate(predicate: &Predicate, tuple: &Tuple) -> Result<bool> {
    Ok(match predicate {
        Predicate::True => true,
        Predicate::IdIn(ids) => ids.iter().any(|id| *id == tuple.meta.id),
        Predicate::GuidIn(targets) => targets.iter().any(|(id, version, uid)| {
            *id == tuple.meta.id && *version == tuple.meta.version && *uid == tuple.meta.uid
        }),
        Predicate::Intersects(geometry) => match tuple.decode_geometry()? {
            Some(stored) => intersects(&stored, geometry),
            None => false,
        },
        Predicate::Meta { column, op, value } => {
            compare(meta_value(tuple, *column).as_ref(), *op, value)
        }
        Predicate::FeaturePath { path, op, value } => {
            let document = tuple.decode_feature()?;
            let actual = document.as_ref().and_then(|doc| {
                path.iter()
                    .try_fold(doc, |current, segment| current.get(segment.as_str()))
            });
            compare(actual, *op, value)
        }
        Predicate::TagExists(name) => tuple
            .decode_tags_json()?
            .is_some_and(|tags| tags.get(name).is_some()),
        Predicate::Tag { name, op, value } => {
            let tags = tuple.decode_tags_json()?;
            let actual = tags.as_ref().and_then(|t| t.get(name));
            // a bare tag reads as the literal "true"
            let actual = actual.map(|v| match v {
                JsonValue::Bool(true) => JsonValue::String("true".to_string()),
                other => other.clone(),
            });
            compare(actual.as_ref(), *op, &JsonValue::String(value.clone()))
        }
        Predicate::Not(inner) => !evaluate(inner, tuple)?,
        Predicate::And(terms) => {
            for term in terms {
                if !evaluate(term, tuple)? {
                    return Ok(false);
                }
            }
            true
        }
        Predicate::Or(terms) => {
            for term in terms {
                if evaluate(term, tuple)? {
                    return Ok(true);
                }
            }
            false
        }
    })
}

fn meta_value(tuple: &Tuple, column: MetaColumn) -> Option<JsonValue> {
    let meta = &tuple.meta;
    Some(match column {
        MetaColumn::Id => JsonValue::from(meta.id.clone()),
        MetaColumn::Version => JsonValue::from(meta.version.0),
        MetaColumn::Uid => JsonValue::from(meta.uid),
        MetaColumn::CreatedAt => JsonValue::from(meta.created_at),
        MetaColumn::UpdatedAt => JsonValue::from(meta.updated_at),
        MetaColumn::AuthorTs => JsonValue::from(meta.author_ts),
        MetaColumn::Author => JsonValue::from(meta.author.clone()?),
        MetaColumn::AppId => JsonValue::from(meta.app_id.clone()),
        MetaColumn::Type => JsonValue::from(meta.feature_type.clone()?),
        MetaColumn::ChangeCount => JsonValue::from(meta.change_count),
        MetaColumn::GeoGrid => JsonValue::from(meta.geo_grid),
        MetaColumn::Hash => JsonValue::from(meta.hash.clone()),
    })
}

/// SQL comparison semantics: any comparison with a missing value is false,
/// except the explicit null checks.
fn compare(actual: Option<&JsonValue>, op: CmpOp, expected: &JsonValue) -> bool {
    let actual = actual.filter(|v| !v.is_null());
    if expected.is_null() {
        return match op {
            CmpOp::Eq => actual.is_none(),
            CmpOp::Ne => actual.is_some(),
            _ => false,
        };
    }
    let Some(actual) = actual else {
        return false;
    };
    match op {
        CmpOp::StartsWith => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(prefix)) => a.starts_with(prefix),
            _ => false,
        },
        CmpOp::Eq => json_cmp(actual, expected) == Some(Ordering::Equal),
        CmpOp::Ne => json_cmp(actual, expected).is_some_and(Ordering::is_ne),
        CmpOp::Lt => json_cmp(actual, expected).is_some_and(Ordering::is_lt),
        CmpOp::Le => json_cmp(actual, expected).is_some_and(Ordering::is_le),
        CmpOp::Gt => json_cmp(actual, expected).is_some_and(Ordering::is_gt),
        CmpOp::Ge => json_cmp(actual, expected).is_some_and(Ordering::is_ge),
    }
}

fn json_cmp(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        // text columns compared against numbers, as a cast would
        (JsonValue::String(x), JsonValue::Number(y)) => {
            x.parse::<f64>().ok()?.partial_cmp(&y.as_f64()?)
        }
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{ReadPlan, SubSelect};
    use serde_json::json;
    use terra_db_core::{
        Action, Catalog, CollectionConfig, CollectionId, Columns, Feature, MapId, Metadata,
        RowFlags, RowLocator,
    };

    fn collection() -> CollectionRef {
        Catalog::new()
            .register_collection(
                &MapId::new("m"),
                &CollectionId::new("c"),
                CollectionConfig::default(),
            )
            .unwrap()
    }

    fn tuple(collection: &CollectionRef, id: &str, version: i64, action: Action) -> Tuple {
        let feature = Feature::new(id).with_document(json!({"type": "Road", "lanes": version}));
        let payload = feature.encode(None).unwrap();
        let flags = payload.flags.with_action(action);
        let locator = RowLocator::new(Version(version), 0, flags);
        let address = TupleAddress::new(collection.map, collection.number, 0, locator);
        let meta = Metadata {
            id: id.to_string(),
            created_at: 0,
            updated_at: 0,
            author_ts: 0,
            version: Version(version),
            uid: 0,
            prev_version: None,
            puid: None,
            next_version: None,
            hash: String::new(),
            geo_grid: 0,
            flags,
            app_id: "test".into(),
            author: None,
            feature_type: Some("Road".into()),
            change_count: 1,
        };
        Tuple::from_payload(address, meta, &payload)
    }

    fn insert(collection: &CollectionRef, tuples: Vec<Tuple>) -> TableBatch {
        let mut batch = TableBatch::new(collection.clone(), TableKind::Head, 0, StatementKind::Insert);
        for t in tuples {
            batch.push(RowMutation::write(t));
        }
        batch
    }

    fn read_all(collection: &CollectionRef, predicate: Predicate) -> ReadStatement {
        ReadStatement {
            sql: String::new(),
            params: Vec::new(),
            plan: ReadPlan {
                selects: vec![SubSelect {
                    collection: collection.clone(),
                    table: TableKind::Head,
                    predicate,
                    limit: None,
                }],
                order_by_storage: true,
                max_versions: None,
                hard_cap: 100,
            },
        }
    }

    #[tokio::test]
    async fn test_staged_writes_are_private_until_commit() {
        let driver = MemoryDriver::new("s");
        let c = collection();
        let mut writer = driver.connect().await.unwrap();
        let mut reader = driver.connect().await.unwrap();

        let outcomes = writer
            .execute_batch(&insert(&c, vec![tuple(&c, "a", 1, Action::Created)]))
            .await
            .unwrap();
        assert_eq!(outcomes, vec![RowOutcome::Applied(1)]);

        let lookup = LookupStatement::new(c.clone(), TableKind::Head, 0, vec!["a".into()]);
        assert_eq!(writer.lookup(&lookup).await.unwrap().len(), 1);
        assert!(reader.lookup(&lookup).await.unwrap().is_empty());

        writer.commit().await.unwrap();
        assert_eq!(reader.lookup(&lookup).await.unwrap().len(), 1);
        assert_eq!(driver.committed_rows(&c, TableKind::Head).len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard() {
        let driver = MemoryDriver::new("s");
        let c = collection();
        {
            let mut conn = driver.connect().await.unwrap();
            conn.execute_batch(&insert(&c, vec![tuple(&c, "a", 1, Action::Created)]))
                .await
                .unwrap();
            conn.rollback().await.unwrap();
            conn.execute_batch(&insert(&c, vec![tuple(&c, "b", 2, Action::Created)]))
                .await
                .unwrap();
        }
        assert!(driver.committed_rows(&c, TableKind::Head).is_empty());

        let mut conn = driver.connect().await.unwrap();
        let outcomes = conn
            .execute_batch(&insert(&c, vec![tuple(&c, "b", 3, Action::Created)]))
            .await
            .unwrap();
        assert_eq!(outcomes, vec![RowOutcome::Applied(1)]);
    }

    #[tokio::test]
    async fn test_conditional_update_and_ownership() {
        let driver = MemoryDriver::new("s");
        let c = collection();
        let mut a = driver.connect().await.unwrap();
        a.execute_batch(&insert(&c, vec![tuple(&c, "x", 1, Action::Created)]))
            .await
            .unwrap();
        a.commit().await.unwrap();

        let mut b = driver.connect().await.unwrap();
        let mut update_a = TableBatch::new(c.clone(), TableKind::Head, 0, StatementKind::UpdateIf);
        update_a.push(RowMutation::update_if(
            tuple(&c, "x", 2, Action::Updated),
            (Version(1), 0),
        ));
        assert_eq!(a.execute_batch(&update_a).await.unwrap(), vec![RowOutcome::Applied(1)]);

        // b races on the same row while a holds it
        let mut update_b = TableBatch::new(c.clone(), TableKind::Head, 0, StatementKind::UpdateIf);
        update_b.push(RowMutation::update_if(
            tuple(&c, "x", 3, Action::Updated),
            (Version(1), 0),
        ));
        assert_eq!(b.execute_batch(&update_b).await.unwrap(), vec![RowOutcome::Applied(0)]);
        assert_eq!(
            b.execute_batch(&insert(&c, vec![tuple(&c, "x", 4, Action::Created)]))
                .await
                .unwrap(),
            vec![RowOutcome::UniqueViolation]
        );

        // unconditional statements on a held row apply nothing
        let mut upsert_b = TableBatch::new(c.clone(), TableKind::Head, 0, StatementKind::Upsert);
        upsert_b.push(RowMutation::write(tuple(&c, "x", 5, Action::Updated)));
        assert_eq!(b.execute_batch(&upsert_b).await.unwrap(), vec![RowOutcome::Applied(0)]);
        let mut delete_b = TableBatch::new(c.clone(), TableKind::Head, 0, StatementKind::Delete);
        delete_b.push(RowMutation::delete("x"));
        assert_eq!(b.execute_batch(&delete_b).await.unwrap(), vec![RowOutcome::Applied(0)]);

        a.commit().await.unwrap();
        // stale expectation after a's commit
        assert_eq!(b.execute_batch(&update_b).await.unwrap(), vec![RowOutcome::Applied(0)]);
        let heads = driver.committed_rows(&c, TableKind::Head);
        assert_eq!(heads[0].meta.version, Version(2));
    }

    #[tokio::test]
    async fn test_query_predicates_and_hard_cap() {
        let driver = MemoryDriver::new("s");
        let c = collection();
        let mut conn = driver.connect().await.unwrap();
        let rows = (1..=5)
            .map(|i| tuple(&c, &format!("f{i}"), i, Action::Created))
            .collect();
        conn.execute_batch(&insert(&c, rows)).await.unwrap();

        let blob = conn
            .query_addresses(&read_all(
                &c,
                Predicate::FeaturePath {
                    path: vec!["lanes".into()],
                    op: CmpOp::Ge,
                    value: json!(3),
                },
            ))
            .await
            .unwrap();
        let addresses = TupleAddress::unpack_blob(&blob).unwrap();
        assert_eq!(
            addresses.iter().map(|a| a.version().0).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );

        let mut capped = read_all(&c, Predicate::True);
        capped.plan.hard_cap = 2;
        let blob = conn.query_addresses(&capped).await.unwrap();
        assert_eq!(TupleAddress::unpack_blob(&blob).unwrap().len(), 2);

        let author_missing = Predicate::Meta {
            column: MetaColumn::Author,
            op: CmpOp::Eq,
            value: JsonValue::Null,
        };
        let blob = conn.query_addresses(&read_all(&c, author_missing)).await.unwrap();
        assert_eq!(TupleAddress::unpack_blob(&blob).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_fetch_projects_and_skips_unknown() {
        let driver = MemoryDriver::new("s");
        let c = collection();
        let mut conn = driver.connect().await.unwrap();
        let t = tuple(&c, "a", 1, Action::Created);
        conn.execute_batch(&insert(&c, vec![t.clone()])).await.unwrap();

        let missing = TupleAddress::new(
            c.map,
            c.number,
            0,
            RowLocator::new(Version(99), 0, RowFlags::new(Action::Created)),
        );
        let fetched = conn
            .fetch(&FetchStatement {
                sql: String::new(),
                addresses: vec![t.address, missing],
                columns: Columns::METADATA_ONLY,
            })
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(fetched[0].feature.is_none());
        assert_eq!(driver.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_hits_one_batch() {
        let driver = MemoryDriver::new("s");
        let c = collection();
        let mut conn = driver.connect().await.unwrap();
        driver.inject_batch_failure(TableKind::Head);
        let outcomes = conn
            .execute_batch(&insert(&c, vec![tuple(&c, "a", 1, Action::Created)]))
            .await
            .unwrap();
        assert!(matches!(outcomes[0], RowOutcome::Failed(_)));
        let outcomes = conn
            .execute_batch(&insert(&c, vec![tuple(&c, "a", 1, Action::Created)]))
            .await
            .unwrap();
        assert_eq!(outcomes, vec![RowOutcome::Applied(1)]);
    }

    #[tokio::test]
    async fn test_version_sequence_is_shared() {
        let driver = MemoryDriver::new("s");
        let mut a = driver.connect().await.unwrap();
        let mut b = driver.connect().await.unwrap();
        let v1 = a.next_version().await.unwrap();
        let v2 = b.next_version().await.unwrap();
        assert!(v2 > v1);
        assert_eq!(driver.connect_count(), 2);
    }
}
