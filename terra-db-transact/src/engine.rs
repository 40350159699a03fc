//! The write engine.
//!
//! [`write_batch`] turns an ordered list of [`WriteInstruction`]s into
//! homogeneous table batches and reports one outcome per instruction:
//!
//! 1. resolve collections and reject duplicate targets (aborts the batch)
//! 2. sort by `(map, collection, partition, feature id)`
//! 3. bulk-look up head and deleted-shadow rows
//! 4. plan each instruction into one primary and some secondary mutations
//! 5. execute primaries; their row outcomes decide each instruction's fate
//! 6. execute deleted-shadow mutations of the instructions whose primary
//!    applied; one that applies nothing undoes that instruction's head
//!    mutation and reports a conflict
//! 7. execute history copies of the surviving instructions
//!
//! A `Failed` row outcome or a driver error rolls back the session
//! transaction and fails the whole batch with [`Error::Fatal`].

use crate::batch::{BatchAccumulator, Mutation};
use crate::instruction::{WriteInstruction, WriteOp, WriteOptions};
use crate::outcome::{ExecutedOp, WriteResult, Written};
use crate::txn::{TxnState, WriteContext};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use terra_db_connection::{
    Connection, LookupStatement, RowMutation, RowOutcome, StatementKind, TableKind,
};
use terra_db_core::geometry::geo_grid;
use terra_db_core::{
    content_hash, Action, Catalog, CollectionNumber, CollectionRef, Error, Feature, Guid,
    MapNumber, Metadata, Partition, Result, RowLocator, Tuple, TupleAddress, Version,
};
use tracing::Instrument;

type RowKey = (MapNumber, CollectionNumber, String);
type RowIndex = FxHashMap<RowKey, Tuple>;

struct Target<'a> {
    instruction: &'a WriteInstruction,
    collection: CollectionRef,
    partition: Partition,
}

impl Target<'_> {
    fn row_key(&self) -> RowKey {
        (
            self.collection.map,
            self.collection.number,
            self.instruction.feature_id.clone(),
        )
    }

    fn id(&self) -> &str {
        &self.instruction.feature_id
    }

    fn feature(&self) -> Result<&Feature> {
        self.instruction.feature.as_ref().ok_or_else(|| {
            Error::illegal_argument(format!("'{}' needs a feature payload", self.id()))
        })
    }

    fn cmp_process_order(&self, other: &Self) -> Ordering {
        (self.collection.map, self.collection.number, self.partition, self.id()).cmp(&(
            other.collection.map,
            other.collection.number,
            other.partition,
            other.id(),
        ))
    }
}

/// Mutations and result of one instruction that changes storage.
struct Planned {
    op: ExecutedOp,
    primary: Option<Mutation>,
    /// Head mutation restoring the looked-up state once the primary applied
    undo: Option<Mutation>,
    secondary: Vec<Mutation>,
    tuple: Tuple,
    /// Guid string of the state the change is based on
    based_on: Option<String>,
    invalidated: Vec<TupleAddress>,
}

/// Execute a write batch inside the session transaction.
///
/// `Err` means the whole batch failed: catalog `NotFound`, `UniqueConflict`
/// on a duplicate target, `IllegalArgument` on a malformed instruction, or
/// `Fatal`/`Driver` after which the transaction has been rolled back.
/// Per-instruction failures are reported inside the [`WriteResult`].
pub async fn write_batch(
    conn: &mut dyn Connection,
    catalog: &Catalog,
    ctx: &WriteContext,
    txn: &mut TxnState,
    instructions: &[WriteInstruction],
    opts: WriteOptions,
) -> Result<WriteResult> {
    let span = tracing::info_span!(
        "write_batch",
        instructions = instructions.len(),
        version = tracing::field::Empty,
        applied = tracing::field::Empty,
        failed = tracing::field::Empty,
    );
    async move {
        match run(conn, catalog, ctx, txn, instructions, opts).await {
            Err(e) if e.is_fatal() => {
                tracing::warn!(error = %e, "write batch failed, rolling back");
                txn.abort();
                if let Err(rollback) = conn.rollback().await {
                    tracing::error!(error = %rollback, "rollback after failed batch failed");
                }
                Err(e)
            }
            other => other,
        }
    }
    .instrument(span)
    .await
}

async fn run(
    conn: &mut dyn Connection,
    catalog: &Catalog,
    ctx: &WriteContext,
    txn: &mut TxnState,
    instructions: &[WriteInstruction],
    opts: WriteOptions,
) -> Result<WriteResult> {
    let span = tracing::Span::current();
    if instructions.is_empty() {
        return Ok(WriteResult {
            results: Vec::new(),
        });
    }

    let targets = resolve_targets(catalog, instructions)?;

    let mut order: Vec<usize> = (0..targets.len()).collect();
    let by_key = |a: &usize, b: &usize| targets[*a].cmp_process_order(&targets[*b]);
    if opts.allow_reorder {
        order.sort_unstable_by(by_key);
    } else {
        order.sort_by(by_key);
    }

    let (heads, shadows) = lookup_current(conn, &targets)
        .instrument(tracing::debug_span!("write_batch_lookup"))
        .await?;

    let needs_version = targets.iter().any(|t| {
        t.instruction.op.needs_feature()
            || heads.contains_key(&t.row_key())
            || shadows.contains_key(&t.row_key())
    });
    let version = if needs_version {
        let v = txn.version(conn).await?;
        span.record("version", v.0);
        Some(v)
    } else {
        None
    };
    let now = chrono::Utc::now().timestamp_millis();

    // Planning runs in process order so uids follow it.
    let mut plans: Vec<Option<Result<Option<Planned>>>> = (0..targets.len()).map(|_| None).collect();
    for &i in &order {
        let t = &targets[i];
        let key = t.row_key();
        plans[i] = Some(plan_instruction(
            ctx,
            txn,
            version,
            now,
            t,
            heads.get(&key),
            shadows.get(&key),
        ));
    }
    let mut plans: Vec<Result<Option<Planned>>> = plans
        .into_iter()
        .map(|p| p.unwrap_or_else(|| Err(Error::illegal_state("instruction was not planned"))))
        .collect();

    // Primaries
    let mut primaries = BatchAccumulator::default();
    for &i in &order {
        if let Ok(Some(planned)) = &mut plans[i] {
            if let Some(primary) = planned.primary.take() {
                primaries.push(&targets[i].collection, targets[i].partition, primary, i);
            }
        }
    }
    let primary_outcomes = execute(conn, primaries)
        .instrument(tracing::debug_span!("write_batch_execute", stage = "primary"))
        .await?;

    for (i, kind, outcome) in primary_outcomes {
        let t = &targets[i];
        let failure = match outcome {
            RowOutcome::Applied(n) if n > 0 => None,
            RowOutcome::Applied(_) => {
                let expected = match &plans[i] {
                    Ok(Some(p)) => p.based_on.clone(),
                    _ => None,
                };
                Some(conflict(t, expected.unwrap_or_default(), None))
            }
            RowOutcome::UniqueViolation if kind == StatementKind::Insert => {
                Some(already_exists(t))
            }
            other => Some(Error::fatal(format!(
                "unexpected outcome {other:?} for '{}'",
                t.id()
            ))),
        };
        if let Some(e) = failure {
            if e.is_fatal() {
                return Err(e);
            }
            plans[i] = Err(e);
        }
    }

    // Deleted-shadow mutations
    let mut shadow_rows = BatchAccumulator::default();
    for &i in &order {
        if let Ok(Some(planned)) = &mut plans[i] {
            let (shadow, history): (Vec<Mutation>, Vec<Mutation>) =
                std::mem::take(&mut planned.secondary)
                    .into_iter()
                    .partition(|m| m.table == TableKind::Deleted);
            planned.secondary = history;
            for mutation in shadow {
                shadow_rows.push(&targets[i].collection, targets[i].partition, mutation, i);
            }
        }
    }
    if !shadow_rows.is_empty() {
        let outcomes = execute(conn, shadow_rows)
            .instrument(tracing::debug_span!("write_batch_execute", stage = "shadow"))
            .await?;
        let mut undo = BatchAccumulator::default();
        for (i, _, outcome) in outcomes {
            if outcome.affected() > 0 {
                continue;
            }
            let t = &targets[i];
            let expected = match &mut plans[i] {
                Ok(Some(planned)) => {
                    if let Some(mutation) = planned.undo.take() {
                        undo.push(&t.collection, t.partition, mutation, i);
                    }
                    planned.based_on.clone().unwrap_or_default()
                }
                _ => continue,
            };
            tracing::debug!(feature_id = t.id(), "deleted-shadow row changed concurrently");
            plans[i] = Err(conflict(t, expected, None));
        }
        if !undo.is_empty() {
            let outcomes = execute(conn, undo)
                .instrument(tracing::debug_span!("write_batch_execute", stage = "undo"))
                .await?;
            require_applied(&targets, outcomes)?;
        }
    }

    // History copies
    let mut history = BatchAccumulator::default();
    for &i in &order {
        if let Ok(Some(planned)) = &mut plans[i] {
            for mutation in std::mem::take(&mut planned.secondary) {
                history.push(&targets[i].collection, targets[i].partition, mutation, i);
            }
        }
    }
    if !history.is_empty() {
        let outcomes = execute(conn, history)
            .instrument(tracing::debug_span!("write_batch_execute", stage = "history"))
            .await?;
        require_applied(&targets, outcomes)?;
    }

    // Results, in instruction order
    let mut applied = 0usize;
    let mut failed = 0usize;
    let results: Vec<Result<Written>> = plans
        .into_iter()
        .zip(&targets)
        .map(|(plan, t)| match plan {
            Err(e) => {
                failed += 1;
                Err(e)
            }
            Ok(None) => Ok(Written {
                op: ExecutedOp::Retained,
                collection: t.instruction.collection.clone(),
                feature_id: t.id().to_string(),
                tuple: None,
                guid: None,
            }),
            Ok(Some(planned)) => {
                applied += 1;
                txn.record_invalidated(planned.invalidated);
                let guid = guid_of(ctx, &t.collection, &planned.tuple);
                Ok(Written {
                    op: planned.op,
                    collection: t.instruction.collection.clone(),
                    feature_id: t.id().to_string(),
                    tuple: opts.return_results.then_some(planned.tuple),
                    guid: Some(guid),
                })
            }
        })
        .collect();

    span.record("applied", applied);
    span.record("failed", failed);
    Ok(WriteResult { results })
}

fn resolve_targets<'a>(
    catalog: &Catalog,
    instructions: &'a [WriteInstruction],
) -> Result<Vec<Target<'a>>> {
    let mut seen: FxHashSet<(MapNumber, CollectionNumber, &str)> = FxHashSet::default();
    let mut targets = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        if instruction.feature_id.is_empty() {
            return Err(Error::illegal_argument("feature id must not be empty"));
        }
        if instruction.op.needs_feature() {
            match &instruction.feature {
                None => {
                    return Err(Error::illegal_argument(format!(
                        "{:?} of '{}' needs a feature payload",
                        instruction.op, instruction.feature_id
                    )))
                }
                Some(f) if f.id != instruction.feature_id => {
                    return Err(Error::illegal_argument(format!(
                        "payload id '{}' differs from target '{}'",
                        f.id, instruction.feature_id
                    )))
                }
                Some(_) => {}
            }
        }

        let collection = catalog.resolve(&instruction.map, &instruction.collection)?;
        if !seen.insert((collection.map, collection.number, instruction.feature_id.as_str())) {
            return Err(Error::UniqueConflict {
                collection: instruction.collection.to_string(),
                feature_id: instruction.feature_id.clone(),
            });
        }
        let partition = collection.partition_of(&instruction.feature_id);
        targets.push(Target {
            instruction,
            collection,
            partition,
        });
    }
    Ok(targets)
}

/// One bulk lookup per `(collection, partition)` and table.
async fn lookup_current(
    conn: &mut dyn Connection,
    targets: &[Target<'_>],
) -> Result<(RowIndex, RowIndex)> {
    let mut groups: BTreeMap<(MapNumber, CollectionNumber, Partition), (CollectionRef, Vec<String>)> =
        BTreeMap::new();
    for t in targets {
        groups
            .entry((t.collection.map, t.collection.number, t.partition))
            .or_insert_with(|| (t.collection.clone(), Vec::new()))
            .1
            .push(t.id().to_string());
    }

    let mut heads = RowIndex::default();
    let mut shadows = RowIndex::default();
    for ((map, number, partition), (collection, ids)) in groups {
        for (table, index) in [(TableKind::Head, &mut heads), (TableKind::Deleted, &mut shadows)] {
            let statement = LookupStatement::new(collection.clone(), table, partition, ids.clone());
            for tuple in conn.lookup(&statement).await? {
                index.insert((map, number, tuple.meta.id.clone()), tuple);
            }
        }
    }
    tracing::debug!(heads = heads.len(), shadows = shadows.len(), "current rows loaded");
    Ok((heads, shadows))
}

fn require_applied(
    targets: &[Target<'_>],
    outcomes: Vec<(usize, StatementKind, RowOutcome)>,
) -> Result<()> {
    match outcomes.into_iter().find(|(_, _, outcome)| outcome.affected() == 0) {
        Some((i, kind, outcome)) => Err(Error::fatal(format!(
            "{kind:?} of '{}' reported {outcome:?}",
            targets[i].id()
        ))),
        None => Ok(()),
    }
}

/// Run accumulated batches; returns `(instruction, statement kind, outcome)` per row.
async fn execute(
    conn: &mut dyn Connection,
    batches: BatchAccumulator,
) -> Result<Vec<(usize, StatementKind, RowOutcome)>> {
    tracing::debug!(batches = batches.batch_count(), "executing table batches");
    let mut out = Vec::new();
    for (batch, owners) in batches.into_batches() {
        let outcomes = conn.execute_batch(&batch).await?;
        if outcomes.len() != owners.len() {
            return Err(Error::fatal(format!(
                "{} batch on {} returned {} outcomes for {} rows",
                batch.table,
                batch.collection.table_base(),
                outcomes.len(),
                owners.len()
            )));
        }
        for ((owner, row), outcome) in owners.into_iter().zip(&batch.rows).zip(outcomes) {
            if let RowOutcome::Failed(msg) = &outcome {
                return Err(Error::fatal(format!(
                    "{:?} on {} {} failed for '{}': {msg}",
                    batch.kind,
                    batch.collection.table_base(),
                    batch.table,
                    row.id
                )));
            }
            out.push((owner, batch.kind, outcome));
        }
    }
    Ok(out)
}

// ============================================================================
// Planning
// ============================================================================

fn plan_instruction(
    ctx: &WriteContext,
    txn: &mut TxnState,
    version: Option<Version>,
    now: i64,
    t: &Target<'_>,
    head: Option<&Tuple>,
    shadow: Option<&Tuple>,
) -> Result<Option<Planned>> {
    let allocated = || version.ok_or_else(|| Error::illegal_state("no transaction version"));
    match t.instruction.op {
        WriteOp::Create => match head {
            Some(_) => Err(already_exists(t)),
            None => plan_create(ctx, txn, allocated()?, now, t, shadow).map(Some),
        },
        WriteOp::Update => {
            let head = head.ok_or_else(|| {
                Error::not_found(format!(
                    "feature '{}' in '{}'",
                    t.id(),
                    t.instruction.collection
                ))
            })?;
            plan_update(ctx, txn, allocated()?, now, t, head).map(Some)
        }
        WriteOp::Upsert => match head {
            Some(head) => plan_update(ctx, txn, allocated()?, now, t, head).map(Some),
            None => {
                if let Some(expected) = &t.instruction.expected_guid {
                    return Err(conflict(t, expected.to_string(), None));
                }
                plan_create(ctx, txn, allocated()?, now, t, shadow).map(Some)
            }
        },
        WriteOp::Delete => match head {
            None => Ok(None),
            Some(head) => plan_delete(ctx, txn, allocated()?, now, t, head, None).map(Some),
        },
        WriteOp::Purge => match (head, shadow) {
            (Some(head), _) => {
                plan_delete(ctx, txn, allocated()?, now, t, head, Some(shadow)).map(Some)
            }
            (None, Some(shadow)) => plan_purge_shadow(ctx, t, shadow).map(Some),
            (None, None) => Ok(None),
        },
    }
}

fn plan_create(
    ctx: &WriteContext,
    txn: &mut TxnState,
    version: Version,
    now: i64,
    t: &Target<'_>,
    shadow: Option<&Tuple>,
) -> Result<Planned> {
    let uid = txn.next_uid()?;
    let tuple = compose(ctx, t, t.feature()?, version, uid, Action::Created, None, now)?;

    let mut secondary = Vec::new();
    let mut invalidated = Vec::new();
    if let Some(shadow) = shadow {
        secondary.push(Mutation::new(
            TableKind::Deleted,
            StatementKind::Delete,
            RowMutation::delete(t.id()),
        ));
        invalidated.push(shadow.address);
    }

    Ok(Planned {
        op: ExecutedOp::Created,
        primary: Some(Mutation::new(
            TableKind::Head,
            StatementKind::Insert,
            RowMutation::write(tuple.clone()),
        )),
        undo: Some(Mutation::new(
            TableKind::Head,
            StatementKind::Delete,
            RowMutation::delete(t.id()),
        )),
        secondary,
        tuple,
        based_on: None,
        invalidated,
    })
}

fn plan_update(
    ctx: &WriteContext,
    txn: &mut TxnState,
    version: Version,
    now: i64,
    t: &Target<'_>,
    head: &Tuple,
) -> Result<Planned> {
    let based_on = check_expected(ctx, t, head)?;
    if !head.meta.is_head() {
        return Err(Error::illegal_state(format!(
            "head of '{}' already has a successor {:?}",
            t.id(),
            head.meta.next_version
        )));
    }

    let uid = txn.next_uid()?;
    let tuple = compose(ctx, t, t.feature()?, version, uid, Action::Updated, Some(head), now)?;

    let mut secondary = Vec::new();
    if t.collection.config.history {
        secondary.push(history_insert(superseded(head, version)));
    }

    Ok(Planned {
        op: ExecutedOp::Updated,
        primary: Some(Mutation::new(
            TableKind::Head,
            StatementKind::UpdateIf,
            RowMutation::update_if(tuple.clone(), (head.meta.version, head.meta.uid)),
        )),
        undo: Some(restore(head)),
        secondary,
        tuple,
        based_on: Some(based_on),
        invalidated: vec![head.address],
    })
}

/// DELETE, or PURGE of a feature that still has a head (`purge = Some(shadow)`).
fn plan_delete(
    ctx: &WriteContext,
    txn: &mut TxnState,
    version: Version,
    now: i64,
    t: &Target<'_>,
    head: &Tuple,
    purge: Option<Option<&Tuple>>,
) -> Result<Planned> {
    let based_on = check_expected(ctx, t, head)?;
    let uid = txn.next_uid()?;
    let deleted = deleted_copy(ctx, t, head, version, uid, now);

    let mut secondary = Vec::new();
    let mut invalidated = vec![head.address];
    if t.collection.config.history {
        secondary.push(history_insert(superseded(head, version)));
        secondary.push(history_insert(deleted.clone()));
    }
    match purge {
        None if !t.collection.config.auto_purge => secondary.push(Mutation::new(
            TableKind::Deleted,
            StatementKind::Upsert,
            RowMutation::write(deleted.clone()),
        )),
        None => {}
        Some(shadow) => {
            if let Some(shadow) = shadow {
                secondary.push(Mutation::new(
                    TableKind::Deleted,
                    StatementKind::Delete,
                    RowMutation::delete(t.id()),
                ));
                invalidated.push(shadow.address);
            }
        }
    }

    Ok(Planned {
        op: if purge.is_some() {
            ExecutedOp::Purged
        } else {
            ExecutedOp::Deleted
        },
        primary: Some(Mutation::new(
            TableKind::Head,
            StatementKind::DeleteIf,
            RowMutation::delete_if(t.id(), (head.meta.version, head.meta.uid)),
        )),
        undo: Some(restore(head)),
        secondary,
        tuple: deleted,
        based_on: Some(based_on),
        invalidated,
    })
}

/// PURGE of a feature that only exists in the deleted shadow.
fn plan_purge_shadow(ctx: &WriteContext, t: &Target<'_>, shadow: &Tuple) -> Result<Planned> {
    let based_on = check_expected(ctx, t, shadow)?;
    Ok(Planned {
        op: ExecutedOp::Purged,
        primary: Some(Mutation::new(
            TableKind::Deleted,
            StatementKind::DeleteIf,
            RowMutation::delete_if(t.id(), (shadow.meta.version, shadow.meta.uid)),
        )),
        undo: None,
        secondary: Vec::new(),
        tuple: shadow.clone(),
        based_on: Some(based_on),
        invalidated: vec![shadow.address],
    })
}

/// Compare the instruction's expected Guid with the current state.
/// Returns the current Guid string.
fn check_expected(ctx: &WriteContext, t: &Target<'_>, current: &Tuple) -> Result<String> {
    let actual = guid_of(ctx, &t.collection, current);
    match &t.instruction.expected_guid {
        Some(expected) if *expected != actual => Err(conflict(
            t,
            expected.to_string(),
            Some(actual.to_string()),
        )),
        _ => Ok(actual.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn compose(
    ctx: &WriteContext,
    t: &Target<'_>,
    feature: &Feature,
    version: Version,
    uid: i32,
    action: Action,
    prev: Option<&Tuple>,
    now: i64,
) -> Result<Tuple> {
    let payload = feature.encode(ctx.compress_threshold)?;
    let flags = payload.flags.with_action(action);
    let meta = Metadata {
        id: feature.id.clone(),
        created_at: prev.map_or(now, |p| p.meta.created_at),
        updated_at: now,
        author_ts: now,
        version,
        uid,
        prev_version: prev.map(|p| p.meta.version),
        puid: prev.map(|p| p.meta.uid),
        next_version: None,
        hash: content_hash(
            &feature.document,
            payload.geometry_wkt.as_deref(),
            &payload.tags_json,
            &ctx.volatile_paths,
        ),
        geo_grid: feature.clustering_point().map_or(0, |p| geo_grid(&p)),
        flags,
        app_id: ctx.app_id.to_string(),
        author: ctx.author.as_deref().map(str::to_string),
        feature_type: feature.feature_type(),
        change_count: prev.map_or(1, |p| p.meta.change_count.saturating_add(1)),
    };
    let address = TupleAddress::new(
        t.collection.map,
        t.collection.number,
        t.partition,
        RowLocator::new(version, uid, flags),
    );
    Ok(Tuple::from_payload(address, meta, &payload))
}

/// Deleted-flagged successor of `head`, carrying the head's payload.
fn deleted_copy(
    ctx: &WriteContext,
    t: &Target<'_>,
    head: &Tuple,
    version: Version,
    uid: i32,
    now: i64,
) -> Tuple {
    let flags = head.meta.flags.with_action(Action::Deleted);
    let meta = Metadata {
        updated_at: now,
        version,
        uid,
        prev_version: Some(head.meta.version),
        puid: Some(head.meta.uid),
        next_version: None,
        flags,
        app_id: ctx.app_id.to_string(),
        author: ctx.author.as_deref().map(str::to_string),
        change_count: head.meta.change_count.saturating_add(1),
        ..head.meta.clone()
    };
    Tuple {
        address: TupleAddress::new(
            t.collection.map,
            t.collection.number,
            t.partition,
            RowLocator::new(version, uid, flags),
        ),
        meta,
        ..head.clone()
    }
}

fn superseded(head: &Tuple, next: Version) -> Tuple {
    Tuple {
        meta: head.meta.superseded_by(next),
        ..head.clone()
    }
}

fn restore(head: &Tuple) -> Mutation {
    Mutation::new(
        TableKind::Head,
        StatementKind::Upsert,
        RowMutation::write(head.clone()),
    )
}

fn history_insert(tuple: Tuple) -> Mutation {
    Mutation::new(
        TableKind::History,
        StatementKind::Insert,
        RowMutation::write(tuple),
    )
}

fn guid_of(ctx: &WriteContext, collection: &CollectionRef, tuple: &Tuple) -> Guid {
    Guid::new(
        Arc::clone(&ctx.storage_id),
        Arc::clone(&collection.id.0),
        tuple.meta.id.as_str(),
        tuple.meta.locator(),
    )
}

fn conflict(t: &Target<'_>, expected: String, actual: Option<String>) -> Error {
    Error::ConcurrencyConflict {
        collection: t.instruction.collection.to_string(),
        feature_id: t.id().to_string(),
        expected,
        actual,
    }
}

fn already_exists(t: &Target<'_>) -> Error {
    Error::illegal_state(format!(
        "feature '{}' already exists in '{}'",
        t.id(),
        t.instruction.collection
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use terra_db_connection::{Driver, MemoryDriver, TableBatch};
    use terra_db_core::{CollectionConfig, CollectionId, MapId, StorageConfig};

    struct Fixture {
        driver: MemoryDriver,
        catalog: Catalog,
        ctx: WriteContext,
        map: MapId,
        roads: CollectionId,
    }

    fn fixture(config: CollectionConfig) -> Fixture {
        let mut catalog = Catalog::new();
        let map = MapId::new("m");
        let roads = CollectionId::new("roads");
        catalog.register_collection(&map, &roads, config).unwrap();
        Fixture {
            driver: MemoryDriver::new("s1"),
            catalog,
            ctx: WriteContext::from_config(&StorageConfig::new("s1")).with_author("alice"),
            map,
            roads,
        }
    }

    fn road(id: &str, name: &str) -> Feature {
        Feature::new(id).with_document(json!({"type": "Road", "properties": {"name": name}}))
    }

    async fn write(
        f: &Fixture,
        conn: &mut dyn Connection,
        txn: &mut TxnState,
        instructions: Vec<WriteInstruction>,
    ) -> WriteResult {
        write_batch(conn, &f.catalog, &f.ctx, txn, &instructions, WriteOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_chains_versions() {
        let f = fixture(CollectionConfig::default());
        let mut conn = f.driver.connect().await.unwrap();
        let mut txn = TxnState::new();

        let created = write(&f, conn.as_mut(), &mut txn, vec![WriteInstruction::create(&f.map, &f.roads, road("a", "x"))]).await;
        let first = created.get(0).unwrap().as_ref().unwrap().clone();
        assert_eq!(first.op, ExecutedOp::Created);
        conn.commit().await.unwrap();
        txn.finish();

        let updated = write(
            &f,
            conn.as_mut(),
            &mut txn,
            vec![WriteInstruction::update(&f.map, &f.roads, road("a", "y"))
                .with_expected_guid(first.guid.clone().unwrap())],
        )
        .await;
        let second = updated.get(0).unwrap().as_ref().unwrap();
        let tuple = second.tuple.as_ref().unwrap();
        let old = first.tuple.as_ref().unwrap();
        assert_eq!(second.op, ExecutedOp::Updated);
        assert!(tuple.meta.version > old.meta.version);
        assert_eq!(tuple.meta.prev_locator(), Some((old.meta.version, old.meta.uid)));
        assert_eq!(tuple.meta.change_count, 2);
        assert_eq!(tuple.meta.created_at, old.meta.created_at);
        assert_eq!(tuple.meta.author.as_deref(), Some("alice"));
        assert_ne!(tuple.meta.hash, old.meta.hash);
        conn.commit().await.unwrap();

        let roads = f.catalog.resolve(&f.map, &f.roads).unwrap();
        let history = f.driver.committed_rows(&roads, TableKind::History);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].meta.next_version, Some(tuple.meta.version));
    }

    #[tokio::test]
    async fn test_per_instruction_failures_do_not_abort() {
        let f = fixture(CollectionConfig::default());
        let mut conn = f.driver.connect().await.unwrap();
        let mut txn = TxnState::new();
        write(&f, conn.as_mut(), &mut txn, vec![WriteInstruction::create(&f.map, &f.roads, road("a", "x"))]).await;

        let result = write(
            &f,
            conn.as_mut(),
            &mut txn,
            vec![
                WriteInstruction::create(&f.map, &f.roads, road("a", "again")),
                WriteInstruction::update(&f.map, &f.roads, road("missing", "x")),
                WriteInstruction::delete(&f.map, &f.roads, "ghost"),
                WriteInstruction::create(&f.map, &f.roads, road("b", "x")),
            ],
        )
        .await;
        assert!(matches!(result.get(0), Some(Err(Error::IllegalState(_)))));
        assert!(matches!(result.get(1), Some(Err(Error::NotFound(_)))));
        assert_eq!(result.get(2).unwrap().as_ref().unwrap().op, ExecutedOp::Retained);
        assert_eq!(result.get(3).unwrap().as_ref().unwrap().op, ExecutedOp::Created);
        assert_eq!(result.errors().count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_target_aborts_before_execution() {
        let f = fixture(CollectionConfig::default());
        let mut conn = f.driver.connect().await.unwrap();
        let mut txn = TxnState::new();
        let err = write_batch(
            conn.as_mut(),
            &f.catalog,
            &f.ctx,
            &mut txn,
            &[
                WriteInstruction::create(&f.map, &f.roads, road("a", "x")),
                WriteInstruction::delete(&f.map, &f.roads, "a"),
            ],
            WriteOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::UniqueConflict { .. }));
        assert_eq!(txn.current_version(), None);
    }

    #[tokio::test]
    async fn test_fatal_outcome_rolls_back() {
        let f = fixture(CollectionConfig::default());
        let mut conn = f.driver.connect().await.unwrap();
        let mut txn = TxnState::new();
        write(&f, conn.as_mut(), &mut txn, vec![WriteInstruction::create(&f.map, &f.roads, road("a", "x"))]).await;

        f.driver.inject_batch_failure(TableKind::History);
        let err = write_batch(
            conn.as_mut(),
            &f.catalog,
            &f.ctx,
            &mut txn,
            &[WriteInstruction::update(&f.map, &f.roads, road("a", "y"))],
            WriteOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));

        // the earlier create was part of the rolled back transaction
        conn.commit().await.unwrap();
        let roads = f.catalog.resolve(&f.map, &f.roads).unwrap();
        assert!(f.driver.committed_rows(&roads, TableKind::Head).is_empty());
    }

    #[tokio::test]
    async fn test_held_shadow_row_undoes_the_head_delete() {
        let f = fixture(CollectionConfig::default());
        let roads = f.catalog.resolve(&f.map, &f.roads).unwrap();
        let mut b = f.driver.connect().await.unwrap();
        let mut txn = TxnState::new();
        write(&f, b.as_mut(), &mut txn, vec![WriteInstruction::create(&f.map, &f.roads, road("a", "x"))]).await;
        b.commit().await.unwrap();
        txn.finish();

        // another transaction stages a shadow row for a and keeps it open
        let head = f.driver.committed_rows(&roads, TableKind::Head).remove(0);
        let mut a = f.driver.connect().await.unwrap();
        let mut hold = TableBatch::new(
            roads.clone(),
            TableKind::Deleted,
            roads.partition_of("a"),
            StatementKind::Upsert,
        );
        hold.push(RowMutation::write(head.clone()));
        assert_eq!(a.execute_batch(&hold).await.unwrap(), vec![RowOutcome::Applied(1)]);

        let result = write(
            &f,
            b.as_mut(),
            &mut txn,
            vec![
                WriteInstruction::delete(&f.map, &f.roads, "a"),
                WriteInstruction::create(&f.map, &f.roads, road("b", "y")),
            ],
        )
        .await;
        assert!(matches!(result.get(0), Some(Err(Error::ConcurrencyConflict { .. }))));
        assert_eq!(result.get(1).unwrap().as_ref().unwrap().op, ExecutedOp::Created);
        b.commit().await.unwrap();

        let heads = f.driver.committed_rows(&roads, TableKind::Head);
        assert_eq!(heads.len(), 2);
        assert!(heads.iter().any(|t| *t == head));
        // no history for the undone delete
        assert!(f.driver.committed_rows(&roads, TableKind::History).is_empty());
    }

    #[tokio::test]
    async fn test_results_off_still_reports_guids() {
        let f = fixture(CollectionConfig::default());
        let mut conn = f.driver.connect().await.unwrap();
        let mut txn = TxnState::new();
        let result = write_batch(
            conn.as_mut(),
            &f.catalog,
            &f.ctx,
            &mut txn,
            &[WriteInstruction::create(&f.map, &f.roads, road("a", "x"))],
            WriteOptions::default().without_results(),
        )
        .await
        .unwrap();
        let written = result.get(0).unwrap().as_ref().unwrap();
        assert!(written.tuple.is_none());
        assert_eq!(&*written.guid.as_ref().unwrap().feature_id, "a");
    }

    #[tokio::test]
    async fn test_reordered_processing_keeps_result_order() {
        let f = fixture(CollectionConfig::default().with_partitions(8));
        let mut conn = f.driver.connect().await.unwrap();
        let mut txn = TxnState::new();
        let ids = ["z", "m", "a", "q"];
        let result = write_batch(
            conn.as_mut(),
            &f.catalog,
            &f.ctx,
            &mut txn,
            &ids.iter()
                .map(|id| WriteInstruction::create(&f.map, &f.roads, road(id, "x")))
                .collect::<Vec<_>>(),
            WriteOptions::default().with_reorder(true),
        )
        .await
        .unwrap();
        let reported: Vec<&str> = result.written().map(|w| w.feature_id.as_str()).collect();
        assert_eq!(reported, ids);
        let version = txn.current_version().unwrap();
        assert!(result
            .written()
            .all(|w| w.tuple.as_ref().unwrap().meta.version == version));
    }
}
