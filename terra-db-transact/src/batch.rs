//! Grouping of row mutations into homogeneous table batches.

use std::collections::BTreeMap;
use terra_db_connection::{RowMutation, StatementKind, TableBatch, TableKind};
use terra_db_core::{CollectionNumber, CollectionRef, MapNumber, Partition};

/// One row mutation of a planned instruction.
#[derive(Debug, Clone)]
pub(crate) struct Mutation {
    pub table: TableKind,
    pub kind: StatementKind,
    pub row: RowMutation,
}

impl Mutation {
    pub fn new(table: TableKind, kind: StatementKind, row: RowMutation) -> Self {
        Self { table, kind, row }
    }
}

type BatchKey = (MapNumber, CollectionNumber, TableKind, Partition, StatementKind);

/// Accumulates mutations per `(collection, table, partition, statement kind)`.
///
/// Batches come out in key order, so head statements of a collection run
/// before its deleted-shadow and history statements. Each row remembers the
/// instruction it belongs to.
#[derive(Debug, Default)]
pub(crate) struct BatchAccumulator {
    batches: BTreeMap<BatchKey, (TableBatch, Vec<usize>)>,
}

impl BatchAccumulator {
    pub fn push(
        &mut self,
        collection: &CollectionRef,
        partition: Partition,
        mutation: Mutation,
        instruction: usize,
    ) {
        let key = (
            collection.map,
            collection.number,
            mutation.table,
            partition,
            mutation.kind,
        );
        let (batch, owners) = self.batches.entry(key).or_insert_with(|| {
            (
                TableBatch::new(collection.clone(), mutation.table, partition, mutation.kind),
                Vec::new(),
            )
        });
        batch.push(mutation.row);
        owners.push(instruction);
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn into_batches(self) -> impl Iterator<Item = (TableBatch, Vec<usize>)> {
        self.batches.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_db_core::{Catalog, CollectionConfig, CollectionId, MapId};

    #[test]
    fn test_groups_by_table_and_kind() {
        let c = Catalog::new()
            .register_collection(
                &MapId::new("m"),
                &CollectionId::new("c"),
                CollectionConfig::default().with_partitions(4),
            )
            .unwrap();
        let mut acc = BatchAccumulator::default();
        acc.push(&c, 1, Mutation::new(TableKind::History, StatementKind::Insert, RowMutation::delete("x")), 0);
        acc.push(&c, 1, Mutation::new(TableKind::Head, StatementKind::Delete, RowMutation::delete("a")), 1);
        acc.push(&c, 1, Mutation::new(TableKind::Head, StatementKind::Delete, RowMutation::delete("b")), 2);
        acc.push(&c, 0, Mutation::new(TableKind::Head, StatementKind::Delete, RowMutation::delete("c")), 3);
        assert_eq!(acc.batch_count(), 3);

        let batches: Vec<_> = acc.into_batches().collect();
        assert_eq!(batches[0].0.table, TableKind::Head);
        assert_eq!(batches[0].0.partition, 0);
        assert_eq!(batches[1].1, vec![1, 2]);
        assert_eq!(batches[2].0.table, TableKind::History);
    }
}
