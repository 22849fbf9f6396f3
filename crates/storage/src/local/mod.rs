//! Per-transaction staging: a private node group collection plus an
//! in-memory primary-key map, buffering writes until commit drains them into
//! global storage.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use quiver_types::{LogicalType, NodeGroupIdx, RowIdx, TableId, Value};

use crate::{
    column::Column,
    error::{Error, Result},
    index::IndexKey,
    node_group::{NodeGroup, NodeGroupCollection},
    transaction::Transaction,
};

/// The uncommitted mirror of one table. Row indices here are local; they
/// surface externally as node offsets with the high bit set.
pub struct LocalNodeTable {
    table_id: TableId,
    pk_column_idx: usize,
    node_groups: NodeGroupCollection,
    pk_map: HashMap<IndexKey, RowIdx>,
}

impl LocalNodeTable {
    pub fn new(
        table_id: TableId,
        types: Vec<LogicalType>,
        pk_column_idx: usize,
        node_group_capacity: u64,
    ) -> Self {
        Self {
            table_id,
            pk_column_idx,
            node_groups: NodeGroupCollection::new(types, node_group_capacity),
            pk_map: HashMap::new(),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn node_groups(&self) -> &NodeGroupCollection {
        &self.node_groups
    }

    pub fn num_total_rows(&self) -> u64 {
        self.node_groups.num_total_rows()
    }

    pub fn num_groups(&self) -> u64 {
        self.node_groups.num_groups()
    }

    pub fn group(&self, idx: NodeGroupIdx) -> Option<Arc<NodeGroup>> {
        self.node_groups.group(idx)
    }

    fn locate(&self, local_row: RowIdx) -> Result<(Arc<NodeGroup>, RowIdx)> {
        let capacity = self.node_groups.capacity();
        let group = self
            .node_groups
            .group(local_row / capacity)
            .ok_or(Error::OutOfRange {
                what: "local row",
                index: local_row,
                len: self.num_total_rows(),
            })?;
        Ok((group, local_row % capacity))
    }

    /// Buffers one row. The caller has already validated the PK against
    /// global storage; duplicates within the local table are caught here.
    pub fn insert(&mut self, txn: &Transaction, values: &[Value]) -> Result<RowIdx> {
        let pk_value = values.get(self.pk_column_idx).ok_or(Error::OutOfRange {
            what: "pk column",
            index: self.pk_column_idx as u64,
            len: values.len() as u64,
        })?;
        if pk_value.is_null() {
            return Err(Error::NullPk);
        }
        let key = IndexKey::from_value(pk_value)?;
        if self.pk_map.contains_key(&key) {
            return Err(Error::DuplicatePk {
                key: pk_value.to_string(),
            });
        }
        let row = self
            .node_groups
            .append_values(txn.id(), std::slice::from_ref(&values.to_vec()), &mut |_, _, _| {})?;
        self.pk_map.insert(key, row);
        Ok(row)
    }

    /// In-place update of an uncommitted row; returns the previous value.
    pub fn update(
        &mut self,
        _txn: &Transaction,
        local_row: RowIdx,
        column_idx: usize,
        value: &Value,
    ) -> Result<Value> {
        let (group, row_in_group) = self.locate(local_row)?;
        if column_idx == self.pk_column_idx {
            if value.is_null() {
                return Err(Error::NullPk);
            }
            let new_key = IndexKey::from_value(value)?;
            if let Some(existing) = self.pk_map.get(&new_key)
                && *existing != local_row
            {
                return Err(Error::DuplicatePk {
                    key: value.to_string(),
                });
            }
            let old_value = group.value(column_idx, row_in_group)?;
            if !old_value.is_null() {
                self.pk_map.remove(&IndexKey::from_value(&old_value)?);
            }
            self.pk_map.insert(new_key, local_row);
        }
        group.update(row_in_group, column_idx, value)
    }

    /// Tombstones an uncommitted row and forgets its PK entry.
    pub fn delete(&mut self, txn: &Transaction, local_row: RowIdx) -> Result<bool> {
        let (group, row_in_group) = self.locate(local_row)?;
        let pk_value = group.value(self.pk_column_idx, row_in_group)?;
        let deleted = group.delete(txn, row_in_group)?;
        if deleted && !pk_value.is_null() {
            self.pk_map.remove(&IndexKey::from_value(&pk_value)?);
        }
        Ok(deleted)
    }

    pub fn lookup_pk(&self, key: &IndexKey) -> Option<RowIdx> {
        self.pk_map.get(key).copied()
    }

    /// Reports a duplicate within the local table itself.
    pub fn validate_uniqueness_constraint(&self, key: &IndexKey) -> Option<RowIdx> {
        self.lookup_pk(key)
    }

    pub fn value(&self, local_row: RowIdx, column_idx: usize) -> Result<Value> {
        let (group, row_in_group) = self.locate(local_row)?;
        group.value(column_idx, row_in_group)
    }

    pub fn is_row_visible(&self, txn: &Transaction, local_row: RowIdx) -> bool {
        match self.locate(local_row) {
            Ok((group, row_in_group)) => group.is_visible(txn, row_in_group),
            Err(_) => false,
        }
    }

    pub fn is_deleted(&self, txn: &Transaction, local_row: RowIdx) -> bool {
        match self.locate(local_row) {
            Ok((group, row_in_group)) => group.is_deleted(txn, row_in_group),
            Err(_) => false,
        }
    }

    pub fn count_visible(&self, txn: &Transaction) -> u64 {
        self.node_groups.count_visible(txn)
    }

    pub fn add_column(&mut self, column: &Column, default: &Value) -> Result<()> {
        self.node_groups.add_column(column, default)
    }

    /// Called at commit completion, after the drain into global storage.
    pub fn clear(&mut self) {
        self.node_groups = NodeGroupCollection::new(
            self.node_groups.column_types(),
            self.node_groups.capacity(),
        );
        self.pk_map.clear();
    }
}

/// All local tables of one transaction.
#[derive(Default)]
pub struct LocalStorage {
    tables: Mutex<HashMap<TableId, LocalNodeTable>>,
}

impl LocalStorage {
    pub fn is_empty(&self) -> bool {
        self.tables.lock().is_empty()
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.lock().keys().copied().collect()
    }

    /// Runs `f` on the table's local table, if the transaction has one.
    pub fn with_table<R>(
        &self,
        table_id: TableId,
        f: impl FnOnce(&mut LocalNodeTable) -> R,
    ) -> Option<R> {
        self.tables.lock().get_mut(&table_id).map(f)
    }

    /// Runs `f` on the table's local table, creating it first if needed.
    pub fn with_table_or_create<R>(
        &self,
        table_id: TableId,
        make: impl FnOnce() -> LocalNodeTable,
        f: impl FnOnce(&mut LocalNodeTable) -> R,
    ) -> R {
        let mut tables = self.tables.lock();
        f(tables.entry(table_id).or_insert_with(make))
    }

    /// Detaches a local table; commit takes ownership for the drain.
    pub fn remove(&self, table_id: TableId) -> Option<LocalNodeTable> {
        self.tables.lock().remove(&table_id)
    }

    pub fn group(&self, table_id: TableId, idx: NodeGroupIdx) -> Option<Arc<NodeGroup>> {
        self.tables.lock().get(&table_id).and_then(|t| t.group(idx))
    }

    pub fn num_rows(&self, table_id: TableId) -> u64 {
        self.tables
            .lock()
            .get(&table_id)
            .map_or(0, |t| t.num_total_rows())
    }
}

#[cfg(test)]
mod tests {
    use crate::transaction::tests::write_txn;

    use super::*;

    fn local() -> LocalNodeTable {
        LocalNodeTable::new(
            TableId(1),
            vec![LogicalType::Int64, LogicalType::String],
            0,
            4,
        )
    }

    #[test]
    fn insert_assigns_sequential_local_rows() {
        let txn = write_txn(0);
        let mut table = local();
        for i in 0..6 {
            let row = table
                .insert(&txn, &[Value::Int64(i), Value::String(format!("v{i}"))])
                .unwrap();
            assert_eq!(row, i as u64);
        }
        assert_eq!(table.num_groups(), 2);
    }

    #[test]
    fn duplicate_pk_in_local_table() {
        let txn = write_txn(0);
        let mut table = local();
        table.insert(&txn, &[Value::Int64(7), Value::Null]).unwrap();
        match table.insert(&txn, &[Value::Int64(7), Value::Null]) {
            Err(Error::DuplicatePk { key }) => assert_eq!(key, "7"),
            other => panic!("expected DuplicatePk, got {other:?}"),
        }
    }

    #[test]
    fn delete_frees_the_key_for_reuse() {
        let txn = write_txn(0);
        let mut table = local();
        let row = table.insert(&txn, &[Value::Int64(7), Value::Null]).unwrap();
        assert!(table.delete(&txn, row).unwrap());
        assert!(table.is_deleted(&txn, row));
        // The key can be taken again by a new local row.
        let row2 = table.insert(&txn, &[Value::Int64(7), Value::Null]).unwrap();
        assert_ne!(row, row2);
        assert_eq!(table.lookup_pk(&IndexKey::Int64(7)), Some(row2));
    }

    #[test]
    fn pk_update_moves_the_map_entry() {
        let txn = write_txn(0);
        let mut table = local();
        let row = table.insert(&txn, &[Value::Int64(5), Value::Null]).unwrap();
        table.update(&txn, row, 0, &Value::Int64(11)).unwrap();
        assert_eq!(table.lookup_pk(&IndexKey::Int64(5)), None);
        assert_eq!(table.lookup_pk(&IndexKey::Int64(11)), Some(row));
    }

    #[test]
    fn null_pk_is_rejected() {
        let txn = write_txn(0);
        let mut table = local();
        match table.insert(&txn, &[Value::Null, Value::Null]) {
            Err(Error::NullPk) => {}
            other => panic!("expected NullPk, got {other:?}"),
        }
    }
}
