//! The node table: public facade over columns, node groups and indexes.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::{trace, warn};
use parking_lot::RwLock;
use quiver_types::{
    ColumnId, InternalId, LogicalType, NodeGroupIdx, NodeOffset, RowIdx, SelectionVector, TableId,
    Value, ValueVector,
    buffer::{Deserializer, Serializer},
    is_local_offset, local_offset, local_row_idx,
};
use quiver_wal::{TableType, WalRecord};

use crate::{
    catalog::TableCatalogEntry,
    column::Column,
    error::{Error, Result},
    index::{
        Index, IndexHolder, IndexInfo, IndexKey, PrimaryKeyIndex,
        pk::{PK_INDEX_NAME, PK_INDEX_TYPE_NAME},
    },
    local::LocalNodeTable,
    manager::StorageContext,
    node_group::{ChunkedNodeGroup, NodeGroupCollection, VersionOp},
    stats::TableStats,
    transaction::{Transaction, VersionRecordHandler},
};

mod index_scan;
pub mod scan_state;

pub use scan_state::{
    AddColumnState, NodeDeleteState, NodeInsertState, NodeScanState, NodeUpdateState, ScanResult,
    ScanSource,
};

/// A node table: ordered columns, a node group collection, a primary-key
/// index and optional opaque secondary indexes.
pub struct NodeTable {
    table_id: TableId,
    name: String,
    columns: RwLock<Vec<Column>>,
    pk_column_id: ColumnId,
    pk_index: Arc<PrimaryKeyIndex>,
    indexes: RwLock<Vec<IndexHolder>>,
    node_groups: NodeGroupCollection,
    has_changes: AtomicBool,
    ctx: Arc<StorageContext>,
}

impl NodeTable {
    pub fn new(ctx: Arc<StorageContext>, entry: &TableCatalogEntry) -> Result<Self> {
        let pk_column_id = entry.pk_column_id().ok_or_else(|| {
            Error::InvariantViolation(format!(
                "table {} has no column named {}",
                entry.name, entry.primary_key
            ))
        })?;
        let mut columns = Vec::with_capacity(entry.properties.len());
        for (idx, property) in entry.properties.iter().enumerate() {
            if property.column_id.idx() != idx {
                return Err(Error::InvariantViolation(format!(
                    "table {}: column ids must be dense, got {} at position {idx}",
                    entry.name, property.column_id
                )));
            }
            columns.push(Column::new(
                property.name.clone(),
                property.data_type.clone(),
                ctx.options.enable_compression,
            ));
        }
        let pk_type = &columns[pk_column_id.idx()].data_type;
        if !pk_type.is_hashable() {
            return Err(Error::InvariantViolation(format!(
                "primary key column {} has non-hashable type {pk_type}",
                entry.primary_key
            )));
        }
        let pk_index = Arc::new(PrimaryKeyIndex::create(
            IndexInfo {
                name: PK_INDEX_NAME.into(),
                type_name: PK_INDEX_TYPE_NAME.into(),
                table_id: entry.table_id,
                column_ids: std::iter::once(pk_column_id).collect(),
                physical_types: vec![pk_type.physical_type()],
                is_primary: true,
                is_builtin: true,
            },
            ctx.options.page_size,
            ctx.options.pk_index_load_factor_max,
        ));
        let types: Vec<LogicalType> = columns.iter().map(|c| c.data_type.clone()).collect();
        let node_groups = NodeGroupCollection::new(types, ctx.options.node_group_capacity);
        Ok(Self {
            table_id: entry.table_id,
            name: entry.name.clone(),
            columns: RwLock::new(columns),
            pk_column_id,
            pk_index: pk_index.clone(),
            indexes: RwLock::new(vec![IndexHolder::new(pk_index)]),
            node_groups,
            has_changes: AtomicBool::new(false),
            ctx,
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pk_column_id(&self) -> ColumnId {
        self.pk_column_id
    }

    pub fn pk_column_type(&self) -> LogicalType {
        self.columns.read()[self.pk_column_id.idx()].data_type.clone()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.read().len()
    }

    pub fn column_types(&self) -> Vec<LogicalType> {
        self.columns.read().iter().map(|c| c.data_type.clone()).collect()
    }

    pub fn node_groups(&self) -> &NodeGroupCollection {
        &self.node_groups
    }

    pub(crate) fn pk_index(&self) -> &Arc<PrimaryKeyIndex> {
        &self.pk_index
    }

    pub fn has_changes(&self) -> bool {
        self.has_changes.load(Ordering::Acquire)
    }

    fn set_changed(&self) {
        self.has_changes.store(true, Ordering::Release);
    }

    /// Total rows as seen by `txn`: committed space plus its local table.
    pub fn num_total_rows(&self, txn: &Transaction) -> u64 {
        self.node_groups.num_total_rows() + txn.local_storage().num_rows(self.table_id)
    }

    fn make_local_table(&self) -> LocalNodeTable {
        LocalNodeTable::new(
            self.table_id,
            self.column_types(),
            self.pk_column_id.idx(),
            self.ctx.options.node_group_capacity,
        )
    }

    /// Row visibility by global node offset; uncommitted offsets resolve
    /// through the transaction's local table.
    pub fn is_visible(&self, txn: &Transaction, offset: NodeOffset) -> bool {
        if is_local_offset(offset) {
            let row = local_row_idx(offset);
            return txn
                .local_storage()
                .with_table(self.table_id, |t| t.is_row_visible(txn, row))
                .unwrap_or(false);
        }
        let group_idx = self.ctx.options.node_group_idx(offset);
        match self.node_groups.group(group_idx) {
            Some(group) => group.is_visible(txn, self.ctx.options.offset_in_group(offset)),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Scans and lookups
    // ------------------------------------------------------------------

    /// Binds `state` to a node group. With an `offset`, the source and group
    /// index are derived from it; otherwise the caller's `source` and
    /// `node_group_idx` are honoured (the iteration pattern: bump the index,
    /// re-bind, scan again).
    pub fn init_scan_state(
        &self,
        txn: &Transaction,
        state: &mut NodeScanState,
        offset: Option<NodeOffset>,
    ) {
        let capacity = self.ctx.options.node_group_capacity;
        if let Some(offset) = offset {
            if is_local_offset(offset) {
                state.source = ScanSource::Uncommitted;
                state.node_group_idx = local_row_idx(offset) / capacity;
            } else {
                state.source = ScanSource::Committed;
                state.node_group_idx = offset / capacity;
            }
        }
        let group_start = state.node_group_idx * capacity;
        match state.source {
            ScanSource::Committed => {
                state.bind(self.node_groups.group(state.node_group_idx), group_start);
            }
            ScanSource::Uncommitted => {
                state.bind(
                    txn.local_storage().group(self.table_id, state.node_group_idx),
                    group_start,
                );
            }
            ScanSource::None => state.bind(None, 0),
        }
    }

    /// Fills the output vectors with the next batch of the bound group.
    /// Returns `false` when the group is exhausted.
    pub fn scan_internal(&self, txn: &Transaction, state: &mut NodeScanState) -> Result<bool> {
        state.reset_out_vectors();
        let Some(group) = state.node_group.clone() else {
            return Ok(false);
        };
        let Some(result) = group.scan(txn, state)? else {
            return Ok(false);
        };
        let base = state.group_start_offset + result.start_row;
        for i in 0..result.num_rows {
            let offset = base + i;
            let offset = match state.source {
                ScanSource::Uncommitted => local_offset(offset),
                _ => offset,
            };
            state.node_id_vector.set_value(
                i as usize,
                Value::InternalId(InternalId {
                    table_id: self.table_id,
                    offset,
                }),
            );
        }
        Ok(true)
    }

    /// Single-row lookup at the offset the state was initialised for.
    /// Returns `false` for a NULL node id or an invisible row.
    pub fn lookup(&self, txn: &Transaction, state: &mut NodeScanState) -> Result<bool> {
        self.lookup_at(txn, state, 0)
    }

    fn lookup_at(&self, txn: &Transaction, state: &mut NodeScanState, pos: usize) -> Result<bool> {
        if pos >= state.node_id_vector.len() || state.node_id_vector.is_null(pos) {
            return Ok(false);
        }
        let Some(offset) = state.node_id_vector.value(pos).as_node_offset() else {
            return Ok(false);
        };
        let row_in_group = if is_local_offset(offset) {
            local_row_idx(offset) - state.group_start_offset
        } else {
            offset - state.group_start_offset
        };
        if state.row_idx_vector.len() <= pos {
            state.row_idx_vector.resize(pos + 1, 0);
        }
        state.row_idx_vector[pos] = row_in_group;
        let Some(group) = state.node_group.clone() else {
            return Ok(false);
        };
        group.lookup(txn, state, pos)
    }

    /// Multi-row variant of [`Self::lookup`]: re-binds the state whenever the
    /// source or node group changes between consecutive ids.
    pub fn lookup_multiple(&self, txn: &Transaction, state: &mut NodeScanState) -> Result<()> {
        let capacity = self.ctx.options.node_group_capacity;
        for pos in 0..state.node_id_vector.len() {
            if state.node_id_vector.is_null(pos) {
                continue;
            }
            let Some(offset) = state.node_id_vector.value(pos).as_node_offset() else {
                continue;
            };
            let (source, group_idx) = if is_local_offset(offset) {
                (ScanSource::Uncommitted, local_row_idx(offset) / capacity)
            } else {
                (ScanSource::Committed, offset / capacity)
            };
            if state.source != source || state.node_group_idx != group_idx || !state.is_bound() {
                state.source = source;
                state.node_group_idx = group_idx;
                self.init_scan_state(txn, state, None);
            }
            let _ = self.lookup_at(txn, state, pos)?;
        }
        Ok(())
    }

    /// Primary-key point lookup: the transaction's local table first, then
    /// the persistent index filtered by visibility.
    pub fn lookup_pk(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        pos: usize,
    ) -> Result<Option<NodeOffset>> {
        if keys.is_null(pos) {
            return Ok(None);
        }
        let key = IndexKey::from_value(keys.value(pos))?;
        if let Some(row) = txn
            .local_storage()
            .with_table(self.table_id, |t| t.lookup_pk(&key))
            .flatten()
        {
            return Ok(Some(local_offset(row)));
        }
        let is_visible = |offset: NodeOffset| self.is_visible(txn, offset);
        self.pk_index.lookup(txn, keys, pos, &is_visible)
    }

    /// The visible offset currently holding the PK at `pos`, consulting both
    /// global and local state. Used for uniqueness validation.
    pub fn validate_uniqueness_constraint(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        pos: usize,
    ) -> Result<Option<NodeOffset>> {
        self.lookup_pk(txn, keys, pos)
    }

    fn validate_pk_not_exists(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        pos: usize,
    ) -> Result<()> {
        if keys.is_null(pos) {
            return Err(Error::NullPk);
        }
        if self.lookup_pk(txn, keys, pos)?.is_some() {
            return Err(Error::DuplicatePk {
                key: keys.value(pos).to_string(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Appends the selected rows to the transaction's local table, stages
    /// every index and assigns uncommitted node ids.
    pub fn insert(&self, txn: &Transaction, state: &mut NodeInsertState) -> Result<()> {
        let pk_idx = self.pk_column_id.idx();
        for i in 0..state.sel.len() {
            let pos = state.sel.idx(i);
            self.validate_pk_not_exists(txn, &state.property_vectors[pk_idx], pos)?;
            let row: Vec<Value> = state
                .property_vectors
                .iter()
                .map(|v| v.value(pos).clone())
                .collect();
            let local_row = txn.local_storage().with_table_or_create(
                self.table_id,
                || self.make_local_table(),
                |t| t.insert(txn, &row),
            )?;
            let offset = local_offset(local_row);
            state.node_id_vector.set_value(
                pos,
                Value::InternalId(InternalId {
                    table_id: self.table_id,
                    offset,
                }),
            );
            let sel = SelectionVector::from_indices(vec![pos as u32]);
            for holder in self.indexes.read().iter() {
                let key_column = holder.index.info().column_ids[0].idx();
                holder
                    .index
                    .insert(txn, &state.property_vectors[key_column], &sel, &[offset])?;
            }
        }
        txn.mark_touched(self.table_id);
        if state.log_to_wal
            && txn.should_log_to_wal()
            && let Some(wal) = &self.ctx.wal
        {
            let rows: Vec<Vec<Value>> = state
                .sel
                .iter()
                .map(|pos| {
                    state
                        .property_vectors
                        .iter()
                        .map(|v| v.value(pos).clone())
                        .collect()
                })
                .collect();
            wal.lock().append(&WalRecord::TableInsertion {
                table_id: self.table_id,
                table_type: TableType::Node,
                rows,
            })?;
        }
        self.set_changed();
        Ok(())
    }

    /// In-place update of one column of one node. PK updates re-validate
    /// uniqueness and move the index entry.
    pub fn update(&self, txn: &Transaction, state: &mut NodeUpdateState) -> Result<()> {
        if state.node_id_vector.is_empty() || state.node_id_vector.is_null(0) {
            return Ok(());
        }
        let Some(offset) = state.node_id_vector.value(0).as_node_offset() else {
            return Ok(());
        };
        let column_idx = state.column_id.idx();
        if column_idx == self.pk_column_id.idx() {
            match self.lookup_pk(txn, &state.property_vector, 0)? {
                // Updating the PK to its current value is a no-op for the
                // index: the same offset would be re-installed.
                Some(found) if found == offset => {}
                Some(_) => {
                    return Err(Error::DuplicatePk {
                        key: state.property_vector.value(0).to_string(),
                    });
                }
                None => {
                    if state.property_vector.is_null(0) {
                        return Err(Error::NullPk);
                    }
                    let old_value = self.read_value(txn, offset, column_idx)?;
                    let old_keys = ValueVector::with_values(self.pk_column_type(), vec![old_value]);
                    let sel = SelectionVector::identity(1);
                    self.pk_index.delete(txn, &old_keys, &sel, &[offset])?;
                    self.pk_index
                        .insert(txn, &state.property_vector, &sel, &[offset])?;
                }
            }
        }
        if is_local_offset(offset) {
            let local_row = local_row_idx(offset);
            txn.local_storage()
                .with_table(self.table_id, |t| {
                    t.update(txn, local_row, column_idx, state.property_vector.value(0))
                })
                .ok_or_else(|| {
                    Error::InvariantViolation(
                        "uncommitted node id without a local table".into(),
                    )
                })??;
        } else {
            let group_idx = self.ctx.options.node_group_idx(offset);
            let row_in_group = self.ctx.options.offset_in_group(offset);
            let group = self.node_groups.group(group_idx).ok_or(Error::OutOfRange {
                what: "node group",
                index: group_idx,
                len: self.node_groups.num_groups(),
            })?;
            let old_value = group.update(row_in_group, column_idx, state.property_vector.value(0))?;
            if txn.should_append_to_undo_buffer() {
                txn.push_update_info(
                    self.table_id,
                    state.column_id,
                    group_idx,
                    row_in_group,
                    old_value,
                );
            }
        }
        if state.log_to_wal
            && txn.should_log_to_wal()
            && let Some(wal) = &self.ctx.wal
        {
            wal.lock().append(&WalRecord::NodeUpdate {
                table_id: self.table_id,
                column_id: state.column_id,
                node_offset: offset,
                value: state.property_vector.value(0).clone(),
            })?;
        }
        txn.mark_touched(self.table_id);
        self.set_changed();
        Ok(())
    }

    /// Tombstones one node and stages the removal of its index entries.
    /// Returns whether a row was actually deleted.
    pub fn delete(&self, txn: &Transaction, state: &mut NodeDeleteState) -> Result<bool> {
        if state.node_id_vector.is_empty() || state.node_id_vector.is_null(0) {
            return Ok(false);
        }
        let Some(offset) = state.node_id_vector.value(0).as_node_offset() else {
            return Ok(false);
        };
        let deleted = if is_local_offset(offset) {
            let local_row = local_row_idx(offset);
            txn.local_storage()
                .with_table(self.table_id, |t| t.delete(txn, local_row))
                .transpose()?
                .unwrap_or(false)
        } else {
            let group_idx = self.ctx.options.node_group_idx(offset);
            let row_in_group = self.ctx.options.offset_in_group(offset);
            let Some(group) = self.node_groups.group(group_idx) else {
                return Ok(false);
            };
            let deleted = group.delete(txn, row_in_group)?;
            if deleted && txn.should_append_to_undo_buffer() {
                txn.push_delete_info(self.table_id, group_idx, row_in_group, 1);
            }
            deleted
        };
        if !deleted {
            return Ok(false);
        }
        let sel = SelectionVector::identity(1);
        for holder in self.indexes.read().iter() {
            holder.index.delete(txn, &state.pk_vector, &sel, &[offset])?;
        }
        txn.mark_touched(self.table_id);
        if state.log_to_wal
            && txn.should_log_to_wal()
            && let Some(wal) = &self.ctx.wal
        {
            wal.lock().append(&WalRecord::NodeDeletion {
                table_id: self.table_id,
                node_offset: offset,
                pk: state.pk_vector.value(0).clone(),
            })?;
        }
        self.set_changed();
        Ok(true)
    }

    /// Appends a column, extending every existing node group (and the
    /// transaction's local table) with default-valued chunks.
    pub fn add_column(&self, txn: &Transaction, state: AddColumnState) -> Result<()> {
        let column = Column::new(
            state.property.name.clone(),
            state.property.data_type.clone(),
            self.ctx.options.enable_compression,
        );
        {
            let mut columns = self.columns.write();
            if state.property.column_id.idx() != columns.len() {
                return Err(Error::InvariantViolation(format!(
                    "added column id {} is not the next column id",
                    state.property.column_id
                )));
            }
            columns.push(column.clone());
        }
        txn.local_storage()
            .with_table(self.table_id, |t| t.add_column(&column, &state.default_value))
            .transpose()?;
        self.node_groups.add_column(&column, &state.default_value)?;
        txn.mark_touched(self.table_id);
        self.set_changed();
        Ok(())
    }

    /// Bulk path for COPY: appends a pre-built segment, flushing groups as
    /// they fill. Returns the appended `(start, end)` offsets.
    pub fn append_chunked_group(
        &self,
        txn: &Transaction,
        segment: ChunkedNodeGroup,
    ) -> Result<(NodeOffset, NodeOffset)> {
        self.set_changed();
        let pm = (!self.ctx.options.in_memory).then_some(&*self.ctx.page_manager);
        self.node_groups.append_to_last_group_and_flush_when_full(
            txn.id(),
            segment,
            pm,
            self.ctx.options.enable_compression,
            &mut |group_idx, start_row, num_rows| {
                if txn.should_append_to_undo_buffer() {
                    txn.push_insert_info(self.table_id, group_idx, start_row, num_rows);
                }
            },
        )
    }

    fn read_value(&self, txn: &Transaction, offset: NodeOffset, column_idx: usize) -> Result<Value> {
        if is_local_offset(offset) {
            let local_row = local_row_idx(offset);
            txn.local_storage()
                .with_table(self.table_id, |t| t.value(local_row, column_idx))
                .ok_or_else(|| {
                    Error::InvariantViolation("uncommitted node id without a local table".into())
                })?
        } else {
            let group_idx = self.ctx.options.node_group_idx(offset);
            let group = self.node_groups.group(group_idx).ok_or(Error::OutOfRange {
                what: "node group",
                index: group_idx,
                len: self.node_groups.num_groups(),
            })?;
            group.value(column_idx, self.ctx.options.offset_in_group(offset))
        }
    }

    // ------------------------------------------------------------------
    // Commit, checkpoint, rollback
    // ------------------------------------------------------------------

    /// Drains the transaction's local table into global storage: appends all
    /// local rows, re-applies local tombstones, installs committed PK
    /// entries, then finalizes every index.
    pub fn commit(
        &self,
        txn: &Transaction,
        entry: &TableCatalogEntry,
        mut local: LocalNodeTable,
    ) -> Result<()> {
        let start_node_offset = self.node_groups.num_total_rows();
        trace!(
            "table {}: committing {} local row(s) at offset {start_node_offset}",
            self.name,
            local.num_total_rows()
        );
        debug_assert_eq!(entry.properties.len(), self.num_columns());

        // 1. Append every local tuple, deleted or not: removing deleted
        //    tuples here would shift committed offsets.
        let num_local_rows = local.num_total_rows();
        let mut rows = Vec::with_capacity(num_local_rows as usize);
        for row in 0..num_local_rows {
            let values: Vec<Value> = (0..self.num_columns())
                .map(|col| local.value(row, col))
                .collect::<Result<_>>()?;
            rows.push(values);
        }
        self.node_groups
            .append_values(txn.id(), &rows, &mut |group_idx, start_row, num_rows| {
                if txn.should_append_to_undo_buffer() {
                    txn.push_insert_info(self.table_id, group_idx, start_row, num_rows);
                }
            })?;

        // 2. Re-apply tombstones for rows deleted while still local.
        for row in 0..num_local_rows {
            if !local.is_deleted(txn, row) {
                continue;
            }
            let offset = start_node_offset + row;
            let group_idx = self.ctx.options.node_group_idx(offset);
            let row_in_group = self.ctx.options.offset_in_group(offset);
            let group = self.node_groups.group(group_idx).ok_or(Error::OutOfRange {
                what: "node group",
                index: group_idx,
                len: self.node_groups.num_groups(),
            })?;
            let deleted = group.delete(txn, row_in_group)?;
            if !deleted {
                return Err(Error::InvariantViolation(
                    "freshly drained row could not be tombstoned".into(),
                ));
            }
            if txn.should_append_to_undo_buffer() {
                txn.push_delete_info(self.table_id, group_idx, row_in_group, 1);
            }
        }

        // 3. Install committed PK entries for the surviving local rows.
        index_scan::insert_uncommitted_pk_entries(self, txn, &local, start_node_offset)?;

        // 4. Give every index its commit callback (PK updates on committed
        //    rows are installed here).
        self.finalize_index_commit(txn)?;

        local.clear();
        Ok(())
    }

    /// Commit callback for transactions that touched this table without
    /// staging local rows (pure updates or deletes of committed rows).
    pub fn finalize_index_commit(&self, txn: &Transaction) -> Result<()> {
        let is_visible = |offset: NodeOffset| self.is_visible(txn, offset);
        for holder in self.indexes.read().iter() {
            holder.index.finalize_commit(txn, &is_visible)?;
        }
        Ok(())
    }

    /// Rewrites columns in catalog order, flushes node groups and
    /// checkpoints each index. Returns whether anything was written.
    pub fn checkpoint(&self, entry: &mut TableCatalogEntry) -> Result<bool> {
        if !self.has_changes() {
            return Ok(false);
        }
        {
            // Dropped columns are vacuumed, not checkpointed; the catalog
            // entry is the authoritative ordering.
            let mut columns = self.columns.write();
            let reordered: Vec<Column> = entry
                .properties
                .iter()
                .map(|p| columns[p.column_id.idx()].clone())
                .collect();
            *columns = reordered;
        }
        let pm = &self.ctx.page_manager;
        self.node_groups
            .checkpoint(pm, self.ctx.options.enable_compression)?;
        for holder in self.indexes.read().iter() {
            holder.index.checkpoint(pm)?;
        }
        self.has_changes.store(false, Ordering::Release);
        entry.vacuum_column_ids(self.num_columns() as u32);
        Ok(true)
    }

    /// Removes from the PK index every entry whose offset falls inside the
    /// rolled-back range and still resolves there.
    pub fn rollback_pk_index_insert(
        &self,
        txn: &Transaction,
        start_row: RowIdx,
        num_rows: u64,
        node_group_idx: NodeGroupIdx,
    ) {
        let start_offset = self.ctx.options.group_start_offset(node_group_idx) + start_row;
        index_scan::delete_rolled_back_pk_entries(self, txn, start_offset, num_rows);
    }

    /// Shrinks the node group collection tail by `num_rows` rows.
    pub fn rollback_group_collection_insert(&self, num_rows: u64) {
        self.node_groups.rollback_insert(num_rows);
    }

    /// Reverts index checkpoints after a failed checkpoint.
    pub fn rollback_checkpoint(&self) {
        for holder in self.indexes.read().iter() {
            holder.index.rollback_checkpoint();
        }
    }

    /// Drops the uncommitted index state of a finished transaction.
    pub(crate) fn rollback_index_local_state(&self, txn: &Transaction) {
        for holder in self.indexes.read().iter() {
            holder.index.rollback_local(txn);
        }
    }

    /// Returns the table's pages (node groups and indexes) to the free list.
    pub fn reclaim_storage(&self) {
        let pm = &self.ctx.page_manager;
        self.node_groups.reclaim(pm);
        for holder in self.indexes.read().iter() {
            holder.index.reclaim_storage(pm);
        }
    }

    pub fn stats(&self, txn: &Transaction) -> TableStats {
        let mut stats = TableStats::new(self.node_groups.count_visible(txn));
        if let Some(local_rows) = txn
            .local_storage()
            .with_table(self.table_id, |t| t.count_visible(txn))
        {
            stats.merge(&TableStats::new(local_rows));
        }
        stats
    }

    // ------------------------------------------------------------------
    // Secondary indexes
    // ------------------------------------------------------------------

    pub fn add_index(&self, index: Arc<dyn Index>) -> Result<()> {
        let mut indexes = self.indexes.write();
        if indexes
            .iter()
            .any(|h| h.name().eq_ignore_ascii_case(&index.info().name))
        {
            return Err(Error::InvariantViolation(format!(
                "index with name {} already exists",
                index.info().name
            )));
        }
        indexes.push(IndexHolder::new(index));
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut indexes = self.indexes.write();
        let before = indexes.len();
        indexes.retain(|h| h.index.info().is_primary || !h.name().eq_ignore_ascii_case(name));
        if indexes.len() == before {
            return Err(Error::InvariantViolation(format!(
                "no droppable index named {name}"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Table metadata: node group layout and index descriptors. Column data
    /// lives in the pages the spans reference.
    pub fn serialize(&self, ser: &mut Serializer) -> Result<()> {
        ser.write_u32(self.table_id.0);
        self.node_groups.serialize(ser)?;
        let indexes = self.indexes.read();
        ser.write_list_len(indexes.len());
        for holder in indexes.iter() {
            holder.serialize(ser);
        }
        Ok(())
    }

    /// Rebuilds a table from its metadata. Only the built-in primary key
    /// index is reloaded eagerly; other index kinds are external and must be
    /// re-attached by their owners.
    pub fn deserialize(
        ctx: Arc<StorageContext>,
        entry: &TableCatalogEntry,
        de: &mut Deserializer<'_>,
    ) -> Result<Self> {
        let table_id = TableId(de.read_u32()?);
        if table_id != entry.table_id {
            return Err(Error::Corruption(format!(
                "table metadata id {table_id} does not match catalog id {}",
                entry.table_id
            )));
        }
        let table = Self::new(ctx.clone(), entry)?;
        let types = table.column_types();
        let node_groups = NodeGroupCollection::deserialize(
            de,
            &ctx.page_manager,
            types,
            ctx.options.node_group_capacity,
        )?;
        let num_indexes = de.read_list_len()?;
        let mut pk_index: Option<Arc<PrimaryKeyIndex>> = None;
        let mut holders = Vec::with_capacity(num_indexes);
        for _ in 0..num_indexes {
            let info = IndexInfo::deserialize(de)?;
            let blob_len = de.read_u64()? as usize;
            let blob = de.read_bytes(blob_len)?;
            if info.is_primary && info.is_builtin {
                let index = Arc::new(PrimaryKeyIndex::load(
                    info,
                    blob,
                    &ctx.page_manager,
                    ctx.options.pk_index_load_factor_max,
                )?);
                pk_index = Some(index.clone());
                holders.push(IndexHolder::new(index));
            } else {
                warn!(
                    "table {}: skipping non-builtin index {} on load",
                    entry.name, info.name
                );
            }
        }
        let pk_index = pk_index.ok_or_else(|| {
            Error::Corruption(format!("table {} metadata has no primary key index", entry.name))
        })?;
        Ok(Self {
            pk_index,
            indexes: RwLock::new(holders),
            node_groups,
            ..table
        })
    }
}

impl VersionRecordHandler for NodeTable {
    fn apply_version_op(
        &self,
        op: VersionOp,
        node_group_idx: NodeGroupIdx,
        start_row: RowIdx,
        num_rows: u64,
    ) {
        if let Some(group) = self.node_groups.group(node_group_idx) {
            group.apply_version_op(op, start_row, num_rows);
        }
    }

    fn rollback_insert(
        &self,
        txn: &Transaction,
        node_group_idx: NodeGroupIdx,
        start_row: RowIdx,
        num_rows: u64,
    ) {
        self.rollback_pk_index_insert(txn, start_row, num_rows, node_group_idx);
        // The only case where the group is missing is an exception thrown
        // while its first chunk was being appended.
        if let Some(group) = self.node_groups.group(node_group_idx) {
            let num_rows_to_rollback = num_rows.min(group.num_rows().saturating_sub(start_row));
            group.rollback_insert(start_row);
            self.rollback_group_collection_insert(num_rows_to_rollback);
        }
    }

    fn revert_update(
        &self,
        column_id: ColumnId,
        node_group_idx: NodeGroupIdx,
        row_in_group: RowIdx,
        old_value: &Value,
    ) {
        if let Some(group) = self.node_groups.group(node_group_idx)
            && let Err(e) = group.update(row_in_group, column_id.idx(), old_value)
        {
            warn!(
                "table {}: failed to revert update at group {node_group_idx} row {row_in_group}: {e}",
                self.name
            );
        }
    }
}
