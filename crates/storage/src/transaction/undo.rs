use std::sync::Arc;

use log::warn;
use quiver_types::{ColumnId, NodeGroupIdx, RowIdx, TableId, TxnTs, Value};

use crate::{node_group::VersionOp, transaction::Transaction};

/// The slice of a table's behaviour the undo buffer needs.
///
/// Undo records carry a `TableId` rather than a reference; the registry
/// resolves it to the concrete table when the record is replayed.
pub trait VersionRecordHandler: Send + Sync {
    fn apply_version_op(
        &self,
        op: VersionOp,
        node_group_idx: NodeGroupIdx,
        start_row: RowIdx,
        num_rows: u64,
    );

    fn rollback_insert(
        &self,
        txn: &Transaction,
        node_group_idx: NodeGroupIdx,
        start_row: RowIdx,
        num_rows: u64,
    );

    fn revert_update(
        &self,
        column_id: ColumnId,
        node_group_idx: NodeGroupIdx,
        row_in_group: RowIdx,
        old_value: &Value,
    );
}

/// Resolves table ids to their version record handlers.
pub trait VersionRecordRegistry: Send + Sync {
    fn version_record_handler(&self, table_id: TableId) -> Option<Arc<dyn VersionRecordHandler>>;
}

/// One reversible effect of a write transaction.
#[derive(Clone, Debug)]
pub enum UndoRecord {
    Insert {
        table_id: TableId,
        node_group_idx: NodeGroupIdx,
        start_row: RowIdx,
        num_rows: u64,
    },
    Delete {
        table_id: TableId,
        node_group_idx: NodeGroupIdx,
        start_row: RowIdx,
        num_rows: u64,
    },
    Update {
        table_id: TableId,
        column_id: ColumnId,
        node_group_idx: NodeGroupIdx,
        row_in_group: RowIdx,
        old_value: Value,
    },
}

/// Append-only per-transaction reverse log.
#[derive(Default)]
pub struct UndoBuffer {
    records: Vec<UndoRecord>,
}

impl UndoBuffer {
    pub fn push(&mut self, record: UndoRecord) {
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Commit pass: rewrite `txn_id` stamps to `commit_ts` on every touched
    /// row range. The buffer is dropped afterwards; the core keeps no
    /// version chains beyond the snapshot horizon.
    pub fn commit(&self, txn_id: TxnTs, commit_ts: TxnTs, registry: &dyn VersionRecordRegistry) {
        for record in &self.records {
            match record {
                UndoRecord::Insert {
                    table_id,
                    node_group_idx,
                    start_row,
                    num_rows,
                } => {
                    if let Some(handler) = registry.version_record_handler(*table_id) {
                        handler.apply_version_op(
                            VersionOp::CommitInsert { txn_id, commit_ts },
                            *node_group_idx,
                            *start_row,
                            *num_rows,
                        );
                    }
                }
                UndoRecord::Delete {
                    table_id,
                    node_group_idx,
                    start_row,
                    num_rows,
                } => {
                    if let Some(handler) = registry.version_record_handler(*table_id) {
                        handler.apply_version_op(
                            VersionOp::CommitDelete { txn_id, commit_ts },
                            *node_group_idx,
                            *start_row,
                            *num_rows,
                        );
                    }
                }
                UndoRecord::Update { .. } => {
                    // In-place updates need no commit-time rewrite.
                }
            }
        }
    }

    /// Rollback pass: walk the records in reverse and undo each one.
    pub fn rollback(&self, txn: &Transaction, registry: &dyn VersionRecordRegistry) {
        for record in self.records.iter().rev() {
            let table_id = match record {
                UndoRecord::Insert { table_id, .. }
                | UndoRecord::Delete { table_id, .. }
                | UndoRecord::Update { table_id, .. } => *table_id,
            };
            let Some(handler) = registry.version_record_handler(table_id) else {
                warn!("rollback: no handler for table {table_id}, skipping record");
                continue;
            };
            match record {
                UndoRecord::Insert {
                    node_group_idx,
                    start_row,
                    num_rows,
                    ..
                } => handler.rollback_insert(txn, *node_group_idx, *start_row, *num_rows),
                UndoRecord::Delete {
                    node_group_idx,
                    start_row,
                    num_rows,
                    ..
                } => handler.apply_version_op(
                    VersionOp::RollbackDelete { txn_id: txn.id() },
                    *node_group_idx,
                    *start_row,
                    *num_rows,
                ),
                UndoRecord::Update {
                    column_id,
                    node_group_idx,
                    row_in_group,
                    old_value,
                    ..
                } => handler.revert_update(*column_id, *node_group_idx, *row_in_group, old_value),
            }
        }
    }
}
