use std::sync::Arc;

use quiver_storage::{
    NodeDeleteState, NodeInsertState, NodeScanState, NodeTable, NodeUpdateState, Options,
    PropertyDefinition, ScanSource, StorageManager, TableCatalogEntry, Transaction,
};
use quiver_types::{ColumnId, InternalId, LogicalType, NodeOffset, TableId, Value, ValueVector};

pub const PERSON: TableId = TableId(1);

pub fn person_entry() -> TableCatalogEntry {
    TableCatalogEntry {
        table_id: PERSON,
        name: "person".into(),
        properties: vec![
            PropertyDefinition {
                name: "id".into(),
                data_type: LogicalType::Int64,
                column_id: ColumnId(0),
            },
            PropertyDefinition {
                name: "name".into(),
                data_type: LogicalType::String,
                column_id: ColumnId(1),
            },
        ]
        .into(),
        primary_key: "id".into(),
    }
}

pub fn small_options() -> Options {
    Options {
        node_group_capacity: 16,
        ..Default::default()
    }
}

pub fn open_memory(options: Options) -> (StorageManager, Arc<NodeTable>) {
    let manager = StorageManager::in_memory(options).unwrap();
    let table = manager.create_table(person_entry()).unwrap();
    (manager, table)
}

pub fn insert_state(id: i64, name: &str) -> NodeInsertState {
    let mut state = NodeInsertState::single_row(
        vec![Value::Int64(id), Value::String(name.into())],
        &[LogicalType::Int64, LogicalType::String],
    );
    state.log_to_wal = true;
    state
}

/// Inserts one row and returns its (uncommitted) node offset.
pub fn insert_row(table: &NodeTable, txn: &Transaction, id: i64, name: &str) -> NodeOffset {
    let mut state = insert_state(id, name);
    table.insert(txn, &mut state).unwrap();
    state.node_id_vector.value(0).as_node_offset().unwrap()
}

pub fn pk_vector(id: i64) -> ValueVector {
    ValueVector::with_values(LogicalType::Int64, vec![Value::Int64(id)])
}

pub fn lookup_offset(table: &NodeTable, txn: &Transaction, id: i64) -> Option<NodeOffset> {
    table.lookup_pk(txn, &pk_vector(id), 0).unwrap()
}

pub fn delete_by_pk(table: &NodeTable, txn: &Transaction, id: i64) -> bool {
    let Some(offset) = lookup_offset(table, txn, id) else {
        return false;
    };
    let mut state = NodeDeleteState::new(
        Value::InternalId(InternalId {
            table_id: table.table_id(),
            offset,
        }),
        pk_vector(id),
    );
    table.delete(txn, &mut state).unwrap()
}

pub fn update_column(
    table: &NodeTable,
    txn: &Transaction,
    offset: NodeOffset,
    column: u32,
    value: Value,
    data_type: LogicalType,
) {
    let mut state = NodeUpdateState::new(
        Value::InternalId(InternalId {
            table_id: table.table_id(),
            offset,
        }),
        ColumnId(column),
        ValueVector::with_values(data_type, vec![value]),
    );
    table.update(txn, &mut state).unwrap();
}

/// Scans the whole table (committed groups, then the transaction's local
/// groups) and returns the selected `(id, name)` pairs.
pub fn scan_all(
    manager: &StorageManager,
    table: &NodeTable,
    txn: &Transaction,
) -> Vec<(i64, String)> {
    let mut rows = Vec::new();
    let mut scan = |state: &mut NodeScanState, num_groups: u64| {
        for group_idx in 0..num_groups {
            state.node_group_idx = group_idx;
            table.init_scan_state(txn, state, None);
            while table.scan_internal(txn, state).unwrap() {
                for i in 0..state.sel.len() {
                    let pos = state.sel.idx(i);
                    let Value::Int64(id) = state.output[0].value(pos) else {
                        panic!("unexpected id value");
                    };
                    let Value::String(name) = state.output[1].value(pos) else {
                        panic!("unexpected name value");
                    };
                    rows.push((*id, name.clone()));
                }
            }
        }
    };

    let mut state = manager.scan_state(table.table_id(), &[0, 1]).unwrap();
    state.source = ScanSource::Committed;
    scan(&mut state, table.node_groups().num_groups());

    let local_groups = txn
        .local_storage()
        .with_table(table.table_id(), |t| t.num_groups())
        .unwrap_or(0);
    if local_groups > 0 {
        let mut state = manager.scan_state(table.table_id(), &[0, 1]).unwrap();
        state.source = ScanSource::Uncommitted;
        scan(&mut state, local_groups);
    }
    rows
}
