//! End-to-end behaviour of the node table: MVCC visibility, primary-key
//! uniqueness, rollback and the boundary behaviours of node group layout.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use quiver_storage::{Error, ScanSource};
use quiver_types::{LogicalType, Value};

#[test]
fn insert_commit_lookup_scan() {
    let (manager, table) = open_memory(small_options());
    let txn = manager.begin_write().unwrap();
    let offset = insert_row(&table, &txn, 7, "ada");
    // Uncommitted ids carry the high bit.
    assert!(quiver_types::is_local_offset(offset));
    // The inserting transaction sees its own row.
    assert_eq!(lookup_offset(&table, &txn, 7), Some(offset));
    manager.commit(txn).unwrap();

    let reader = manager.begin_read();
    let committed = lookup_offset(&table, &reader, 7).expect("committed row resolves");
    assert!(!quiver_types::is_local_offset(committed));
    assert_eq!(scan_all(&manager, &table, &reader), vec![(7, "ada".into())]);
    assert_eq!(table.stats(&reader).num_rows, 1);
}

#[test]
fn duplicate_pk_within_one_transaction() {
    let (manager, table) = open_memory(small_options());
    let txn = manager.begin_write().unwrap();
    insert_row(&table, &txn, 7, "a");
    let mut second = insert_state(7, "b");
    match table.insert(&txn, &mut second) {
        Err(Error::DuplicatePk { key }) => assert!(key.contains('7')),
        other => panic!("expected DuplicatePk, got {other:?}"),
    }
    manager.rollback(txn);

    // After rollback the key is gone entirely.
    let reader = manager.begin_read();
    assert_eq!(lookup_offset(&table, &reader, 7), None);
    assert_eq!(table.stats(&reader).num_rows, 0);
}

#[test]
fn duplicate_pk_against_committed_row() {
    let (manager, table) = open_memory(small_options());
    let txn = manager.begin_write().unwrap();
    insert_row(&table, &txn, 9, "x");
    manager.commit(txn).unwrap();

    let txn = manager.begin_write().unwrap();
    let mut state = insert_state(9, "y");
    match table.insert(&txn, &mut state) {
        Err(Error::DuplicatePk { .. }) => {}
        other => panic!("expected DuplicatePk, got {other:?}"),
    }
    manager.rollback(txn);
}

#[test]
fn null_pk_is_rejected() {
    let (manager, table) = open_memory(small_options());
    let txn = manager.begin_write().unwrap();
    let mut state = quiver_storage::NodeInsertState::single_row(
        vec![Value::Null, Value::String("n".into())],
        &[LogicalType::Int64, LogicalType::String],
    );
    match table.insert(&txn, &mut state) {
        Err(Error::NullPk) => {}
        other => panic!("expected NullPk, got {other:?}"),
    }
    manager.rollback(txn);
}

#[test]
fn tombstone_then_reinsert_same_key() {
    let (manager, table) = open_memory(small_options());

    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 9, "x");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    assert!(delete_by_pk(&table, &t2, 9));
    // Deleted for the deleter, still visible to a snapshot from before.
    assert_eq!(lookup_offset(&table, &t2, 9), None);
    manager.commit(t2).unwrap();

    let t3 = manager.begin_write().unwrap();
    insert_row(&table, &t3, 9, "y");
    manager.commit(t3).unwrap();

    let t4 = manager.begin_read();
    assert_eq!(scan_all(&manager, &table, &t4), vec![(9, "y".into())]);
    assert_eq!(table.stats(&t4).num_rows, 1);
    // Tombstones occupy space: two physical rows, one visible.
    assert_eq!(table.node_groups().num_total_rows(), 2);
}

#[test]
fn delete_is_idempotent_within_a_transaction() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 1, "a");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    assert!(delete_by_pk(&table, &t2, 1));
    // A second delete finds nothing: the PK no longer resolves.
    assert!(!delete_by_pk(&table, &t2, 1));
    manager.commit(t2).unwrap();
}

#[test]
fn rollback_of_committed_delete_restores_the_row() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 5, "keep");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    assert!(delete_by_pk(&table, &t2, 5));
    manager.rollback(t2);

    let reader = manager.begin_read();
    assert_eq!(scan_all(&manager, &table, &reader), vec![(5, "keep".into())]);
    assert!(lookup_offset(&table, &reader, 5).is_some());
}

#[test]
fn scan_stability_under_concurrent_committed_inserts() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    for i in 0..40 {
        insert_row(&table, &t1, i, "old");
    }
    manager.commit(t1).unwrap();

    // The reader's snapshot predates the second writer's commit.
    let reader = manager.begin_read();
    let writer = manager.begin_write().unwrap();
    for i in 100..200 {
        insert_row(&table, &writer, i, "new");
    }
    manager.commit(writer).unwrap();

    let seen = scan_all(&manager, &table, &reader);
    assert_eq!(seen.len(), 40);
    assert!(seen.iter().all(|(_, name)| name == "old"));

    let late = manager.begin_read();
    assert_eq!(scan_all(&manager, &table, &late).len(), 140);
}

#[test]
fn uncommitted_rows_are_scannable_by_their_owner() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 1, "committed");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    insert_row(&table, &t2, 2, "local");
    let rows = scan_all(&manager, &table, &t2);
    assert_eq!(rows.len(), 2);
    assert_eq!(table.stats(&t2).num_rows, 2);
    manager.rollback(t2);
}

#[test]
fn bulk_insert_rollback_leaves_no_trace() {
    let (manager, table) = open_memory(small_options());
    let capacity = manager.options().node_group_capacity;
    let txn = manager.begin_write().unwrap();
    for i in 0..(3 * capacity as i64) {
        insert_row(&table, &txn, i + 1, "bulk");
    }
    manager.rollback(txn);

    assert_eq!(table.node_groups().num_total_rows(), 0);
    let reader = manager.begin_read();
    for i in 0..(3 * capacity as i64) {
        assert_eq!(lookup_offset(&table, &reader, i + 1), None);
    }
}

#[test]
fn rollback_pk_index_insert_removes_only_the_range() {
    let (manager, table) = open_memory(small_options());
    let txn = manager.begin_write().unwrap();
    for i in 0..10 {
        insert_row(&table, &txn, i, "r");
    }
    manager.commit(txn).unwrap();

    // Simulate the undo path for the last four offsets of group 0.
    let txn = manager.begin_write().unwrap();
    table.rollback_pk_index_insert(&txn, 6, 4, 0);
    for i in 0..6 {
        assert!(lookup_offset(&table, &txn, i).is_some());
    }
    for i in 6..10 {
        assert_eq!(lookup_offset(&table, &txn, i), None);
    }
    manager.rollback(txn);
}

#[test]
fn update_non_pk_column_with_undo() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 3, "before");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    let offset = lookup_offset(&table, &t2, 3).unwrap();
    update_column(
        &table,
        &t2,
        offset,
        1,
        Value::String("after".into()),
        LogicalType::String,
    );
    assert_eq!(scan_all(&manager, &table, &t2), vec![(3, "after".into())]);
    manager.rollback(t2);

    let reader = manager.begin_read();
    assert_eq!(scan_all(&manager, &table, &reader), vec![(3, "before".into())]);
}

#[test]
fn update_pk_column_moves_the_index_entry() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 5, "a");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    let offset = lookup_offset(&table, &t2, 5).unwrap();
    update_column(&table, &t2, offset, 0, Value::Int64(11), LogicalType::Int64);
    manager.commit(t2).unwrap();

    let reader = manager.begin_read();
    assert_eq!(lookup_offset(&table, &reader, 5), None);
    assert_eq!(lookup_offset(&table, &reader, 11), Some(offset));
    // The value column is untouched.
    assert_eq!(scan_all(&manager, &table, &reader), vec![(11, "a".into())]);
}

#[test]
fn update_pk_to_same_value_is_a_noop() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 5, "a");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    let offset = lookup_offset(&table, &t2, 5).unwrap();
    update_column(&table, &t2, offset, 0, Value::Int64(5), LogicalType::Int64);
    manager.commit(t2).unwrap();

    let reader = manager.begin_read();
    assert_eq!(lookup_offset(&table, &reader, 5), Some(offset));
}

#[test]
fn update_pk_to_existing_value_is_a_duplicate() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 1, "a");
    insert_row(&table, &t1, 2, "b");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    let offset = lookup_offset(&table, &t2, 1).unwrap();
    let mut state = quiver_storage::NodeUpdateState::new(
        Value::InternalId(quiver_types::InternalId {
            table_id: table.table_id(),
            offset,
        }),
        quiver_types::ColumnId(0),
        quiver_types::ValueVector::with_values(LogicalType::Int64, vec![Value::Int64(2)]),
    );
    match table.update(&t2, &mut state) {
        Err(Error::DuplicatePk { .. }) => {}
        other => panic!("expected DuplicatePk, got {other:?}"),
    }
    manager.rollback(t2);
}

#[test]
fn rollback_of_pk_update_restores_the_old_entry() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 5, "a");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    let offset = lookup_offset(&table, &t2, 5).unwrap();
    update_column(&table, &t2, offset, 0, Value::Int64(11), LogicalType::Int64);
    manager.rollback(t2);

    let reader = manager.begin_read();
    assert_eq!(lookup_offset(&table, &reader, 5), Some(offset));
    assert_eq!(lookup_offset(&table, &reader, 11), None);
}

#[test]
fn exactly_capacity_rows_fill_one_segment() {
    let (manager, table) = open_memory(small_options());
    let capacity = manager.options().node_group_capacity;
    let txn = manager.begin_write().unwrap();
    for i in 0..capacity as i64 {
        insert_row(&table, &txn, i, "fill");
    }
    manager.commit(txn).unwrap();

    assert_eq!(table.node_groups().num_groups(), 1);
    let group = table.node_groups().group(0).unwrap();
    assert_eq!(group.num_segments(), 1);
    assert!(group.is_full());

    // The next insert opens a second segment, in the next group.
    let txn = manager.begin_write().unwrap();
    insert_row(&table, &txn, 9999, "next");
    manager.commit(txn).unwrap();
    assert_eq!(table.node_groups().num_groups(), 2);
    assert_eq!(table.node_groups().group(1).unwrap().num_segments(), 1);
    // Global offset identity: group 1 starts at `capacity`.
    let reader = manager.begin_read();
    assert_eq!(lookup_offset(&table, &reader, 9999), Some(capacity));
}

#[test]
fn lookup_with_null_node_id_returns_false() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 1, "a");
    manager.commit(t1).unwrap();

    let reader = manager.begin_read();
    let mut state = manager.scan_state(PERSON, &[0, 1]).unwrap();
    state.source = ScanSource::Committed;
    state.node_group_idx = 0;
    table.init_scan_state(&reader, &mut state, None);
    state.node_id_vector.set_value(0, Value::Null);
    assert!(!table.lookup(&reader, &mut state).unwrap());
}

#[test]
fn lookup_multiple_rebinds_across_groups() {
    let (manager, table) = open_memory(small_options());
    let capacity = manager.options().node_group_capacity;
    let t1 = manager.begin_write().unwrap();
    for i in 0..(2 * capacity as i64) {
        insert_row(&table, &t1, i, &format!("n{i}"));
    }
    manager.commit(t1).unwrap();

    let reader = manager.begin_read();
    let mut state = manager.scan_state(PERSON, &[1]).unwrap();
    // One id in group 1, one NULL, one in group 0.
    state.node_id_vector.set_value(
        0,
        Value::InternalId(quiver_types::InternalId {
            table_id: PERSON,
            offset: capacity + 2,
        }),
    );
    state.node_id_vector.set_value(1, Value::Null);
    state.node_id_vector.set_value(
        2,
        Value::InternalId(quiver_types::InternalId {
            table_id: PERSON,
            offset: 3,
        }),
    );
    table.lookup_multiple(&reader, &mut state).unwrap();
    assert_eq!(
        state.output[0].value(0),
        &Value::String(format!("n{}", capacity + 2))
    );
    assert_eq!(state.output[0].value(2), &Value::String("n3".into()));
}

#[test]
fn add_column_backfills_default_values() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 1, "a");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    table
        .add_column(
            &t2,
            quiver_storage::AddColumnState {
                property: quiver_storage::PropertyDefinition {
                    name: "age".into(),
                    data_type: LogicalType::Int32,
                    column_id: quiver_types::ColumnId(2),
                },
                default_value: Value::Int32(0),
            },
        )
        .unwrap();
    manager.commit(t2).unwrap();

    let group = table.node_groups().group(0).unwrap();
    assert_eq!(group.value(2, 0).unwrap(), Value::Int32(0));
    assert_eq!(table.num_columns(), 3);
}

#[test]
fn predicate_pushdown_filters_before_materialisation() {
    let (manager, table) = open_memory(small_options());
    let txn = manager.begin_write().unwrap();
    for i in 0..30 {
        insert_row(&table, &txn, i, if i % 2 == 0 { "even" } else { "odd" });
    }
    manager.commit(txn).unwrap();

    let reader = manager.begin_read();
    let mut total = 0;
    let mut state = manager.scan_state(PERSON, &[0, 1]).unwrap();
    state.source = ScanSource::Committed;
    state.predicates = vec![(
        quiver_types::ColumnId(0),
        quiver_storage::ColumnPredicateSet::single(
            quiver_storage::CompareOp::GtEq,
            Value::Int64(20),
        ),
    )];
    for group_idx in 0..table.node_groups().num_groups() {
        state.node_group_idx = group_idx;
        table.init_scan_state(&reader, &mut state, None);
        while table.scan_internal(&reader, &mut state).unwrap() {
            for i in 0..state.sel.len() {
                let pos = state.sel.idx(i);
                let Value::Int64(id) = state.output[0].value(pos) else {
                    panic!("bad value");
                };
                assert!(*id >= 20);
                total += 1;
            }
        }
    }
    assert_eq!(total, 10);
}

#[test]
fn semi_mask_restricts_the_scan() {
    let (manager, table) = open_memory(small_options());
    let txn = manager.begin_write().unwrap();
    for i in 0..30 {
        insert_row(&table, &txn, i, "m");
    }
    manager.commit(txn).unwrap();

    let reader = manager.begin_read();
    let mut mask = quiver_storage::SemiMask::new(30);
    mask.mask_range(5, 8);
    let mut state = manager.scan_state(PERSON, &[0]).unwrap();
    state.source = ScanSource::Committed;
    state.semi_mask = Some(mask);
    let mut seen = Vec::new();
    for group_idx in 0..table.node_groups().num_groups() {
        state.node_group_idx = group_idx;
        table.init_scan_state(&reader, &mut state, None);
        while table.scan_internal(&reader, &mut state).unwrap() {
            for i in 0..state.sel.len() {
                let pos = state.sel.idx(i);
                let Value::Int64(id) = state.output[0].value(pos) else {
                    panic!("bad value");
                };
                seen.push(*id);
            }
        }
    }
    assert_eq!(seen, vec![5, 6, 7]);
}

#[test]
fn stats_merge_local_and_committed() {
    let (manager, table) = open_memory(small_options());
    let t1 = manager.begin_write().unwrap();
    insert_row(&table, &t1, 1, "a");
    insert_row(&table, &t1, 2, "b");
    manager.commit(t1).unwrap();

    let t2 = manager.begin_write().unwrap();
    insert_row(&table, &t2, 3, "c");
    assert!(delete_by_pk(&table, &t2, 1));
    assert_eq!(table.stats(&t2).num_rows, 2);
    manager.commit(t2).unwrap();
    let reader = manager.begin_read();
    assert_eq!(table.stats(&reader).num_rows, 2);
}
