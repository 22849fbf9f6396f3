//! Checkpoint, recovery and on-disk round trips.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use quiver_storage::{Options, StorageManager};
use quiver_types::Value;

fn disk_options() -> Options {
    Options {
        node_group_capacity: 16,
        ..Default::default()
    }
}

fn open_disk(path: &std::path::Path) -> (StorageManager, std::sync::Arc<quiver_storage::NodeTable>) {
    let manager = StorageManager::open(path, disk_options()).unwrap();
    let table = match manager.table(PERSON) {
        Ok(table) => table,
        Err(_) => manager.create_table(person_entry()).unwrap(),
    };
    (manager, table)
}

#[test]
fn checkpoint_then_reopen_restores_rows_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    {
        let (manager, table) = open_disk(&path);
        let txn = manager.begin_write().unwrap();
        for i in 0..40 {
            insert_row(&table, &txn, i, &format!("n{i}"));
        }
        manager.commit(txn).unwrap();

        let txn = manager.begin_write().unwrap();
        assert!(delete_by_pk(&table, &txn, 17));
        manager.commit(txn).unwrap();

        assert!(manager.checkpoint().unwrap());
    }

    let (manager, table) = open_disk(&path);
    let reader = manager.begin_read();
    assert_eq!(table.node_groups().num_total_rows(), 40);
    assert_eq!(table.stats(&reader).num_rows, 39);
    assert_eq!(lookup_offset(&table, &reader, 17), None);
    assert_eq!(lookup_offset(&table, &reader, 18), Some(18));
    let rows = scan_all(&manager, &table, &reader);
    assert_eq!(rows.len(), 39);
    assert!(rows.iter().all(|(id, _)| *id != 17));
}

#[test]
fn second_checkpoint_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    let (manager, table) = open_disk(&path);
    let txn = manager.begin_write().unwrap();
    insert_row(&table, &txn, 1, "a");
    manager.commit(txn).unwrap();

    assert!(manager.checkpoint().unwrap());
    assert!(!manager.checkpoint().unwrap());
}

#[test]
fn wal_replay_recovers_unflushed_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    {
        let (manager, table) = open_disk(&path);
        let txn = manager.begin_write().unwrap();
        for i in 0..10 {
            insert_row(&table, &txn, i, "checkpointed");
        }
        manager.commit(txn).unwrap();
        assert!(manager.checkpoint().unwrap());

        // These commits live only in the WAL when the process dies.
        let txn = manager.begin_write().unwrap();
        for i in 10..25 {
            insert_row(&table, &txn, i, "replayed");
        }
        manager.commit(txn).unwrap();

        let txn = manager.begin_write().unwrap();
        assert!(delete_by_pk(&table, &txn, 3));
        manager.commit(txn).unwrap();
    }

    let (manager, table) = open_disk(&path);
    let reader = manager.begin_read();
    assert_eq!(table.stats(&reader).num_rows, 24);
    assert_eq!(lookup_offset(&table, &reader, 3), None);
    assert_eq!(lookup_offset(&table, &reader, 20), Some(20));
    assert_eq!(scan_all(&manager, &table, &reader).len(), 24);
}

#[test]
fn torn_wal_tail_is_truncated_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    {
        let (manager, table) = open_disk(&path);
        let txn = manager.begin_write().unwrap();
        for i in 0..8 {
            insert_row(&table, &txn, i, "durable");
        }
        manager.commit(txn).unwrap();
        assert!(manager.checkpoint().unwrap());

        let txn = manager.begin_write().unwrap();
        insert_row(&table, &txn, 100, "torn");
        manager.commit(txn).unwrap();
    }

    // Chop the tail of the WAL mid-record: the last commit becomes a torn
    // write, as if the process died during the fsync.
    let wal_file = {
        let mut p = path.as_os_str().to_owned();
        p.push(".wal");
        std::path::PathBuf::from(p)
    };
    let len = std::fs::metadata(&wal_file).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&wal_file).unwrap();
    file.set_len(len - 5).unwrap();
    drop(file);

    // Recovery reopens at exactly the checkpointed row count.
    let (manager, table) = open_disk(&path);
    let reader = manager.begin_read();
    assert_eq!(table.node_groups().num_total_rows(), 8);
    assert_eq!(table.stats(&reader).num_rows, 8);
    assert_eq!(lookup_offset(&table, &reader, 100), None);
    for i in 0..8 {
        assert_eq!(lookup_offset(&table, &reader, i), Some(i as u64));
    }

    // The engine keeps working after recovery.
    let txn = manager.begin_write().unwrap();
    insert_row(&table, &txn, 100, "again");
    manager.commit(txn).unwrap();
    let reader = manager.begin_read();
    assert_eq!(lookup_offset(&table, &reader, 100), Some(8));
}

#[test]
fn reopen_without_any_checkpoint_replays_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    {
        let (manager, table) = open_disk(&path);
        let txn = manager.begin_write().unwrap();
        insert_row(&table, &txn, 1, "only-in-wal");
        manager.commit(txn).unwrap();
    }

    let (manager, table) = open_disk(&path);
    let reader = manager.begin_read();
    assert_eq!(lookup_offset(&table, &reader, 1), Some(0));
    assert_eq!(
        scan_all(&manager, &table, &reader),
        vec![(1, "only-in-wal".into())]
    );
}

#[test]
fn pk_update_survives_checkpoint_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    {
        let (manager, table) = open_disk(&path);
        let txn = manager.begin_write().unwrap();
        insert_row(&table, &txn, 5, "a");
        manager.commit(txn).unwrap();

        let txn = manager.begin_write().unwrap();
        let offset = lookup_offset(&table, &txn, 5).unwrap();
        update_column(
            &table,
            &txn,
            offset,
            0,
            Value::Int64(11),
            quiver_types::LogicalType::Int64,
        );
        manager.commit(txn).unwrap();
        assert!(manager.checkpoint().unwrap());
    }

    let (manager, table) = open_disk(&path);
    let reader = manager.begin_read();
    assert_eq!(lookup_offset(&table, &reader, 5), None);
    assert_eq!(lookup_offset(&table, &reader, 11), Some(0));
}

#[test]
fn checkpoint_threshold_tracks_wal_growth() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    let options = Options {
        node_group_capacity: 16,
        checkpoint_threshold_bytes: 256,
        ..Default::default()
    };
    let manager = StorageManager::open(&path, options).unwrap();
    let table = manager.create_table(person_entry()).unwrap();
    assert!(!manager.should_checkpoint());

    let txn = manager.begin_write().unwrap();
    for i in 0..32 {
        insert_row(&table, &txn, i, "grow the log well past the threshold");
    }
    manager.commit(txn).unwrap();
    assert!(manager.should_checkpoint());
    manager.checkpoint().unwrap();
    assert!(!manager.should_checkpoint());
}

#[test]
fn rolled_back_records_are_not_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    {
        let (manager, table) = open_disk(&path);
        let txn = manager.begin_write().unwrap();
        insert_row(&table, &txn, 1, "committed");
        manager.commit(txn).unwrap();

        // This transaction's records hit the WAL buffer, then get marked
        // dead; the following commit flushes both to disk.
        let txn = manager.begin_write().unwrap();
        insert_row(&table, &txn, 2, "rolled-back");
        manager.rollback(txn);

        let txn = manager.begin_write().unwrap();
        insert_row(&table, &txn, 3, "committed-too");
        manager.commit(txn).unwrap();
    }

    let (manager, table) = open_disk(&path);
    let reader = manager.begin_read();
    let mut rows = scan_all(&manager, &table, &reader);
    rows.sort();
    assert_eq!(
        rows,
        vec![(1, "committed".into()), (3, "committed-too".into())]
    );
    assert_eq!(lookup_offset(&table, &reader, 2), None);
}

#[test]
fn tombstone_reinsert_cycle_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.qv");
    {
        let (manager, table) = open_disk(&path);
        let txn = manager.begin_write().unwrap();
        insert_row(&table, &txn, 9, "x");
        manager.commit(txn).unwrap();
        let txn = manager.begin_write().unwrap();
        assert!(delete_by_pk(&table, &txn, 9));
        manager.commit(txn).unwrap();
        let txn = manager.begin_write().unwrap();
        insert_row(&table, &txn, 9, "y");
        manager.commit(txn).unwrap();
        assert!(manager.checkpoint().unwrap());
    }

    let (manager, table) = open_disk(&path);
    let reader = manager.begin_read();
    assert_eq!(scan_all(&manager, &table, &reader), vec![(9, "y".into())]);
    assert_eq!(table.stats(&reader).num_rows, 1);
}
