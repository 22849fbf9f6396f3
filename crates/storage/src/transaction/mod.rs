//! Transaction identity, snapshots and the single-writer lock.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use quiver_types::{
    ColumnId, NodeGroupIdx, RowIdx, START_TRANSACTION_ID, TableId, TxnTs, local_row_idx,
};

use crate::local::LocalStorage;

pub mod undo;

pub use undo::{UndoBuffer, UndoRecord, VersionRecordHandler, VersionRecordRegistry};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionMode {
    ReadOnly,
    Write,
    Checkpoint,
    Recovery,
}

/// A transaction: an id, a start snapshot, an undo buffer and the
/// transaction's local storage overlay.
///
/// Write, checkpoint and recovery transactions hold the global write lock for
/// their whole lifetime; readers run lock-free against the snapshot.
pub struct Transaction {
    mode: TransactionMode,
    id: TxnTs,
    start_ts: TxnTs,
    commit_ts: AtomicU64,
    undo: Mutex<UndoBuffer>,
    local: LocalStorage,
    touched: Mutex<Vec<TableId>>,
    log_to_wal: bool,
    _write_guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Transaction {
    pub(crate) fn new(
        mode: TransactionMode,
        id: TxnTs,
        start_ts: TxnTs,
        log_to_wal: bool,
        write_guard: Option<ArcMutexGuard<RawMutex, ()>>,
    ) -> Self {
        Self {
            mode,
            id,
            start_ts,
            commit_ts: AtomicU64::new(0),
            undo: Mutex::new(UndoBuffer::default()),
            local: LocalStorage::default(),
            touched: Mutex::new(Vec::new()),
            log_to_wal,
            _write_guard: write_guard,
        }
    }

    pub fn id(&self) -> TxnTs {
        self.id
    }

    pub fn start_ts(&self) -> TxnTs {
        self.start_ts
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.mode, TransactionMode::ReadOnly)
    }

    pub fn commit_ts(&self) -> TxnTs {
        self.commit_ts.load(Ordering::Acquire)
    }

    pub(crate) fn set_commit_ts(&self, ts: TxnTs) {
        self.commit_ts.store(ts, Ordering::Release);
    }

    /// Is a row stamped `ts` visible to this transaction? Own writes always
    /// are; otherwise the stamp must be a commit timestamp at or below the
    /// snapshot.
    #[inline]
    pub fn sees_ts(&self, ts: TxnTs) -> bool {
        ts == self.id || ts <= self.start_ts
    }

    pub fn local_storage(&self) -> &LocalStorage {
        &self.local
    }

    pub fn should_log_to_wal(&self) -> bool {
        self.mode == TransactionMode::Write && self.log_to_wal
    }

    pub fn should_append_to_undo_buffer(&self) -> bool {
        matches!(self.mode, TransactionMode::Write | TransactionMode::Recovery)
    }

    /// Tables this transaction has written to, in first-touch order.
    pub(crate) fn mark_touched(&self, table_id: TableId) {
        let mut touched = self.touched.lock();
        if !touched.contains(&table_id) {
            touched.push(table_id);
        }
    }

    pub(crate) fn touched_tables(&self) -> Vec<TableId> {
        self.touched.lock().clone()
    }

    pub(crate) fn push_insert_info(
        &self,
        table_id: TableId,
        node_group_idx: NodeGroupIdx,
        start_row: RowIdx,
        num_rows: u64,
    ) {
        self.undo.lock().push(UndoRecord::Insert {
            table_id,
            node_group_idx,
            start_row,
            num_rows,
        });
    }

    pub(crate) fn push_delete_info(
        &self,
        table_id: TableId,
        node_group_idx: NodeGroupIdx,
        start_row: RowIdx,
        num_rows: u64,
    ) {
        self.undo.lock().push(UndoRecord::Delete {
            table_id,
            node_group_idx,
            start_row,
            num_rows,
        });
    }

    pub(crate) fn push_update_info(
        &self,
        table_id: TableId,
        column_id: ColumnId,
        node_group_idx: NodeGroupIdx,
        row_in_group: RowIdx,
        old_value: quiver_types::Value,
    ) {
        self.undo.lock().push(UndoRecord::Update {
            table_id,
            column_id,
            node_group_idx,
            row_in_group,
            old_value,
        });
    }

    pub(crate) fn undo_commit(&self, commit_ts: TxnTs, registry: &dyn VersionRecordRegistry) {
        self.undo.lock().commit(self.id, commit_ts, registry);
    }

    pub(crate) fn undo_rollback(&self, registry: &dyn VersionRecordRegistry) {
        self.undo.lock().rollback(self, registry);
    }

    pub(crate) fn has_changes(&self) -> bool {
        !self.undo.lock().is_empty() || !self.local.is_empty()
    }

    /// Local row index of an uncommitted node offset in this transaction's
    /// local table.
    pub fn local_row(&self, offset: quiver_types::NodeOffset) -> RowIdx {
        local_row_idx(offset)
    }
}

/// Assigns transaction ids and commit timestamps; owns the write lock.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    last_commit_ts: AtomicU64,
    write_lock: Arc<Mutex<()>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(START_TRANSACTION_ID + 1),
            last_commit_ts: AtomicU64::new(0),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Begins a transaction. Write-like modes block on the write lock;
    /// readers never do.
    pub fn begin(&self, mode: TransactionMode, log_to_wal: bool) -> Transaction {
        let guard = match mode {
            TransactionMode::ReadOnly => None,
            _ => Some(self.write_lock.lock_arc()),
        };
        // Snapshot after lock acquisition so a write transaction observes
        // every previously committed transaction.
        let start_ts = self.last_commit_ts.load(Ordering::Acquire);
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        Transaction::new(mode, id, start_ts, log_to_wal, guard)
    }

    pub fn last_commit_ts(&self) -> TxnTs {
        self.last_commit_ts.load(Ordering::Acquire)
    }

    /// The commit timestamp the next committing transaction will take.
    pub(crate) fn next_commit_ts(&self) -> TxnTs {
        self.last_commit_ts.load(Ordering::Acquire) + 1
    }

    /// Publishes `commit_ts`; new snapshots observe the commit from here on.
    pub(crate) fn publish_commit(&self, commit_ts: TxnTs) {
        self.last_commit_ts.store(commit_ts, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A write transaction with snapshot `start_ts` (no lock held).
    pub(crate) fn write_txn(start_ts: TxnTs) -> Transaction {
        Transaction::new(
            TransactionMode::Write,
            START_TRANSACTION_ID + 1 + start_ts,
            start_ts,
            false,
            None,
        )
    }

    /// A reader whose snapshot contains every commit up to `start_ts`.
    pub(crate) fn committed_reader(start_ts: TxnTs) -> Transaction {
        Transaction::new(
            TransactionMode::ReadOnly,
            START_TRANSACTION_ID + 1_000_000 + start_ts,
            start_ts,
            false,
            None,
        )
    }

    #[test]
    fn own_writes_are_visible() {
        let txn = write_txn(4);
        assert!(txn.sees_ts(txn.id()));
        assert!(txn.sees_ts(4));
        assert!(!txn.sees_ts(5));
        assert!(!txn.sees_ts(START_TRANSACTION_ID + 999));
    }

    #[test]
    fn manager_assigns_monotonic_ids() {
        let mgr = TransactionManager::new();
        let a = mgr.begin(TransactionMode::ReadOnly, false);
        let b = mgr.begin(TransactionMode::ReadOnly, false);
        assert!(b.id() > a.id());
        assert!(a.id() > START_TRANSACTION_ID);
    }

    #[test]
    fn snapshot_tracks_published_commits() {
        let mgr = TransactionManager::new();
        assert_eq!(mgr.next_commit_ts(), 1);
        mgr.publish_commit(1);
        let txn = mgr.begin(TransactionMode::ReadOnly, false);
        assert_eq!(txn.start_ts(), 1);
    }
}
