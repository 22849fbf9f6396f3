use quiver_types::{LogicalType, NOT_DELETED, RowIdx, TxnTs, Value};

use crate::{
    column::{ColumnChunk, PageSpan},
    error::{Error, Result},
    page::PageManager,
    transaction::Transaction,
};

use quiver_types::buffer::{Deserializer, Serializer};

/// Timestamp rewrites applied to a row range at commit or rollback.
#[derive(Clone, Copy, Debug)]
pub enum VersionOp {
    /// `insertionTS == txn_id` becomes `commit_ts`.
    CommitInsert { txn_id: TxnTs, commit_ts: TxnTs },
    /// `deletionTS == txn_id` becomes `commit_ts`.
    CommitDelete { txn_id: TxnTs, commit_ts: TxnTs },
    /// `deletionTS == txn_id` reverts to [`NOT_DELETED`].
    RollbackDelete { txn_id: TxnTs },
}

/// Per-row insertion and deletion timestamps.
///
/// Allocated lazily: a segment without version info holds rows that committed
/// before the last checkpoint (insertion `0`) and were never deleted.
#[derive(Clone, Debug)]
struct VersionInfo {
    insertions: Vec<TxnTs>,
    deletions: Vec<TxnTs>,
}

impl VersionInfo {
    fn committed(num_rows: u64) -> Self {
        Self {
            insertions: vec![0; num_rows as usize],
            deletions: vec![NOT_DELETED; num_rows as usize],
        }
    }
}

/// A fixed-capacity bundle of one column chunk per table column plus row
/// version metadata. All chunks hold the same number of rows.
#[derive(Clone, Debug)]
pub struct ChunkedNodeGroup {
    chunks: Vec<ColumnChunk>,
    num_rows: u64,
    capacity: u64,
    versions: Option<Box<VersionInfo>>,
}

impl ChunkedNodeGroup {
    pub fn new(types: &[LogicalType], capacity: u64) -> Self {
        Self {
            chunks: types
                .iter()
                .map(|t| ColumnChunk::new(t.clone(), capacity))
                .collect(),
            num_rows: 0,
            capacity,
            versions: None,
        }
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.chunks.len()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.num_rows >= self.capacity
    }

    pub fn chunk(&self, column_idx: usize) -> Result<&ColumnChunk> {
        self.chunks.get(column_idx).ok_or(Error::OutOfRange {
            what: "column",
            index: column_idx as u64,
            len: self.chunks.len() as u64,
        })
    }

    fn versions_mut(&mut self) -> &mut VersionInfo {
        let num_rows = self.num_rows;
        self.versions
            .get_or_insert_with(|| Box::new(VersionInfo::committed(num_rows)))
    }

    /// Appends one row stamped with `ts` (`0` for rows that are committed for
    /// every snapshot, e.g. during recovery-free bulk load).
    pub fn append_row(&mut self, ts: TxnTs, values: &[Value]) -> Result<RowIdx> {
        if self.is_full() {
            return Err(Error::ChunkFull);
        }
        if values.len() != self.chunks.len() {
            return Err(Error::InvariantViolation(format!(
                "row width {} does not match column count {}",
                values.len(),
                self.chunks.len()
            )));
        }
        for (chunk, value) in self.chunks.iter_mut().zip(values) {
            chunk.append_value(value)?;
        }
        let row = self.num_rows;
        self.num_rows += 1;
        if self.versions.is_some() || ts != 0 {
            let versions = self.versions_mut();
            versions.insertions.push(ts);
            versions.deletions.push(NOT_DELETED);
        }
        Ok(row)
    }

    pub fn value(&self, column_idx: usize, row: RowIdx) -> Result<Value> {
        self.chunk(column_idx)?.value(row)
    }

    /// In-place update; returns the previous value.
    pub fn set_value(&mut self, column_idx: usize, row: RowIdx, value: &Value) -> Result<Value> {
        let len = self.chunks.len() as u64;
        let chunk = self.chunks.get_mut(column_idx).ok_or(Error::OutOfRange {
            what: "column",
            index: column_idx as u64,
            len,
        })?;
        chunk.set_value(row, value)
    }

    /// Tombstones `row` for `txn`. Returns `true` only when the row was
    /// visible to the caller and not already deleted.
    pub fn delete(&mut self, txn: &Transaction, row: RowIdx) -> Result<bool> {
        if row >= self.num_rows {
            return Err(Error::OutOfRange {
                what: "row",
                index: row,
                len: self.num_rows,
            });
        }
        let txn_snapshot_sees = |ts| txn.sees_ts(ts);
        {
            let versions = self.versions_mut();
            let idx = row as usize;
            if !txn_snapshot_sees(versions.insertions[idx]) {
                return Ok(false);
            }
            if versions.deletions[idx] != NOT_DELETED {
                return Ok(false);
            }
            versions.deletions[idx] = txn.id();
        }
        Ok(true)
    }

    pub fn is_visible(&self, txn: &Transaction, row: RowIdx) -> bool {
        if row >= self.num_rows {
            return false;
        }
        let Some(versions) = &self.versions else {
            return true;
        };
        let idx = row as usize;
        txn.sees_ts(versions.insertions[idx])
            && !(versions.deletions[idx] != NOT_DELETED && txn.sees_ts(versions.deletions[idx]))
    }

    /// Is the row tombstoned from `txn`'s viewpoint?
    pub fn is_deleted(&self, txn: &Transaction, row: RowIdx) -> bool {
        let Some(versions) = &self.versions else {
            return false;
        };
        let del = versions.deletions[row as usize];
        del != NOT_DELETED && txn.sees_ts(del)
    }

    pub fn has_deletions(&self, txn: &Transaction) -> bool {
        (0..self.num_rows).any(|row| self.is_deleted(txn, row))
    }

    pub fn count_visible(&self, txn: &Transaction) -> u64 {
        (0..self.num_rows)
            .filter(|row| self.is_visible(txn, *row))
            .count() as u64
    }

    pub fn apply_version_op(&mut self, op: VersionOp, start_row: RowIdx, num_rows: u64) {
        let Some(versions) = &mut self.versions else {
            return;
        };
        let end = (start_row + num_rows).min(self.num_rows) as usize;
        for idx in start_row as usize..end {
            match op {
                VersionOp::CommitInsert { txn_id, commit_ts } => {
                    if versions.insertions[idx] == txn_id {
                        versions.insertions[idx] = commit_ts;
                    }
                }
                VersionOp::CommitDelete { txn_id, commit_ts } => {
                    if versions.deletions[idx] == txn_id {
                        versions.deletions[idx] = commit_ts;
                    }
                }
                VersionOp::RollbackDelete { txn_id } => {
                    if versions.deletions[idx] == txn_id {
                        versions.deletions[idx] = NOT_DELETED;
                    }
                }
            }
        }
    }

    pub fn truncate(&mut self, num_rows: u64) {
        if num_rows >= self.num_rows {
            return;
        }
        for chunk in &mut self.chunks {
            chunk.truncate(num_rows);
        }
        if let Some(versions) = &mut self.versions {
            versions.insertions.truncate(num_rows as usize);
            versions.deletions.truncate(num_rows as usize);
        }
        self.num_rows = num_rows;
    }

    pub fn add_column(&mut self, chunk: ColumnChunk) -> Result<()> {
        if chunk.len() != self.num_rows {
            return Err(Error::InvariantViolation(format!(
                "added column chunk has {} rows, segment has {}",
                chunk.len(),
                self.num_rows
            )));
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Merges `self` into `target` (the checkpoint coalescing path), keeping
    /// tombstones as committed-for-everyone deletions.
    pub fn merge_into(&self, target: &mut ChunkedNodeGroup) -> Result<()> {
        for row in 0..self.num_rows {
            let values: Vec<Value> = (0..self.chunks.len())
                .map(|col| self.value(col, row))
                .collect::<Result<_>>()?;
            let target_row = target.append_row(0, &values)?;
            if let Some(versions) = &self.versions
                && versions.deletions[row as usize] != NOT_DELETED
            {
                let target_versions = target.versions_mut();
                target_versions.deletions[target_row as usize] = 0;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self, pm: &PageManager, enable_compression: bool) -> Result<()> {
        for chunk in &mut self.chunks {
            chunk.flush(pm, enable_compression)?;
        }
        Ok(())
    }

    pub fn reclaim(&mut self, pm: &PageManager) {
        for chunk in &mut self.chunks {
            chunk.reclaim(pm);
        }
    }

    /// Serialised form: row count, per-chunk page spans, deletion bitmap.
    /// Only meaningful after [`Self::flush`].
    pub fn serialize(&self, ser: &mut Serializer) -> Result<()> {
        ser.write_u64(self.num_rows);
        ser.write_list_len(self.chunks.len());
        for chunk in &self.chunks {
            let span = chunk.page_span().ok_or_else(|| {
                Error::InvariantViolation("serialising a segment that was never flushed".into())
            })?;
            span.serialize(ser);
        }
        let deleted: Vec<bool> = (0..self.num_rows as usize)
            .map(|row| match &self.versions {
                Some(versions) => versions.deletions[row] != NOT_DELETED,
                None => false,
            })
            .collect();
        ser.write_bool(deleted.iter().any(|d| *d));
        if deleted.iter().any(|d| *d) {
            for d in &deleted {
                ser.write_bool(*d);
            }
        }
        Ok(())
    }

    pub fn deserialize(
        de: &mut Deserializer<'_>,
        pm: &PageManager,
        types: &[LogicalType],
        capacity: u64,
    ) -> Result<Self> {
        let num_rows = de.read_u64()?;
        let num_chunks = de.read_list_len()?;
        if num_chunks != types.len() {
            return Err(Error::Corruption(format!(
                "segment has {} chunks, table has {} columns",
                num_chunks,
                types.len()
            )));
        }
        let mut chunks = Vec::with_capacity(num_chunks);
        for data_type in types {
            let span = PageSpan::deserialize(de)?;
            let chunk = ColumnChunk::load(pm, span, data_type.clone(), capacity)?;
            if chunk.len() != num_rows {
                return Err(Error::Corruption(
                    "segment chunks disagree on row count".into(),
                ));
            }
            chunks.push(chunk);
        }
        let mut versions = None;
        if de.read_bool()? {
            let mut info = VersionInfo::committed(num_rows);
            for row in 0..num_rows as usize {
                if de.read_bool()? {
                    info.deletions[row] = 0;
                }
            }
            versions = Some(Box::new(info));
        }
        Ok(Self {
            chunks,
            num_rows,
            capacity,
            versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::transaction::tests::{committed_reader, write_txn};

    use super::*;

    fn group(capacity: u64) -> ChunkedNodeGroup {
        ChunkedNodeGroup::new(&[LogicalType::Int64, LogicalType::String], capacity)
    }

    #[test]
    fn append_and_visibility() {
        let txn = write_txn(5);
        let mut seg = group(16);
        let row = seg
            .append_row(txn.id(), &[Value::Int64(1), Value::String("a".into())])
            .unwrap();
        assert!(seg.is_visible(&txn, row));

        // A reader whose snapshot predates the commit cannot see the row.
        let reader = committed_reader(5);
        assert!(!seg.is_visible(&reader, row));

        // Committing rewrites the insertion timestamp.
        seg.apply_version_op(
            VersionOp::CommitInsert {
                txn_id: txn.id(),
                commit_ts: 6,
            },
            0,
            1,
        );
        let late_reader = committed_reader(6);
        assert!(seg.is_visible(&late_reader, row));
        assert!(!seg.is_visible(&committed_reader(5), row));
    }

    #[test]
    fn delete_only_once() {
        let txn = write_txn(5);
        let mut seg = group(16);
        let row = seg
            .append_row(txn.id(), &[Value::Int64(1), Value::Null])
            .unwrap();
        assert!(seg.delete(&txn, row).unwrap());
        assert!(!seg.delete(&txn, row).unwrap());
        assert!(!seg.is_visible(&txn, row));
        assert!(seg.is_deleted(&txn, row));

        seg.apply_version_op(VersionOp::RollbackDelete { txn_id: txn.id() }, 0, 1);
        assert!(seg.is_visible(&txn, row));
    }

    #[test]
    fn full_segment_rejects_appends() {
        let txn = write_txn(1);
        let mut seg = group(2);
        seg.append_row(txn.id(), &[Value::Int64(1), Value::Null]).unwrap();
        seg.append_row(txn.id(), &[Value::Int64(2), Value::Null]).unwrap();
        match seg.append_row(txn.id(), &[Value::Int64(3), Value::Null]) {
            Err(Error::ChunkFull) => {}
            other => panic!("expected ChunkFull, got {other:?}"),
        }
    }

    #[test]
    fn truncate_drops_tail() {
        let txn = write_txn(1);
        let mut seg = group(8);
        for i in 0..5 {
            seg.append_row(txn.id(), &[Value::Int64(i), Value::Null]).unwrap();
        }
        seg.truncate(2);
        assert_eq!(seg.num_rows(), 2);
        assert_eq!(seg.chunk(0).unwrap().len(), 2);
    }

    #[test]
    fn serialize_roundtrip_keeps_tombstones() {
        let txn = write_txn(3);
        let pm = PageManager::in_memory(4096);
        let mut seg = group(8);
        for i in 0..4 {
            seg.append_row(txn.id(), &[Value::Int64(i), Value::String(format!("s{i}"))])
                .unwrap();
        }
        assert!(seg.delete(&txn, 2).unwrap());
        // Commit both the inserts and the delete before checkpointing.
        seg.apply_version_op(
            VersionOp::CommitInsert {
                txn_id: txn.id(),
                commit_ts: 4,
            },
            0,
            4,
        );
        seg.apply_version_op(
            VersionOp::CommitDelete {
                txn_id: txn.id(),
                commit_ts: 4,
            },
            0,
            4,
        );

        seg.flush(&pm, true).unwrap();
        let mut ser = Serializer::new();
        seg.serialize(&mut ser).unwrap();
        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);
        let loaded = ChunkedNodeGroup::deserialize(
            &mut de,
            &pm,
            &[LogicalType::Int64, LogicalType::String],
            8,
        )
        .unwrap();

        let reader = committed_reader(10);
        assert_eq!(loaded.num_rows(), 4);
        assert!(loaded.is_visible(&reader, 0));
        assert!(!loaded.is_visible(&reader, 2));
        assert_eq!(loaded.value(1, 3).unwrap(), Value::String("s3".into()));
    }
}
