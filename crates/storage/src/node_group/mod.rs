//! Node groups: the mutable unit of appending.

use std::sync::Arc;

use parking_lot::RwLock;
use quiver_types::{
    DEFAULT_VECTOR_CAPACITY, LogicalType, NodeGroupIdx, RowIdx, TxnTs, Value,
    buffer::{Deserializer, Serializer},
};

use crate::{
    column::Column,
    error::{Error, Result},
    page::PageManager,
    table::scan_state::{NodeScanState, ScanResult},
    transaction::Transaction,
};

pub mod chunked;
pub mod collection;

pub use chunked::{ChunkedNodeGroup, VersionOp};
pub use collection::NodeGroupCollection;

struct NodeGroupInner {
    segments: Vec<ChunkedNodeGroup>,
    num_rows: u64,
}

/// An ordered list of segments forming one logical row space. Only the tail
/// segment is writable; earlier segments stay immutable until checkpoint
/// coalesces them.
pub struct NodeGroup {
    group_idx: NodeGroupIdx,
    types: RwLock<Vec<LogicalType>>,
    capacity: u64,
    inner: RwLock<NodeGroupInner>,
}

impl NodeGroup {
    pub fn new(group_idx: NodeGroupIdx, types: Vec<LogicalType>, capacity: u64) -> Self {
        Self {
            group_idx,
            types: RwLock::new(types),
            capacity,
            inner: RwLock::new(NodeGroupInner {
                segments: Vec::new(),
                num_rows: 0,
            }),
        }
    }

    pub fn group_idx(&self) -> NodeGroupIdx {
        self.group_idx
    }

    pub fn num_rows(&self) -> u64 {
        self.inner.read().num_rows
    }

    pub fn num_segments(&self) -> usize {
        self.inner.read().segments.len()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.num_rows() >= self.capacity
    }

    fn locate(segments: &[ChunkedNodeGroup], row: RowIdx) -> Result<(usize, RowIdx)> {
        let mut remaining = row;
        for (idx, segment) in segments.iter().enumerate() {
            if remaining < segment.num_rows() {
                return Ok((idx, remaining));
            }
            remaining -= segment.num_rows();
        }
        Err(Error::OutOfRange {
            what: "row in node group",
            index: row,
            len: segments.iter().map(|s| s.num_rows()).sum(),
        })
    }

    /// Appends rows stamped `ts` until the group is full or `rows` runs out.
    /// Returns `(start_row, appended)`.
    pub fn append_rows(&self, ts: TxnTs, rows: &[Vec<Value>]) -> Result<(RowIdx, u64)> {
        let mut inner = self.inner.write();
        let start_row = inner.num_rows;
        let mut appended = 0u64;
        while (appended as usize) < rows.len() && inner.num_rows < self.capacity {
            if inner.segments.is_empty() {
                let segment = ChunkedNodeGroup::new(&self.types.read(), self.capacity);
                inner.segments.push(segment);
            }
            let segment = inner.segments.last_mut().unwrap();
            match segment.append_row(ts, &rows[appended as usize]) {
                Ok(_) => {
                    inner.num_rows += 1;
                    appended += 1;
                }
                Err(Error::ChunkFull) => {
                    // Roll over to a fresh tail segment and retry.
                    let segment = ChunkedNodeGroup::new(&self.types.read(), self.capacity);
                    inner.segments.push(segment);
                }
                Err(e) => return Err(e),
            }
        }
        Ok((start_row, appended))
    }

    /// Absorbs a whole foreign segment. The caller guarantees it fits.
    pub fn absorb_segment(&self, segment: ChunkedNodeGroup) -> Result<RowIdx> {
        let mut inner = self.inner.write();
        if inner.num_rows + segment.num_rows() > self.capacity {
            return Err(Error::InvariantViolation(format!(
                "segment of {} rows does not fit node group at {} of {}",
                segment.num_rows(),
                inner.num_rows,
                self.capacity
            )));
        }
        let start_row = inner.num_rows;
        inner.num_rows += segment.num_rows();
        inner.segments.push(segment);
        Ok(start_row)
    }

    /// One step of an iterative scan: produces the next window of the current
    /// segment whose selection is non-empty, or `None` when the group is
    /// exhausted.
    ///
    /// Rows are filtered by visibility, then by the optional semi-mask, then
    /// by the pushed-down column predicates, before any output column is
    /// materialised.
    pub fn scan(&self, txn: &Transaction, state: &mut NodeScanState) -> Result<Option<ScanResult>> {
        let inner = self.inner.read();
        loop {
            let Some(segment) = inner.segments.get(state.cursor.segment_idx) else {
                return Ok(None);
            };
            if state.cursor.row_in_segment >= segment.num_rows() {
                state.cursor.segment_idx += 1;
                state.cursor.row_in_segment = 0;
                continue;
            }
            let segment_start: u64 = inner.segments[..state.cursor.segment_idx]
                .iter()
                .map(|s| s.num_rows())
                .sum();
            let window_start = state.cursor.row_in_segment;
            let window = (segment.num_rows() - window_start).min(DEFAULT_VECTOR_CAPACITY as u64);
            state.cursor.row_in_segment += window;

            let mut selected = Vec::new();
            'rows: for i in 0..window {
                let row = window_start + i;
                if !segment.is_visible(txn, row) {
                    continue;
                }
                if let Some(mask) = &state.semi_mask {
                    let offset = state.group_start_offset + segment_start + row;
                    if !mask.contains(offset) {
                        continue;
                    }
                }
                for (column_id, predicates) in &state.predicates {
                    let value = segment.value(column_id.idx(), row)?;
                    if !predicates.eval(&value) {
                        continue 'rows;
                    }
                }
                selected.push(i as u32);
            }
            if selected.is_empty() {
                continue;
            }

            for (out_idx, column_id) in state.column_ids.iter().enumerate() {
                let chunk = segment.chunk(column_id.idx())?;
                state.output[out_idx].reset(window as usize);
                for &i in &selected {
                    state.output[out_idx].set_value(i as usize, chunk.value(window_start + i as u64)?);
                }
            }
            state.sel.set_indices(selected);
            return Ok(Some(ScanResult {
                start_row: segment_start + window_start,
                num_rows: window,
            }));
        }
    }

    /// Point lookup: fills the output vectors at `pos` iff the row at
    /// `state.row_idx_vector[pos]` is visible.
    pub fn lookup(&self, txn: &Transaction, state: &mut NodeScanState, pos: usize) -> Result<bool> {
        let row_in_group = *state.row_idx_vector.get(pos).ok_or(Error::OutOfRange {
            what: "lookup position",
            index: pos as u64,
            len: state.row_idx_vector.len() as u64,
        })?;
        let inner = self.inner.read();
        let (segment_idx, row_in_segment) = Self::locate(&inner.segments, row_in_group)?;
        let segment = &inner.segments[segment_idx];
        if !segment.is_visible(txn, row_in_segment) {
            return Ok(false);
        }
        for (out_idx, column_id) in state.column_ids.iter().enumerate() {
            let value = segment.value(column_id.idx(), row_in_segment)?;
            state.output[out_idx].set_value(pos, value);
        }
        Ok(true)
    }

    /// Reads one cell; used by the index maintenance scans.
    pub fn value(&self, column_idx: usize, row_in_group: RowIdx) -> Result<Value> {
        let inner = self.inner.read();
        let (segment_idx, row_in_segment) = Self::locate(&inner.segments, row_in_group)?;
        inner.segments[segment_idx].value(column_idx, row_in_segment)
    }

    /// In-place update; returns the previous value.
    pub fn update(&self, row_in_group: RowIdx, column_idx: usize, value: &Value) -> Result<Value> {
        let mut inner = self.inner.write();
        let (segment_idx, row_in_segment) = Self::locate(&inner.segments, row_in_group)?;
        inner.segments[segment_idx].set_value(column_idx, row_in_segment, value)
    }

    /// Tombstones a row; `true` only if it was visible and not yet deleted.
    pub fn delete(&self, txn: &Transaction, row_in_group: RowIdx) -> Result<bool> {
        let mut inner = self.inner.write();
        let (segment_idx, row_in_segment) = Self::locate(&inner.segments, row_in_group)?;
        inner.segments[segment_idx].delete(txn, row_in_segment)
    }

    pub fn is_visible(&self, txn: &Transaction, row_in_group: RowIdx) -> bool {
        let inner = self.inner.read();
        match Self::locate(&inner.segments, row_in_group) {
            Ok((segment_idx, row_in_segment)) => {
                inner.segments[segment_idx].is_visible(txn, row_in_segment)
            }
            Err(_) => false,
        }
    }

    pub fn is_deleted(&self, txn: &Transaction, row_in_group: RowIdx) -> bool {
        let inner = self.inner.read();
        match Self::locate(&inner.segments, row_in_group) {
            Ok((segment_idx, row_in_segment)) => {
                inner.segments[segment_idx].is_deleted(txn, row_in_segment)
            }
            Err(_) => false,
        }
    }

    pub fn has_deletions(&self, txn: &Transaction) -> bool {
        let inner = self.inner.read();
        inner.segments.iter().any(|s| s.has_deletions(txn))
    }

    pub fn count_visible(&self, txn: &Transaction) -> u64 {
        let inner = self.inner.read();
        inner.segments.iter().map(|s| s.count_visible(txn)).sum()
    }

    /// Truncates the group back to `first_row_to_undo` rows, dropping
    /// segments whose whole range is truncated and shortening the partially
    /// truncated one. No WAL interaction; the caller decided this rollback.
    pub fn rollback_insert(&self, first_row_to_undo: RowIdx) {
        let mut inner = self.inner.write();
        if first_row_to_undo >= inner.num_rows {
            return;
        }
        let mut remaining = first_row_to_undo;
        let mut keep_segments = 0;
        for segment in inner.segments.iter_mut() {
            if remaining == 0 {
                break;
            }
            let take = segment.num_rows().min(remaining);
            if take < segment.num_rows() {
                segment.truncate(take);
            }
            remaining -= take;
            keep_segments += 1;
        }
        inner.segments.truncate(keep_segments);
        inner.num_rows = first_row_to_undo;
    }

    /// Applies a version-timestamp rewrite to `[start_row, start_row+num_rows)`.
    pub fn apply_version_op(&self, op: VersionOp, start_row: RowIdx, num_rows: u64) {
        let mut inner = self.inner.write();
        let mut segment_start = 0u64;
        let end = start_row + num_rows;
        for segment in &mut inner.segments {
            let segment_end = segment_start + segment.num_rows();
            if segment_end > start_row && segment_start < end {
                let local_start = start_row.saturating_sub(segment_start);
                let local_end = (end - segment_start).min(segment.num_rows());
                segment.apply_version_op(op, local_start, local_end - local_start);
            }
            segment_start = segment_end;
        }
    }

    /// Extends every segment with a default-valued chunk for a new column.
    pub fn add_column(&self, column: &Column, default: &Value) -> Result<()> {
        let mut inner = self.inner.write();
        for segment in &mut inner.segments {
            let chunk = column.default_chunk(self.capacity, default, segment.num_rows())?;
            segment.add_column(chunk)?;
        }
        self.types.write().push(column.data_type.clone());
        Ok(())
    }

    /// Checkpoint: coalesce all segments into one, flush its chunks, and
    /// normalise version metadata to the committed form.
    pub fn checkpoint(&self, pm: &PageManager, enable_compression: bool) -> Result<()> {
        let types = self.types.read().clone();
        let mut inner = self.inner.write();
        let mut merged = ChunkedNodeGroup::new(&types, self.capacity);
        for segment in &inner.segments {
            segment.merge_into(&mut merged)?;
        }
        merged.flush(pm, enable_compression)?;
        for segment in &mut inner.segments {
            segment.reclaim(pm);
        }
        inner.segments = vec![merged];
        Ok(())
    }

    pub fn reclaim(&self, pm: &PageManager) {
        let mut inner = self.inner.write();
        for segment in &mut inner.segments {
            segment.reclaim(pm);
        }
    }

    pub fn serialize(&self, ser: &mut Serializer) -> Result<()> {
        let inner = self.inner.read();
        ser.write_u64(self.group_idx);
        ser.write_list_len(inner.segments.len());
        for segment in &inner.segments {
            segment.serialize(ser)?;
        }
        Ok(())
    }

    pub fn deserialize(
        de: &mut Deserializer<'_>,
        pm: &PageManager,
        types: Vec<LogicalType>,
        capacity: u64,
    ) -> Result<Self> {
        let group_idx = de.read_u64()?;
        let num_segments = de.read_list_len()?;
        let mut segments = Vec::with_capacity(num_segments);
        let mut num_rows = 0;
        for _ in 0..num_segments {
            let segment = ChunkedNodeGroup::deserialize(de, pm, &types, capacity)?;
            num_rows += segment.num_rows();
            segments.push(segment);
        }
        Ok(Self {
            group_idx,
            types: RwLock::new(types),
            capacity,
            inner: RwLock::new(NodeGroupInner { segments, num_rows }),
        })
    }
}

pub type SharedNodeGroup = Arc<NodeGroup>;
