use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;
use quiver_types::{
    LogicalType, NodeGroupIdx, NodeOffset, RowIdx, TxnTs, Value,
    buffer::{Deserializer, Serializer},
};

use crate::{
    column::Column,
    error::Result,
    node_group::{ChunkedNodeGroup, NodeGroup},
    page::PageManager,
    transaction::Transaction,
};

/// Callback receiving each `(group_idx, start_row, num_rows)` span an append
/// touched; the commit path uses it to push insert undo records.
pub type SpanFn<'a> = dyn FnMut(NodeGroupIdx, RowIdx, u64) + 'a;

/// Append-only ordered list of node groups forming a whole table.
///
/// The global offset of a row is `group_idx * capacity + row_in_group`, and
/// stays stable across deletions (tombstones occupy space).
pub struct NodeGroupCollection {
    types: RwLock<Vec<LogicalType>>,
    capacity: u64,
    groups: RwLock<Vec<Arc<NodeGroup>>>,
    num_rows: AtomicU64,
}

impl NodeGroupCollection {
    pub fn new(types: Vec<LogicalType>, capacity: u64) -> Self {
        Self {
            types: RwLock::new(types),
            capacity,
            groups: RwLock::new(Vec::new()),
            num_rows: AtomicU64::new(0),
        }
    }

    pub fn column_types(&self) -> Vec<LogicalType> {
        self.types.read().clone()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn num_groups(&self) -> u64 {
        self.groups.read().len() as u64
    }

    pub fn group(&self, idx: NodeGroupIdx) -> Option<Arc<NodeGroup>> {
        self.groups.read().get(idx as usize).cloned()
    }

    /// Monotonic within a transaction; rollback restores it exactly.
    pub fn num_total_rows(&self) -> u64 {
        self.num_rows.load(Ordering::Acquire)
    }

    fn tail_group(&self) -> Arc<NodeGroup> {
        let mut groups = self.groups.write();
        if let Some(last) = groups.last()
            && !last.is_full()
        {
            return last.clone();
        }
        let group = Arc::new(NodeGroup::new(
            groups.len() as u64,
            self.types.read().clone(),
            self.capacity,
        ));
        groups.push(group.clone());
        group
    }

    /// Appends `rows` stamped `ts`, spilling across as many tail groups as
    /// needed. Returns the global offset of the first appended row.
    pub fn append_values(
        &self,
        ts: TxnTs,
        rows: &[Vec<Value>],
        on_span: &mut SpanFn<'_>,
    ) -> Result<NodeOffset> {
        let start_offset = self.num_total_rows();
        let mut appended = 0usize;
        while appended < rows.len() {
            let group = self.tail_group();
            let (start_row, count) = group.append_rows(ts, &rows[appended..])?;
            if count == 0 {
                continue;
            }
            on_span(group.group_idx(), start_row, count);
            self.num_rows.fetch_add(count, Ordering::AcqRel);
            appended += count as usize;
        }
        Ok(start_offset)
    }

    /// Bulk-append path: absorbs the foreign segment whole when it lands on a
    /// group boundary, copies row-wise otherwise, and flushes every group the
    /// append fills. Returns the `(start, end)` offsets of the appended rows.
    pub fn append_to_last_group_and_flush_when_full(
        &self,
        ts: TxnTs,
        segment: ChunkedNodeGroup,
        pm: Option<&PageManager>,
        enable_compression: bool,
        on_span: &mut SpanFn<'_>,
    ) -> Result<(NodeOffset, NodeOffset)> {
        let start_offset = self.num_total_rows();
        let num_rows = segment.num_rows();
        if start_offset % self.capacity == 0 && num_rows <= self.capacity {
            let group = self.tail_group();
            let start_row = group.absorb_segment(segment)?;
            on_span(group.group_idx(), start_row, num_rows);
            self.num_rows.fetch_add(num_rows, Ordering::AcqRel);
            if group.is_full()
                && let Some(pm) = pm
            {
                group.checkpoint(pm, enable_compression)?;
            }
        } else {
            let rows: Vec<Vec<Value>> = (0..num_rows)
                .map(|row| {
                    (0..segment.num_columns())
                        .map(|col| segment.value(col, row))
                        .collect()
                })
                .collect::<Result<_>>()?;
            self.append_values(ts, &rows, &mut |group_idx, start_row, count| {
                on_span(group_idx, start_row, count);
                if let (Some(pm), Some(group)) = (pm, self.group(group_idx))
                    && group.is_full()
                {
                    // Flushing a freshly filled group never fails the append;
                    // checkpoint will redo it if it does.
                    let _ = group.checkpoint(pm, enable_compression);
                }
            })?;
        }
        Ok((start_offset, self.num_total_rows()))
    }

    /// Shrinks the collection tail by `num_rows` rows. The groups themselves
    /// were already truncated by the undo handler; this drops emptied groups
    /// and restores the row count.
    pub fn rollback_insert(&self, num_rows: u64) {
        let mut groups = self.groups.write();
        while let Some(last) = groups.last() {
            if last.num_rows() == 0 {
                groups.pop();
            } else {
                break;
            }
        }
        self.num_rows.fetch_sub(num_rows, Ordering::AcqRel);
    }

    pub fn add_column(&self, column: &Column, default: &Value) -> Result<()> {
        let groups = self.groups.read();
        for group in groups.iter() {
            group.add_column(column, default)?;
        }
        drop(groups);
        self.types.write().push(column.data_type.clone());
        Ok(())
    }

    pub fn count_visible(&self, txn: &Transaction) -> u64 {
        let groups = self.groups.read();
        groups.iter().map(|g| g.count_visible(txn)).sum()
    }

    pub fn checkpoint(&self, pm: &PageManager, enable_compression: bool) -> Result<()> {
        let groups = self.groups.read();
        for group in groups.iter() {
            group.checkpoint(pm, enable_compression)?;
        }
        Ok(())
    }

    pub fn reclaim(&self, pm: &PageManager) {
        let groups = self.groups.read();
        for group in groups.iter() {
            group.reclaim(pm);
        }
    }

    pub fn serialize(&self, ser: &mut Serializer) -> Result<()> {
        let groups = self.groups.read();
        ser.write_u64(self.num_total_rows());
        ser.write_list_len(groups.len());
        for group in groups.iter() {
            group.serialize(ser)?;
        }
        Ok(())
    }

    pub fn deserialize(
        de: &mut Deserializer<'_>,
        pm: &PageManager,
        types: Vec<LogicalType>,
        capacity: u64,
    ) -> Result<Self> {
        let num_rows = de.read_u64()?;
        let num_groups = de.read_list_len()?;
        let mut groups = Vec::with_capacity(num_groups);
        for _ in 0..num_groups {
            groups.push(Arc::new(NodeGroup::deserialize(
                de,
                pm,
                types.clone(),
                capacity,
            )?));
        }
        Ok(Self {
            types: RwLock::new(types),
            capacity,
            groups: RwLock::new(groups),
            num_rows: AtomicU64::new(num_rows),
        })
    }
}
