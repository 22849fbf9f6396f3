//! Scan and mutation state passed between the executor and the node table.

use std::sync::Arc;

use quiver_types::{
    ColumnId, ColumnIdList, LogicalType, NodeGroupIdx, NodeOffset, RowIdx, SelectionVector,
    SemiMask, Value, ValueVector,
};

use crate::{catalog::PropertyDefinition, node_group::NodeGroup, predicate::ColumnPredicateSet};

/// Which row space a scan state is bound to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ScanSource {
    Committed,
    Uncommitted,
    #[default]
    None,
}

/// Iteration cursor within a node group.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentCursor {
    pub segment_idx: usize,
    pub row_in_segment: u64,
}

/// The byte range a single `scan` call produced: a contiguous window of rows
/// in the bound node group, with the state's selection vector marking the
/// positions that survived visibility and predicates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanResult {
    pub start_row: RowIdx,
    pub num_rows: u64,
}

/// State of an iterative node-table scan.
pub struct NodeScanState {
    pub source: ScanSource,
    pub node_group_idx: NodeGroupIdx,
    pub(crate) node_group: Option<Arc<NodeGroup>>,
    /// Global offset of the bound group's first row (local row index for
    /// uncommitted sources, before the high bit is applied).
    pub(crate) group_start_offset: NodeOffset,
    pub column_ids: ColumnIdList,
    pub predicates: Vec<(ColumnId, ColumnPredicateSet)>,
    pub semi_mask: Option<SemiMask>,
    pub node_id_vector: ValueVector,
    pub row_idx_vector: Vec<RowIdx>,
    pub output: Vec<ValueVector>,
    pub sel: SelectionVector,
    pub(crate) cursor: SegmentCursor,
}

impl NodeScanState {
    /// A state scanning `column_ids`, with output vectors typed accordingly.
    pub fn new(column_ids: ColumnIdList, output_types: Vec<LogicalType>) -> Self {
        debug_assert_eq!(column_ids.len(), output_types.len());
        Self {
            source: ScanSource::None,
            node_group_idx: 0,
            node_group: None,
            group_start_offset: 0,
            output: output_types.into_iter().map(ValueVector::new).collect(),
            column_ids,
            predicates: Vec::new(),
            semi_mask: None,
            node_id_vector: ValueVector::new(LogicalType::InternalId),
            row_idx_vector: Vec::new(),
            sel: SelectionVector::default(),
            cursor: SegmentCursor::default(),
        }
    }

    pub fn with_predicates(mut self, predicates: Vec<(ColumnId, ColumnPredicateSet)>) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn with_semi_mask(mut self, mask: SemiMask) -> Self {
        self.semi_mask = Some(mask);
        self
    }

    pub fn reset_out_vectors(&mut self) {
        for vector in &mut self.output {
            vector.clear();
        }
        self.sel.set_identity(0);
    }

    pub(crate) fn bind(
        &mut self,
        node_group: Option<Arc<NodeGroup>>,
        group_start_offset: NodeOffset,
    ) {
        self.node_group = node_group;
        self.group_start_offset = group_start_offset;
        self.cursor = SegmentCursor::default();
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.node_group.is_some()
    }
}

/// Inputs of [`crate::table::NodeTable::insert`]. Node ids for the inserted
/// rows are written back into `node_id_vector` at the selected positions.
pub struct NodeInsertState {
    pub node_id_vector: ValueVector,
    pub property_vectors: Vec<ValueVector>,
    pub sel: SelectionVector,
    pub log_to_wal: bool,
}

impl NodeInsertState {
    pub fn new(property_vectors: Vec<ValueVector>, sel: SelectionVector) -> Self {
        Self {
            node_id_vector: ValueVector::new(LogicalType::InternalId),
            property_vectors,
            sel,
            log_to_wal: true,
        }
    }

    /// Convenience for the common single-row case.
    pub fn single_row(row: Vec<Value>, types: &[LogicalType]) -> Self {
        let property_vectors = row
            .into_iter()
            .zip(types)
            .map(|(value, ty)| ValueVector::with_values(ty.clone(), vec![value]))
            .collect();
        Self::new(property_vectors, SelectionVector::identity(1))
    }
}

/// Inputs of [`crate::table::NodeTable::update`]; flattened to one row.
pub struct NodeUpdateState {
    pub node_id_vector: ValueVector,
    pub column_id: ColumnId,
    pub property_vector: ValueVector,
    pub log_to_wal: bool,
}

impl NodeUpdateState {
    pub fn new(node_offset_value: Value, column_id: ColumnId, value: ValueVector) -> Self {
        Self {
            node_id_vector: ValueVector::with_values(
                LogicalType::InternalId,
                vec![node_offset_value],
            ),
            column_id,
            property_vector: value,
            log_to_wal: true,
        }
    }
}

/// Inputs of [`crate::table::NodeTable::delete`]; flattened to one row.
pub struct NodeDeleteState {
    pub node_id_vector: ValueVector,
    pub pk_vector: ValueVector,
    pub log_to_wal: bool,
}

impl NodeDeleteState {
    pub fn new(node_id_value: Value, pk_vector: ValueVector) -> Self {
        Self {
            node_id_vector: ValueVector::with_values(LogicalType::InternalId, vec![node_id_value]),
            pk_vector,
            log_to_wal: true,
        }
    }
}

/// Inputs of [`crate::table::NodeTable::add_column`].
pub struct AddColumnState {
    pub property: PropertyDefinition,
    pub default_value: Value,
}
