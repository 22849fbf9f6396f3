use std::fmt;

use smallvec::SmallVec;

/// Stable identifier of a node table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableId(pub u32);

/// Identifier of a column within its table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ColumnId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TableId {
    fn from(id: u32) -> Self {
        TableId(id)
    }
}

impl From<u32> for ColumnId {
    fn from(id: u32) -> Self {
        ColumnId(id)
    }
}

impl ColumnId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A short list of column ids, inline for the common few-column case.
pub type ColumnIdList = SmallVec<[ColumnId; 4]>;

/// Index of a node group within a table's node group collection.
pub type NodeGroupIdx = u64;

/// Row index local to some container (a segment, a node group, a local table).
pub type RowIdx = u64;

/// Global 64-bit node offset.
///
/// The high bit is reserved: offsets with the high bit set address uncommitted
/// rows in the owning transaction's local table. [`local_row_idx`] strips the
/// bit; the encoding exists only at the external node-id boundary.
pub type NodeOffset = u64;

const LOCAL_OFFSET_BIT: u64 = 1 << 63;

/// Does `offset` address an uncommitted row in a local table?
#[inline]
pub fn is_local_offset(offset: NodeOffset) -> bool {
    offset & LOCAL_OFFSET_BIT != 0
}

/// Encode a local-table row index as an external node offset.
#[inline]
pub fn local_offset(row: RowIdx) -> NodeOffset {
    debug_assert_eq!(row & LOCAL_OFFSET_BIT, 0);
    row | LOCAL_OFFSET_BIT
}

/// Decode a local-table row index from an external node offset.
#[inline]
pub fn local_row_idx(offset: NodeOffset) -> RowIdx {
    offset & !LOCAL_OFFSET_BIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_offset_roundtrip() {
        assert!(!is_local_offset(42));
        let encoded = local_offset(42);
        assert!(is_local_offset(encoded));
        assert_eq!(local_row_idx(encoded), 42);
    }
}
