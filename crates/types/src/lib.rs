//! Core identifiers, logical types, values and exchange vectors shared by the
//! Quiver storage crates.
//!
//! Nothing in this crate performs I/O. The on-disk byte conventions live in
//! [`buffer`]: little-endian fixed-width scalars, `u32` length-prefixed
//! strings, `u64` length-prefixed lists, no alignment, no padding.

mod ids;
mod value;
mod vector;

pub mod buffer;

pub use ids::{
    ColumnId, ColumnIdList, NodeGroupIdx, NodeOffset, RowIdx, TableId, is_local_offset,
    local_offset, local_row_idx,
};
pub use value::{Interval, InternalId, LogicalType, PhysicalType, StructField, Value};
pub use vector::{DEFAULT_VECTOR_CAPACITY, NullMask, SelectionVector, SemiMask, ValueVector};

/// Transaction identifiers and commit timestamps share one 64-bit space.
///
/// Commit timestamps are assigned from `1` upwards and always stay below
/// [`START_TRANSACTION_ID`]. Live transaction ids are assigned from
/// [`START_TRANSACTION_ID`] upwards, so a transaction id is newer than every
/// committed timestamp any snapshot can hold.
pub type TxnTs = u64;

/// First transaction id; also the sentinel "newer than any prepared snapshot".
pub const START_TRANSACTION_ID: TxnTs = 1 << 63;

/// Deletion-timestamp sentinel for rows that have not been deleted.
///
/// This is the only deletion sentinel: freshly allocated version metadata uses
/// insertion timestamp `0` (visible to every snapshot) and deletion timestamp
/// `NOT_DELETED`.
pub const NOT_DELETED: TxnTs = u64::MAX;
