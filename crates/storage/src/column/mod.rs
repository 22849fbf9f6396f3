//! Columns and their chunked storage.

use quiver_types::{LogicalType, Value};

use crate::error::Result;

pub mod chunk;
pub mod codec;

pub use chunk::{ChunkData, ColumnChunk, PageSpan};

/// Metadata of one persistent column: its name, type and compression flag.
/// The per-row storage lives in [`ColumnChunk`]s owned by the node groups.
#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub data_type: LogicalType,
    pub enable_compression: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: LogicalType, enable_compression: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            enable_compression,
        }
    }

    /// An empty chunk of this column's type.
    pub fn empty_chunk(&self, capacity: u64) -> ColumnChunk {
        ColumnChunk::new(self.data_type.clone(), capacity)
    }

    /// A chunk of `count` default values, used when the column is added to a
    /// table that already has rows.
    pub fn default_chunk(&self, capacity: u64, default: &Value, count: u64) -> Result<ColumnChunk> {
        ColumnChunk::filled(self.data_type.clone(), capacity, default, count)
    }
}
