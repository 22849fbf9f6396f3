//! Index holders and the opaque index contract.

use std::sync::Arc;

use quiver_types::{
    ColumnId, ColumnIdList, NodeOffset, PhysicalType, SelectionVector, TableId, ValueVector,
    buffer::{Deserializer, Serializer},
};

use crate::{error::Result, page::PageManager, transaction::Transaction};

pub mod key;
pub mod pk;

pub use key::IndexKey;
pub use pk::PrimaryKeyIndex;

/// A caller-supplied predicate deciding whether a candidate offset is live
/// from the caller's viewpoint. Every index lookup takes one; without it a
/// tombstoned row could collide with a new insert carrying the same key.
pub type VisibleFn<'a> = &'a dyn Fn(NodeOffset) -> bool;

/// Descriptor of an index, persisted in the table's metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub type_name: String,
    pub table_id: TableId,
    pub column_ids: ColumnIdList,
    pub physical_types: Vec<PhysicalType>,
    pub is_primary: bool,
    pub is_builtin: bool,
}

impl IndexInfo {
    pub fn serialize(&self, ser: &mut Serializer) {
        ser.write_string(&self.name);
        ser.write_string(&self.type_name);
        ser.write_u32(self.table_id.0);
        ser.write_list_len(self.column_ids.len());
        for column_id in &self.column_ids {
            ser.write_u32(column_id.0);
        }
        ser.write_list_len(self.physical_types.len());
        for physical in &self.physical_types {
            ser.write_u8(physical.to_u8());
        }
        ser.write_bool(self.is_primary);
        ser.write_bool(self.is_builtin);
    }

    pub fn deserialize(de: &mut Deserializer<'_>) -> Result<Self> {
        let name = de.read_string()?;
        let type_name = de.read_string()?;
        let table_id = TableId(de.read_u32()?);
        let num_columns = de.read_list_len()?;
        let mut column_ids = ColumnIdList::with_capacity(num_columns);
        for _ in 0..num_columns {
            column_ids.push(ColumnId(de.read_u32()?));
        }
        let num_types = de.read_list_len()?;
        let mut physical_types = Vec::with_capacity(num_types);
        for _ in 0..num_types {
            physical_types.push(PhysicalType::from_u8(de.read_u8()?).map_err(crate::error::Error::from)?);
        }
        let is_primary = de.read_bool()?;
        let is_builtin = de.read_bool()?;
        Ok(Self {
            name,
            type_name,
            table_id,
            column_ids,
            physical_types,
            is_primary,
            is_builtin,
        })
    }
}

/// The index contract the node table drives.
///
/// `insert` stages uncommitted entries; `commit_insert` installs committed
/// ones. Only the primary key index participates in rollback of committed
/// installs; other index kinds receive the commit and checkpoint callbacks
/// and manage their own storage.
pub trait Index: Send + Sync {
    fn info(&self) -> &IndexInfo;

    /// Stages `(key, offset)` pairs for the selected positions; they become
    /// visible at commit via [`Index::commit_insert`].
    fn insert(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        sel: &SelectionVector,
        offsets: &[NodeOffset],
    ) -> Result<()>;

    /// Installs committed entries. Fails with `DuplicatePk` when a key
    /// already resolves to a different visible offset.
    fn commit_insert(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        sel: &SelectionVector,
        offsets: &[NodeOffset],
        is_visible: VisibleFn<'_>,
    ) -> Result<()>;

    /// Stages the removal of `(key, offset)` pairs; committed entries are
    /// vacuumed at checkpoint once the owning rows are tombstoned.
    fn delete(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        sel: &SelectionVector,
        offsets: &[NodeOffset],
    ) -> Result<()>;

    /// Called when the owning transaction commits, after the local drain.
    fn finalize_commit(&self, txn: &Transaction, is_visible: VisibleFn<'_>) -> Result<()>;

    /// Drops everything the transaction staged.
    fn rollback_local(&self, txn: &Transaction);

    fn checkpoint(&self, pm: &PageManager) -> Result<()>;

    fn rollback_checkpoint(&self);

    fn reclaim_storage(&self, pm: &PageManager);

    /// Opaque storage blob stored in the index descriptor.
    fn storage_info(&self) -> Vec<u8>;
}

/// A loaded index plus its descriptor, as the table holds them.
#[derive(Clone)]
pub struct IndexHolder {
    pub index: Arc<dyn Index>,
}

impl IndexHolder {
    pub fn new(index: Arc<dyn Index>) -> Self {
        Self { index }
    }

    pub fn name(&self) -> &str {
        &self.index.info().name
    }

    /// Descriptor layout: `[info | storage_info_len u64 | storage_info]`.
    pub fn serialize(&self, ser: &mut Serializer) {
        self.index.info().serialize(ser);
        let blob = self.index.storage_info();
        ser.write_u64(blob.len() as u64);
        ser.write_bytes(&blob);
    }
}
