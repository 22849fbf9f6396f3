//! The two index maintenance scans shared by commit and rollback.

use quiver_types::{NodeOffset, SelectionVector, SemiMask, ValueVector};

use crate::{
    error::Result,
    index::{Index as _, IndexKey},
    local::LocalNodeTable,
    table::NodeTable,
    transaction::Transaction,
};

/// Commit-side inserter: scans the primary-key column of the transaction's
/// local node groups (skipping rows tombstoned locally), assigns global
/// offsets from `start_node_offset` on, and installs the entries in batches.
pub(crate) fn insert_uncommitted_pk_entries(
    table: &NodeTable,
    txn: &Transaction,
    local: &LocalNodeTable,
    start_node_offset: NodeOffset,
) -> Result<()> {
    let pk_column_idx = table.pk_column_id().idx();
    let pk_type = table.pk_column_type();
    let is_visible = |offset: NodeOffset| table.is_visible(txn, offset);

    let capacity = local.node_groups().capacity();
    let num_groups = local.num_groups();
    for group_idx in 0..num_groups {
        let Some(group) = local.group(group_idx) else {
            continue;
        };
        let group_base = group_idx * capacity;
        let mut keys = ValueVector::new(pk_type.clone());
        let mut selected = Vec::new();
        let mut offsets = Vec::new();
        for row in 0..group.num_rows() {
            let local_row = group_base + row;
            keys.push(group.value(pk_column_idx, row)?);
            if local.is_deleted(txn, local_row) {
                continue;
            }
            selected.push(row as u32);
            offsets.push(start_node_offset + local_row);
        }
        if selected.is_empty() {
            continue;
        }
        let sel = SelectionVector::from_indices(selected);
        table
            .pk_index()
            .commit_insert(txn, &keys, &sel, &offsets, &is_visible)?;
    }
    Ok(())
}

/// Rollback-side deleter: builds a semi-mask over the rolled-back offset
/// range, scans that range's primary-key values from committed groups, and
/// removes every entry that still resolves to the same offset. This is the
/// only safe way to undo PK installs made earlier in the same transaction
/// without colliding with deleted-row entries.
pub(crate) fn delete_rolled_back_pk_entries(
    table: &NodeTable,
    _txn: &Transaction,
    start_node_offset: NodeOffset,
    num_rows: u64,
) {
    let pk_column_idx = table.pk_column_id().idx();
    let mut mask = SemiMask::new(start_node_offset + num_rows);
    mask.mask_range(start_node_offset, start_node_offset + num_rows);

    let capacity = table.node_groups().capacity();
    let first_group = start_node_offset / capacity;
    let last_group = (start_node_offset + num_rows).div_ceil(capacity);
    for group_idx in first_group..last_group {
        let Some(group) = table.node_groups().group(group_idx) else {
            continue;
        };
        let group_base = group_idx * capacity;
        for row in 0..group.num_rows() {
            let offset = group_base + row;
            if !mask.contains(offset) {
                continue;
            }
            let Ok(value) = group.value(pk_column_idx, row) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let Ok(key) = IndexKey::from_value(&value) else {
                continue;
            };
            // Only remove the entry if it currently resolves here; an equal
            // key installed for some other (live) row must survive.
            if table.pk_index().lookup_committed(&key, |o| o == offset) == Some(offset) {
                table.pk_index().remove_entry(&key, offset);
            }
        }
    }
}
