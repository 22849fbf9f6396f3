//! The persistent primary-key hash index.
//!
//! An open-addressed table of fixed-size slots grouped into slot pages.
//! Probing is linear from `hash % num_primary_slots` and never wraps: when a
//! probe (or the load factor) runs past the tail, a new slot page is appended
//! and participates in probing — there is no full rehash, so slot positions
//! stay valid across extensions.

use std::collections::HashMap;

use log::debug;
use parking_lot::{Mutex, RwLock};
use quiver_types::{
    NodeOffset, SelectionVector, TxnTs, Value, ValueVector, is_local_offset,
    buffer::{Deserializer, Serializer},
};

use crate::{
    column::PageSpan,
    error::{Error, Result},
    index::{Index, IndexInfo, IndexKey, VisibleFn},
    page::PageManager,
    transaction::Transaction,
};

pub const PK_INDEX_NAME: &str = "PK";
pub const PK_INDEX_TYPE_NAME: &str = "HASH";

/// On-disk slot size: state(1) + fingerprint(2) + offset(8) + key area(21).
const SLOT_DISK_SIZE: usize = 32;
/// Key bytes that fit inline; longer keys go to the overflow area.
const INLINE_KEY_MAX: usize = 20;
const KEY_OVERFLOW_MARKER: u8 = 0xff;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Empty,
    Occupied,
    Tombstone,
}

#[derive(Clone, Debug)]
struct Slot {
    state: SlotState,
    fingerprint: u16,
    key: Option<IndexKey>,
    offset: NodeOffset,
}

impl Slot {
    fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            fingerprint: 0,
            key: None,
            offset: 0,
        }
    }
}

struct SlotArray {
    slots: Vec<Slot>,
    /// Fixed probe-start modulus; extensions never change it.
    num_primary: usize,
    num_occupied: usize,
    slots_per_page: usize,
}

impl SlotArray {
    fn new(slots_per_page: usize) -> Self {
        Self {
            slots: vec![Slot::empty(); slots_per_page],
            num_primary: slots_per_page,
            num_occupied: 0,
            slots_per_page,
        }
    }

    fn load_factor(&self) -> f64 {
        self.num_occupied as f64 / self.slots.len() as f64
    }

    fn extend_page(&mut self) {
        let new_len = self.slots.len() + self.slots_per_page;
        self.slots.resize(new_len, Slot::empty());
    }

    fn probe_start(&self, key: &IndexKey) -> usize {
        (key.hash64() % self.num_primary as u64) as usize
    }

    /// First offset whose slot matches `key` and satisfies `pred`.
    fn lookup(&self, key: &IndexKey, pred: impl Fn(NodeOffset) -> bool) -> Option<NodeOffset> {
        let fingerprint = key.fingerprint();
        let mut i = self.probe_start(key);
        while let Some(slot) = self.slots.get(i) {
            match slot.state {
                SlotState::Empty => return None,
                SlotState::Occupied => {
                    if slot.fingerprint == fingerprint
                        && slot.key.as_ref() == Some(key)
                        && pred(slot.offset)
                    {
                        return Some(slot.offset);
                    }
                }
                SlotState::Tombstone => {}
            }
            i += 1;
        }
        None
    }

    /// Installs `(key, offset)`, keeping the load factor under `max_load`.
    fn install(&mut self, key: IndexKey, offset: NodeOffset, max_load: f64) {
        let fingerprint = key.fingerprint();
        let mut i = self.probe_start(&key);
        let target = loop {
            if i >= self.slots.len() {
                self.extend_page();
            }
            match self.slots[i].state {
                SlotState::Empty | SlotState::Tombstone => break i,
                SlotState::Occupied => i += 1,
            }
        };
        self.slots[target] = Slot {
            state: SlotState::Occupied,
            fingerprint,
            key: Some(key),
            offset,
        };
        self.num_occupied += 1;
        if self.load_factor() > max_load {
            self.extend_page();
        }
    }

    /// Tombstones the first slot holding `key` (and `offset`, when given).
    fn remove(&mut self, key: &IndexKey, offset: Option<NodeOffset>) -> bool {
        let fingerprint = key.fingerprint();
        let mut i = self.probe_start(key);
        while let Some(slot) = self.slots.get_mut(i) {
            match slot.state {
                SlotState::Empty => return false,
                SlotState::Occupied => {
                    if slot.fingerprint == fingerprint
                        && slot.key.as_ref() == Some(key)
                        && offset.is_none_or(|o| o == slot.offset)
                    {
                        slot.state = SlotState::Tombstone;
                        slot.key = None;
                        self.num_occupied -= 1;
                        return true;
                    }
                    i += 1;
                }
                SlotState::Tombstone => i += 1,
            }
        }
        false
    }
}

/// Entries staged by the single writer, keyed by its transaction id.
#[derive(Default)]
struct LocalIndexState {
    owner: TxnTs,
    inserts: HashMap<IndexKey, NodeOffset>,
    deletes: HashMap<IndexKey, NodeOffset>,
}

impl LocalIndexState {
    fn for_txn(&mut self, txn: &Transaction) -> &mut Self {
        if self.owner != txn.id() {
            debug_assert!(self.inserts.is_empty() && self.deletes.is_empty());
            self.owner = txn.id();
        }
        self
    }

    fn clear(&mut self) {
        self.owner = 0;
        self.inserts.clear();
        self.deletes.clear();
    }
}

/// Persistent open-addressed hash index over the primary key column.
///
/// Stores only committed entries; staged inserts and deletes live in a
/// per-writer buffer until commit. Lookups filter through the caller's
/// visibility predicate so tombstoned rows never collide with re-used keys.
pub struct PrimaryKeyIndex {
    info: IndexInfo,
    slots: RwLock<SlotArray>,
    local: Mutex<LocalIndexState>,
    storage: Mutex<IndexStorage>,
    max_load: f64,
}

#[derive(Clone, Debug, Default)]
struct IndexStorage {
    slot_span: Option<PageSpan>,
    previous_slot_span: Option<PageSpan>,
}

impl PrimaryKeyIndex {
    pub fn create(info: IndexInfo, page_size: u32, max_load: f64) -> Self {
        let slots_per_page = (page_size as usize / SLOT_DISK_SIZE).max(8);
        Self {
            info,
            slots: RwLock::new(SlotArray::new(slots_per_page)),
            local: Mutex::new(LocalIndexState::default()),
            storage: Mutex::new(IndexStorage::default()),
            max_load,
        }
    }

    pub fn num_committed_entries(&self) -> usize {
        self.slots.read().num_occupied
    }

    /// Point lookup. Returns the offset whose key equals the vector entry at
    /// `pos` and for which `is_visible` holds; `None` for a NULL key without
    /// touching the index.
    pub fn lookup(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        pos: usize,
        is_visible: VisibleFn<'_>,
    ) -> Result<Option<NodeOffset>> {
        if keys.is_null(pos) {
            return Ok(None);
        }
        let key = IndexKey::from_value(keys.value(pos))?;
        self.lookup_key(txn, &key, is_visible)
    }

    pub fn lookup_key(
        &self,
        txn: &Transaction,
        key: &IndexKey,
        is_visible: VisibleFn<'_>,
    ) -> Result<Option<NodeOffset>> {
        {
            let local = self.local.lock();
            if local.owner == txn.id() {
                if let Some(offset) = local.inserts.get(key) {
                    return Ok(Some(*offset));
                }
                if local.deletes.contains_key(key) {
                    return Ok(None);
                }
            }
        }
        Ok(self.slots.read().lookup(key, |offset| is_visible(offset)))
    }

    /// Lookup against committed slots only, ignoring any staged state. The
    /// rollback scan uses this so a staged entry cannot shadow the committed
    /// entry it is about to remove.
    pub fn lookup_committed(
        &self,
        key: &IndexKey,
        pred: impl Fn(NodeOffset) -> bool,
    ) -> Option<NodeOffset> {
        self.slots.read().lookup(key, pred)
    }

    /// Removes a committed entry outright. This is the rollback path for PK
    /// installs made earlier in the same transaction; regular deletes stage
    /// through [`Index::delete`] instead.
    pub fn delete_key(&self, key: &IndexKey) -> bool {
        self.slots.write().remove(key, None)
    }

    /// Removes the committed entry for exactly `(key, offset)`.
    pub(crate) fn remove_entry(&self, key: &IndexKey, offset: NodeOffset) -> bool {
        self.slots.write().remove(key, Some(offset))
    }

    fn stage_insert(&self, txn: &Transaction, key: IndexKey, offset: NodeOffset) -> Result<()> {
        let mut local = self.local.lock();
        let local = local.for_txn(txn);
        local.deletes.remove(&key);
        if local.inserts.insert(key, offset).is_some() {
            return Err(Error::InvariantViolation(
                "staging a primary key twice without validation".into(),
            ));
        }
        Ok(())
    }

    fn install_committed(
        &self,
        keys: &ValueVector,
        pos: usize,
        offset: NodeOffset,
        is_visible: VisibleFn<'_>,
    ) -> Result<()> {
        let value = keys.value(pos);
        let key = IndexKey::from_value(value)?;
        let mut slots = self.slots.write();
        if let Some(found) = slots.lookup(&key, |o| is_visible(o)) {
            if found == offset {
                // Re-install of the same entry (PK update to the same value).
                return Ok(());
            }
            return Err(Error::DuplicatePk {
                key: value.to_string(),
            });
        }
        slots.install(key, offset, self.max_load);
        Ok(())
    }
}

impl Index for PrimaryKeyIndex {
    fn info(&self) -> &IndexInfo {
        &self.info
    }

    fn insert(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        sel: &SelectionVector,
        offsets: &[NodeOffset],
    ) -> Result<()> {
        debug_assert_eq!(sel.len(), offsets.len());
        for (i, pos) in sel.iter().enumerate() {
            if keys.is_null(pos) {
                return Err(Error::NullPk);
            }
            let key = IndexKey::from_value(keys.value(pos))?;
            self.stage_insert(txn, key, offsets[i])?;
        }
        Ok(())
    }

    fn commit_insert(
        &self,
        _txn: &Transaction,
        keys: &ValueVector,
        sel: &SelectionVector,
        offsets: &[NodeOffset],
        is_visible: VisibleFn<'_>,
    ) -> Result<()> {
        debug_assert_eq!(sel.len(), offsets.len());
        for (i, pos) in sel.iter().enumerate() {
            self.install_committed(keys, pos, offsets[i], is_visible)?;
        }
        Ok(())
    }

    fn delete(
        &self,
        txn: &Transaction,
        keys: &ValueVector,
        sel: &SelectionVector,
        offsets: &[NodeOffset],
    ) -> Result<()> {
        debug_assert_eq!(sel.len(), offsets.len());
        let mut local = self.local.lock();
        let local = local.for_txn(txn);
        for (i, pos) in sel.iter().enumerate() {
            if keys.is_null(pos) {
                continue;
            }
            let key = IndexKey::from_value(keys.value(pos))?;
            if local.inserts.remove(&key).is_some() {
                // The entry never left the staging buffer; dropping it is the
                // whole deletion.
                continue;
            }
            local.deletes.insert(key, offsets[i]);
        }
        Ok(())
    }

    fn finalize_commit(&self, txn: &Transaction, is_visible: VisibleFn<'_>) -> Result<()> {
        let (inserts, deletes) = {
            let mut local = self.local.lock();
            if local.owner != txn.id() {
                return Ok(());
            }
            let inserts = std::mem::take(&mut local.inserts);
            let deletes = std::mem::take(&mut local.deletes);
            local.clear();
            (inserts, deletes)
        };
        // Entries staged against local offsets were re-installed with their
        // final offsets by the commit drain scan; only entries that already
        // pointed at committed rows (PK updates) are installed here.
        for (key, offset) in inserts {
            if is_local_offset(offset) {
                continue;
            }
            let mut slots = self.slots.write();
            if let Some(found) = slots.lookup(&key, |o| is_visible(o))
                && found != offset
            {
                return Err(Error::DuplicatePk {
                    key: format!("{key:?}"),
                });
            } else if slots.lookup(&key, |o| o == offset).is_none() {
                slots.install(key, offset, self.max_load);
            }
        }
        // Staged deletes are applied outright: lookups of concurrent readers
        // re-check visibility anyway, and the committed drain has already
        // installed any replacement entry at its own offset.
        {
            let mut slots = self.slots.write();
            for (key, offset) in deletes {
                slots.remove(&key, Some(offset));
            }
        }
        Ok(())
    }

    fn rollback_local(&self, txn: &Transaction) {
        let mut local = self.local.lock();
        if local.owner == txn.id() {
            local.clear();
        }
    }

    /// Writes the slot array to fresh pages and retires the previous ones.
    fn checkpoint(&self, pm: &PageManager) -> Result<()> {
        let slots = self.slots.read();
        let blob = encode_slots(&slots);
        let page_size = pm.page_size() as usize;
        let mut pages = Vec::with_capacity(blob.len().div_ceil(page_size));
        for part in blob.chunks(page_size) {
            let page = pm.allocate();
            pm.write_new_page(page, part)?;
            pages.push(page);
        }
        let mut storage = self.storage.lock();
        storage.previous_slot_span = storage.slot_span.take();
        if let Some(previous) = &storage.previous_slot_span {
            pm.free_all(&previous.pages);
        }
        storage.slot_span = Some(PageSpan {
            pages,
            num_bytes: blob.len() as u64,
        });
        debug!(
            "pk index {}: checkpointed {} slot(s)",
            self.info.name, slots.num_occupied
        );
        Ok(())
    }

    fn rollback_checkpoint(&self) {
        let mut storage = self.storage.lock();
        if storage.previous_slot_span.is_some() {
            storage.slot_span = storage.previous_slot_span.take();
        }
    }

    fn reclaim_storage(&self, pm: &PageManager) {
        let mut storage = self.storage.lock();
        if let Some(span) = storage.slot_span.take() {
            pm.free_all(&span.pages);
        }
        storage.previous_slot_span = None;
    }

    fn storage_info(&self) -> Vec<u8> {
        let slots = self.slots.read();
        let storage = self.storage.lock();
        let mut ser = Serializer::new();
        ser.write_u64(slots.num_primary as u64);
        ser.write_u64(slots.slots.len() as u64);
        ser.write_u64(slots.slots_per_page as u64);
        ser.write_bool(storage.slot_span.is_some());
        if let Some(span) = &storage.slot_span {
            span.serialize(&mut ser);
        }
        ser.into_bytes()
    }
}

impl PrimaryKeyIndex {
    /// Rebuilds the index from its descriptor blob and slot pages.
    pub fn load(
        info: IndexInfo,
        storage_info: &[u8],
        pm: &PageManager,
        max_load: f64,
    ) -> Result<Self> {
        let mut de = Deserializer::new(storage_info);
        let num_primary = de.read_u64()? as usize;
        let num_slots = de.read_u64()? as usize;
        let slots_per_page = de.read_u64()? as usize;
        let mut array = SlotArray::new(slots_per_page.max(1));
        array.num_primary = num_primary.max(1);
        array.slots = vec![Slot::empty(); num_slots.max(array.num_primary)];
        let mut storage = IndexStorage::default();
        if de.read_bool()? {
            let span = PageSpan::deserialize(&mut de)?;
            let mut blob = Vec::with_capacity(span.num_bytes as usize);
            for page in &span.pages {
                blob.extend_from_slice(&pm.read_page(*page)?);
            }
            if (blob.len() as u64) < span.num_bytes {
                return Err(Error::Corruption("pk index pages shorter than span".into()));
            }
            blob.truncate(span.num_bytes as usize);
            decode_slots(&blob, &mut array)?;
            storage.slot_span = Some(span);
        }
        Ok(Self {
            info,
            slots: RwLock::new(array),
            local: Mutex::new(LocalIndexState::default()),
            storage: Mutex::new(storage),
            max_load,
        })
    }
}

/// Slot page image: fixed-size slots, then the overflow area for keys that
/// do not fit inline, then a trailing crc32c.
fn encode_slots(array: &SlotArray) -> Vec<u8> {
    let mut overflow = Serializer::new();
    let mut ser = Serializer::new();
    ser.write_u64(array.slots.len() as u64);
    for slot in &array.slots {
        let mut record = [0u8; SLOT_DISK_SIZE];
        record[0] = match slot.state {
            SlotState::Empty => 0,
            SlotState::Occupied => 1,
            SlotState::Tombstone => 2,
        };
        record[1..3].copy_from_slice(&slot.fingerprint.to_le_bytes());
        record[3..11].copy_from_slice(&slot.offset.to_le_bytes());
        if let Some(key) = &slot.key {
            let mut key_bytes = Serializer::new();
            key.serialize(&mut key_bytes);
            let key_bytes = key_bytes.into_bytes();
            if key_bytes.len() <= INLINE_KEY_MAX {
                record[11] = key_bytes.len() as u8;
                record[12..12 + key_bytes.len()].copy_from_slice(&key_bytes);
            } else {
                record[11] = KEY_OVERFLOW_MARKER;
                record[12..20].copy_from_slice(&(overflow.len() as u64).to_le_bytes());
                record[20..24].copy_from_slice(&(key_bytes.len() as u32).to_le_bytes());
                overflow.write_bytes(&key_bytes);
            }
        }
        ser.write_bytes(&record);
    }
    let overflow = overflow.into_bytes();
    ser.write_u64(overflow.len() as u64);
    ser.write_bytes(&overflow);
    let checksum = crc32c::crc32c(ser.bytes());
    ser.write_u32(checksum);
    ser.into_bytes()
}

fn decode_slots(blob: &[u8], array: &mut SlotArray) -> Result<()> {
    if blob.len() < 4 {
        return Err(Error::Corruption("pk index blob too short".into()));
    }
    let (payload, checksum_bytes) = blob.split_at(blob.len() - 4);
    let stored = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
    if crc32c::crc32c(payload) != stored {
        return Err(Error::Corruption("pk index blob checksum mismatch".into()));
    }
    let mut de = Deserializer::new(payload);
    let num_slots = de.read_u64()? as usize;
    let records_len = num_slots * SLOT_DISK_SIZE;
    let records = de.read_bytes(records_len)?;
    let overflow_len = de.read_u64()? as usize;
    let overflow = de.read_bytes(overflow_len)?;

    array.slots = vec![Slot::empty(); num_slots];
    array.num_occupied = 0;
    for (i, record) in records.chunks_exact(SLOT_DISK_SIZE).enumerate() {
        let state = match record[0] {
            0 => SlotState::Empty,
            1 => SlotState::Occupied,
            2 => SlotState::Tombstone,
            other => {
                return Err(Error::Corruption(format!("bad slot state byte {other}")));
            }
        };
        if state != SlotState::Occupied {
            array.slots[i].state = state;
            continue;
        }
        let fingerprint = u16::from_le_bytes(record[1..3].try_into().unwrap());
        let offset = u64::from_le_bytes(record[3..11].try_into().unwrap());
        let key_bytes = if record[11] == KEY_OVERFLOW_MARKER {
            let at = u64::from_le_bytes(record[12..20].try_into().unwrap()) as usize;
            let len = u32::from_le_bytes(record[20..24].try_into().unwrap()) as usize;
            overflow
                .get(at..at + len)
                .ok_or_else(|| Error::Corruption("pk overflow pointer out of range".into()))?
        } else {
            let len = record[11] as usize;
            if len > INLINE_KEY_MAX {
                return Err(Error::Corruption("bad inline key length".into()));
            }
            &record[12..12 + len]
        };
        let mut key_de = Deserializer::new(key_bytes);
        let key = IndexKey::deserialize(&mut key_de)?;
        array.slots[i] = Slot {
            state,
            fingerprint,
            key: Some(key),
            offset,
        };
        array.num_occupied += 1;
    }
    Ok(())
}
