//! The storage manager: table registry, transaction orchestration,
//! checkpointing and crash recovery.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use itertools::Itertools as _;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use quiver_types::{
    InternalId, TableId, TxnTs, Value, ValueVector,
    buffer::{Deserializer, Serializer},
};
use quiver_wal::{Replay, Wal, WalRecord};

use crate::{
    catalog::TableCatalogEntry,
    error::{Error, Result},
    options::Options,
    page::{FileHeader, INVALID_PAGE, PageIdx, PageManager, shadow::ShadowFile},
    table::{NodeDeleteState, NodeInsertState, NodeScanState, NodeTable, NodeUpdateState},
    transaction::{
        Transaction, TransactionManager, TransactionMode, VersionRecordHandler,
        VersionRecordRegistry,
    },
};

/// Shared handles every table needs: options, the page manager, the shadow
/// file and the WAL.
pub struct StorageContext {
    pub options: Options,
    pub page_manager: Arc<PageManager>,
    pub shadow: Arc<ShadowFile>,
    pub wal: Option<Arc<Mutex<Wal>>>,
}

fn data_path(base: &Path) -> PathBuf {
    base.to_owned()
}

fn shadow_path(base: &Path) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".shadow");
    PathBuf::from(path)
}

fn wal_path(base: &Path) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(".wal");
    PathBuf::from(path)
}

/// Owns every table and drives the §4.9 commit, rollback and checkpoint
/// protocols.
pub struct StorageManager {
    ctx: Arc<StorageContext>,
    catalog: RwLock<HashMap<TableId, TableCatalogEntry>>,
    tables: RwLock<HashMap<TableId, Arc<NodeTable>>>,
    txn_manager: TransactionManager,
    /// Pages of the current metadata chain, freed at the next checkpoint.
    meta_pages: Mutex<Vec<PageIdx>>,
    /// Set on fatal errors; the database is read-only until restart.
    read_only: AtomicBool,
}

impl StorageManager {
    /// A transient database: no pages on disk, no WAL, no checkpoints.
    pub fn in_memory(mut options: Options) -> Result<Self> {
        options.in_memory = true;
        options.validate()?;
        let ctx = Arc::new(StorageContext {
            page_manager: Arc::new(PageManager::in_memory(options.page_size)),
            shadow: Arc::new(ShadowFile::new(None, options.page_size)),
            wal: None,
            options,
        });
        Ok(Self::with_context(ctx))
    }

    /// Opens (or creates) the database at `base`, reconciling the shadow
    /// file and replaying the WAL.
    pub fn open(base: &Path, mut options: Options) -> Result<Self> {
        options.validate()?;
        if options.in_memory {
            return Self::in_memory(options);
        }
        let data = data_path(base);
        let existed = data.exists();
        let (pm, _) = if existed {
            PageManager::open(&data)?
        } else {
            (PageManager::create(&data, options.page_size)?, FileHeader::new(options.page_size))
        };
        let pm = Arc::new(pm);

        // A committed shadow left by a crashed checkpoint is replayed before
        // anything reads the header it may rewrite.
        ShadowFile::recover(&shadow_path(base), &pm)?;
        let header = FileHeader::decode(&pm.read_page(0)?)?;
        if header.page_size != pm.page_size() {
            return Err(Error::Corruption(format!(
                "header page size {} does not match file {}",
                header.page_size,
                pm.page_size()
            )));
        }
        // An existing file's page size is authoritative.
        options.page_size = header.page_size;

        let wal_file = wal_path(base);
        let wal = Arc::new(Mutex::new(Wal::open(&wal_file)?));
        let ctx = Arc::new(StorageContext {
            options,
            page_manager: pm,
            shadow: Arc::new(ShadowFile::new(Some(shadow_path(base)), options.page_size)),
            wal: Some(wal),
        });
        let manager = Self::with_context(ctx);
        if header.root_meta_page != INVALID_PAGE {
            manager.load_metadata(header.root_meta_page)?;
        }
        if existed {
            manager.replay_wal(&wal_file)?;
        }
        Ok(manager)
    }

    fn with_context(ctx: Arc<StorageContext>) -> Self {
        Self {
            ctx,
            catalog: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            txn_manager: TransactionManager::new(),
            meta_pages: Mutex::new(Vec::new()),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &Options {
        &self.ctx.options
    }

    pub fn context(&self) -> &Arc<StorageContext> {
        &self.ctx
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::InvariantViolation(
                "database is read-only after a fatal error; restart to recover".into(),
            ));
        }
        Ok(())
    }

    fn fatal_guard(&self, e: &Error) {
        if e.is_fatal() {
            warn!("fatal storage error, marking database read-only: {e}");
            self.read_only.store(true, Ordering::Release);
        }
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    /// Registers a table from its catalog entry. DDL sits outside the
    /// transactional core; the caller serialises it with other writes.
    pub fn create_table(&self, entry: TableCatalogEntry) -> Result<Arc<NodeTable>> {
        self.ensure_writable()?;
        let table_id = entry.table_id;
        if self.tables.read().contains_key(&table_id) {
            return Err(Error::InvariantViolation(format!(
                "table {table_id} already exists"
            )));
        }
        let table = Arc::new(NodeTable::new(self.ctx.clone(), &entry)?);
        self.catalog.write().insert(table_id, entry);
        self.tables.write().insert(table_id, table.clone());
        // DDL is durable on its own: persist the metadata now so recovery
        // knows the table before it replays the table's WAL records.
        self.checkpoint_impl(true)?;
        Ok(table)
    }

    /// Unregisters a table and returns its pages to the free list.
    pub fn drop_table(&self, table_id: TableId) -> Result<()> {
        self.ensure_writable()?;
        let table = self.tables.write().remove(&table_id).ok_or_else(|| {
            Error::InvariantViolation(format!("no table with id {table_id}"))
        })?;
        self.catalog.write().remove(&table_id);
        table.reclaim_storage();
        self.checkpoint_impl(true)?;
        Ok(())
    }

    pub fn table(&self, table_id: TableId) -> Result<Arc<NodeTable>> {
        self.tables.read().get(&table_id).cloned().ok_or_else(|| {
            Error::InvariantViolation(format!("no table with id {table_id}"))
        })
    }

    pub fn catalog_entry(&self, table_id: TableId) -> Result<TableCatalogEntry> {
        self.catalog.read().get(&table_id).cloned().ok_or_else(|| {
            Error::InvariantViolation(format!("no catalog entry for table {table_id}"))
        })
    }

    pub fn update_catalog_entry(&self, entry: TableCatalogEntry) {
        self.catalog.write().insert(entry.table_id, entry);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin_read(&self) -> Transaction {
        self.txn_manager.begin(TransactionMode::ReadOnly, false)
    }

    pub fn begin_write(&self) -> Result<Transaction> {
        self.ensure_writable()?;
        let log_to_wal = self.ctx.wal.is_some();
        Ok(self.txn_manager.begin(TransactionMode::Write, log_to_wal))
    }

    pub fn last_commit_ts(&self) -> TxnTs {
        self.txn_manager.last_commit_ts()
    }

    /// Commit protocol: assign the timestamp, drain local storage, flush the
    /// WAL through the commit marker, rewrite version stamps, publish.
    ///
    /// On error the transaction is rolled back before returning.
    pub fn commit(&self, txn: Transaction) -> Result<TxnTs> {
        if !txn.is_write() || !txn.has_changes() {
            return Ok(self.txn_manager.last_commit_ts());
        }
        let commit_ts = self.txn_manager.next_commit_ts();
        txn.set_commit_ts(commit_ts);
        match self.commit_inner(&txn, commit_ts) {
            Ok(()) => {
                txn.undo_commit(commit_ts, self);
                self.txn_manager.publish_commit(commit_ts);
                debug!("transaction {} committed at ts {commit_ts}", txn.id());
                Ok(commit_ts)
            }
            Err(e) => {
                warn!("commit of transaction {} failed, rolling back: {e}", txn.id());
                self.rollback_inner(&txn);
                self.fatal_guard(&e);
                Err(e)
            }
        }
    }

    fn commit_inner(&self, txn: &Transaction, commit_ts: TxnTs) -> Result<()> {
        for table_id in txn.touched_tables() {
            let table = self.table(table_id)?;
            let entry = self.catalog_entry(table_id)?;
            match txn.local_storage().remove(table_id) {
                Some(local) => table.commit(txn, &entry, local)?,
                None => table.finalize_index_commit(txn)?,
            }
        }
        if txn.should_log_to_wal()
            && let Some(wal) = &self.ctx.wal
        {
            let mut wal = wal.lock();
            wal.append(&WalRecord::Commit { commit_ts })?;
            wal.sync()?;
        }
        Ok(())
    }

    /// Walks the undo buffer in reverse and drops the local storage. After
    /// this the collection row counts and the PK index entry set match their
    /// state at transaction begin.
    pub fn rollback(&self, txn: Transaction) {
        if txn.is_write() {
            debug!("rolling back transaction {}", txn.id());
            self.rollback_inner(&txn);
        }
    }

    fn rollback_inner(&self, txn: &Transaction) {
        txn.undo_rollback(self);
        for table_id in txn.touched_tables() {
            if let Ok(table) = self.table(table_id) {
                table.rollback_index_local_state(txn);
            }
            txn.local_storage().remove(table_id);
        }
        // Mark the transaction's redo records dead so replay never folds
        // them into the next commit's batch.
        if txn.should_log_to_wal()
            && txn.has_changes()
            && let Some(wal) = &self.ctx.wal
            && let Err(e) = wal.lock().append(&WalRecord::Rollback)
        {
            warn!("failed to append rollback marker: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Checkpoint
    // ------------------------------------------------------------------

    /// Has the WAL grown past the configured checkpoint threshold?
    pub fn should_checkpoint(&self) -> bool {
        self.ctx
            .wal
            .as_ref()
            .is_some_and(|wal| wal.lock().size() >= self.ctx.options.checkpoint_threshold_bytes)
    }

    /// Checkpoint protocol: under a checkpoint transaction (whose snapshot
    /// covers every commit), flush changed tables and indexes, atomically
    /// swap in the new metadata via the shadow file, then truncate the WAL.
    ///
    /// Returns whether anything was written; a second checkpoint right after
    /// a first observes no changes and is a no-op.
    pub fn checkpoint(&self) -> Result<bool> {
        self.checkpoint_impl(false)
    }

    fn checkpoint_impl(&self, force_meta: bool) -> Result<bool> {
        self.ensure_writable()?;
        if self.ctx.options.in_memory {
            return Ok(false);
        }
        let txn = self.txn_manager.begin(TransactionMode::Checkpoint, false);
        let (free_list, next_page) = self.ctx.page_manager.allocator_state();
        match self.checkpoint_inner(&txn, force_meta) {
            Ok(wrote) => Ok(wrote),
            Err(e) => {
                warn!("checkpoint failed, reverting: {e}");
                for table in self.tables.read().values() {
                    table.rollback_checkpoint();
                }
                self.ctx.shadow.revert();
                self.ctx.page_manager.restore_allocator_state(free_list, next_page);
                self.fatal_guard(&e);
                Err(e)
            }
        }
    }

    fn checkpoint_inner(&self, _txn: &Transaction, force_meta: bool) -> Result<bool> {
        let mut wrote = false;
        let table_ids: Vec<TableId> = self.tables.read().keys().copied().sorted().collect();
        for table_id in &table_ids {
            let table = self.table(*table_id)?;
            let mut entry = self.catalog_entry(*table_id)?;
            if table.checkpoint(&mut entry)? {
                wrote = true;
            }
            self.update_catalog_entry(entry);
        }
        if !wrote && !force_meta {
            debug!("checkpoint: no table has changes, skipping");
            return Ok(false);
        }
        self.write_metadata(&table_ids)?;
        if let Some(wal) = &self.ctx.wal {
            let mut wal = wal.lock();
            wal.append(&WalRecord::Checkpoint)?;
            wal.sync()?;
            wal.reset()?;
        }
        info!("checkpoint complete: {} table(s)", table_ids.len());
        Ok(true)
    }

    /// Serialises catalog entries, table metadata and the allocator state
    /// into a page chain, then swaps the header's root pointer through the
    /// shadow file.
    fn write_metadata(&self, table_ids: &[TableId]) -> Result<()> {
        let pm = &self.ctx.page_manager;
        // The previous chain becomes garbage once the new root is live; free
        // it first so its pages are reusable and accounted in the free list.
        for page in self.meta_pages.lock().drain(..) {
            pm.free(page);
        }

        let mut body = Serializer::new();
        body.write_list_len(table_ids.len());
        for table_id in table_ids {
            self.catalog_entry(*table_id)?.serialize(&mut body);
            self.table(*table_id)?.serialize(&mut body)?;
        }
        let body = body.into_bytes();

        // Allocate the chain before serialising the allocator: allocation
        // only shrinks the free list, so the blob can only get smaller than
        // the estimate.
        let page_size = pm.page_size() as usize;
        let payload_per_page = page_size - 8;
        let (free_list_now, _) = pm.allocator_state();
        let estimate = body.len() + 8 * free_list_now.len() + 64;
        let num_pages = estimate.div_ceil(payload_per_page).max(1);
        let pages: Vec<PageIdx> = (0..num_pages).map(|_| pm.allocate()).collect();

        let mut ser = Serializer::new();
        ser.write_bytes(&body);
        let (free_list, next_page) = pm.allocator_state();
        ser.write_list_len(free_list.len());
        for page in &free_list {
            ser.write_u64(*page);
        }
        ser.write_u64(next_page);
        let checksum = crc32c::crc32c(ser.bytes());
        ser.write_u32(checksum);
        let blob = ser.into_bytes();
        debug_assert!(blob.len() <= num_pages * payload_per_page);

        for (i, page) in pages.iter().enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(INVALID_PAGE);
            let start = i * payload_per_page;
            let end = ((i + 1) * payload_per_page).min(blob.len());
            let mut image = Vec::with_capacity(page_size);
            image.extend_from_slice(&next.to_le_bytes());
            if start < blob.len() {
                image.extend_from_slice(&blob[start..end]);
            }
            pm.write_new_page(*page, &image)?;
        }
        pm.sync()?;

        // The atomic switch: the header rewrite goes through the shadow file.
        let mut header = FileHeader::new(pm.page_size());
        header.root_meta_page = pages[0];
        self.ctx.shadow.stage_page(0, header.encode(pm.page_size()));
        self.ctx.shadow.commit(pm)?;
        *self.meta_pages.lock() = pages;
        Ok(())
    }

    fn load_metadata(&self, root: PageIdx) -> Result<()> {
        let pm = &self.ctx.page_manager;
        let payload_per_page = pm.page_size() as usize - 8;
        let mut blob = Vec::new();
        let mut pages = Vec::new();
        let mut page = root;
        while page != INVALID_PAGE {
            let image = pm.read_page(page)?;
            pages.push(page);
            let next = u64::from_le_bytes(image[..8].try_into().unwrap());
            blob.extend_from_slice(&image[8..8 + payload_per_page.min(image.len() - 8)]);
            page = next;
        }
        // The blob is padded up to the chain length; the checksum sits right
        // where the serialised data ends, so find it by decoding.
        let mut de = Deserializer::new(&blob);
        let num_tables = de.read_list_len()?;
        let mut loaded = Vec::with_capacity(num_tables);
        for _ in 0..num_tables {
            let entry = TableCatalogEntry::deserialize(&mut de)?;
            let table = NodeTable::deserialize(self.ctx.clone(), &entry, &mut de)?;
            loaded.push((entry, table));
        }
        let num_free = de.read_list_len()?;
        let mut free_list = Vec::with_capacity(num_free);
        for _ in 0..num_free {
            free_list.push(de.read_u64()?);
        }
        let next_page = de.read_u64()?;
        let body_len = de.position();
        let stored = de.read_u32()?;
        if crc32c::crc32c(&blob[..body_len]) != stored {
            return Err(Error::Corruption("metadata checksum mismatch".into()));
        }

        pm.restore_allocator_state(free_list, next_page);
        *self.meta_pages.lock() = pages;
        let mut catalog = self.catalog.write();
        let mut tables = self.tables.write();
        for (entry, table) in loaded {
            let table_id = entry.table_id;
            catalog.insert(table_id, entry);
            tables.insert(table_id, Arc::new(table));
        }
        info!("loaded {} table(s) from metadata", num_tables);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Replays committed WAL batches in file order, truncates the torn tail,
    /// and checkpoints so the log can start fresh.
    fn replay_wal(&self, path: &Path) -> Result<()> {
        let mut replay = match Replay::open(path) {
            Ok(replay) => replay,
            Err(quiver_wal::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut batch = Vec::new();
        let mut applied = 0u64;
        let mut committed_end = quiver_wal::Header::LEN as u64;
        while let Some(record) = replay.next() {
            match record {
                WalRecord::Commit { commit_ts } => {
                    self.apply_batch(std::mem::take(&mut batch), commit_ts)?;
                    applied += 1;
                    committed_end = replay.good_end();
                }
                WalRecord::Rollback => batch.clear(),
                WalRecord::Checkpoint => {
                    batch.clear();
                    committed_end = replay.good_end();
                }
                record => batch.push(record),
            }
        }
        if !batch.is_empty() {
            debug!("recovery: discarding {} record(s) after the last commit", batch.len());
        }
        if let Some(wal) = &self.ctx.wal {
            wal.lock().truncate_to(committed_end)?;
        }
        if applied > 0 {
            info!("recovery: replayed {applied} committed transaction(s)");
            self.checkpoint()?;
        }
        Ok(())
    }

    fn apply_batch(&self, batch: Vec<WalRecord>, commit_ts: TxnTs) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let txn = self.txn_manager.begin(TransactionMode::Recovery, false);
        for record in batch {
            match record {
                WalRecord::TableInsertion { table_id, rows, .. } => {
                    let table = self.table(table_id)?;
                    let types = table.column_types();
                    for row in rows {
                        let mut state = NodeInsertState::single_row(row, &types);
                        state.log_to_wal = false;
                        table.insert(&txn, &mut state)?;
                    }
                }
                WalRecord::NodeUpdate {
                    table_id,
                    column_id,
                    node_offset,
                    value,
                } => {
                    let table = self.table(table_id)?;
                    let types = table.column_types();
                    let mut state = NodeUpdateState::new(
                        Value::InternalId(InternalId {
                            table_id,
                            offset: node_offset,
                        }),
                        column_id,
                        ValueVector::with_values(types[column_id.idx()].clone(), vec![value]),
                    );
                    state.log_to_wal = false;
                    table.update(&txn, &mut state)?;
                }
                WalRecord::NodeDeletion {
                    table_id,
                    node_offset,
                    pk,
                } => {
                    let table = self.table(table_id)?;
                    let mut state = NodeDeleteState::new(
                        Value::InternalId(InternalId {
                            table_id,
                            offset: node_offset,
                        }),
                        ValueVector::with_values(table.pk_column_type(), vec![pk]),
                    );
                    state.log_to_wal = false;
                    table.delete(&txn, &mut state)?;
                }
                WalRecord::Commit { .. } | WalRecord::Rollback | WalRecord::Checkpoint => {
                    return Err(Error::InvariantViolation(
                        "nested transaction marker in recovery batch".into(),
                    ));
                }
            }
        }
        debug!("recovery: re-committing transaction originally at ts {commit_ts}");
        self.commit(txn)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Convenience
    // ------------------------------------------------------------------

    /// A scan state over `column_ids` of `table_id`.
    pub fn scan_state(&self, table_id: TableId, column_ids: &[u32]) -> Result<NodeScanState> {
        let table = self.table(table_id)?;
        let types = table.column_types();
        let column_ids: quiver_types::ColumnIdList =
            column_ids.iter().map(|id| quiver_types::ColumnId(*id)).collect();
        let output_types = column_ids
            .iter()
            .map(|id| types[id.idx()].clone())
            .collect();
        Ok(NodeScanState::new(column_ids, output_types))
    }
}

impl VersionRecordRegistry for StorageManager {
    fn version_record_handler(&self, table_id: TableId) -> Option<Arc<dyn VersionRecordHandler>> {
        self.tables
            .read()
            .get(&table_id)
            .cloned()
            .map(|t| t as Arc<dyn VersionRecordHandler>)
    }
}
