//! Staging area for page rewrites.
//!
//! Overwriting a live page goes through here: the new images are first
//! written aside to the shadow file, made durable, and only then copied into
//! the database file. A crash on either side of the durability point leaves
//! the database recoverable — before it the shadow is discarded, after it the
//! apply is replayed (it is idempotent).

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use parking_lot::Mutex;
use quiver_types::buffer::{Deserializer, Serializer};

use crate::error::{Error, Result};

use super::{PageIdx, PageManager};

pub const SHADOW_MAGIC: [u8; 8] = *b"qvrshdw\0";

const FLAG_PREPARED: u8 = 0;
const FLAG_COMMITTED: u8 = 1;
/// Byte offset of the flag within the shadow header.
const FLAG_OFFSET: u64 = SHADOW_MAGIC.len() as u64;

/// In-memory staged page images, flushed and swapped at checkpoint.
pub struct ShadowFile {
    path: Option<PathBuf>,
    staged: Mutex<Vec<(PageIdx, Vec<u8>)>>,
    page_size: u32,
}

impl ShadowFile {
    pub fn new(path: Option<PathBuf>, page_size: u32) -> Self {
        Self {
            path,
            staged: Mutex::new(Vec::new()),
            page_size,
        }
    }

    /// Stages a replacement image for `page`.
    pub fn stage_page(&self, page: PageIdx, mut data: Vec<u8>) {
        data.resize(self.page_size as usize, 0);
        self.staged.lock().push((page, data));
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.lock().is_empty()
    }

    /// Discards everything staged since the last commit.
    pub fn revert(&self) {
        self.staged.lock().clear();
    }

    /// Two-phase swap: persist the staged pages, then apply them to the
    /// database file. Clears the shadow file afterwards.
    pub fn commit(&self, pm: &PageManager) -> Result<()> {
        let staged = std::mem::take(&mut *self.staged.lock());
        if staged.is_empty() {
            return Ok(());
        }
        let Some(path) = &self.path else {
            // In-memory databases skip the durability dance.
            for (page, data) in staged {
                pm.write_page_raw(page, &data)?;
            }
            return Ok(());
        };

        debug!("shadow: staging {} page(s)", staged.len());
        let body = encode_body(&staged);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&SHADOW_MAGIC)?;
        file.write_all(&[FLAG_PREPARED])?;
        file.write_all(&body)?;
        file.sync_data()?;

        // Durability point: once the committed flag hits disk, the swap must
        // complete (possibly replayed by recovery).
        file.seek(SeekFrom::Start(FLAG_OFFSET))?;
        file.write_all(&[FLAG_COMMITTED])?;
        file.sync_data()?;

        apply(&staged, pm)?;
        pm.sync()?;

        file.set_len(0)?;
        file.sync_data()?;
        Ok(())
    }

    /// Reconciles a shadow file left behind by a previous process, if any.
    ///
    /// Returns `true` when a committed shadow was (re-)applied.
    pub fn recover(path: &Path, pm: &PageManager) -> Result<bool> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let len = file.seek(SeekFrom::End(0))?;
        if len == 0 {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(0))?;
        let mut head = [0u8; SHADOW_MAGIC.len() + 1];
        if file.read_exact(&mut head).is_err() || head[..SHADOW_MAGIC.len()] != SHADOW_MAGIC {
            // Torn before the header was complete: the swap never became
            // durable, the old database state is intact.
            warn!("shadow: discarding unrecognisable shadow file");
            drop(file);
            std::fs::remove_file(path)?;
            return Ok(false);
        }
        let flag = head[SHADOW_MAGIC.len()];
        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        match decode_body(&body, pm.page_size()) {
            Ok(staged) => {
                if flag == FLAG_COMMITTED {
                    debug!("shadow: replaying {} page(s)", staged.len());
                    apply(&staged, pm)?;
                    pm.sync()?;
                } else {
                    debug!("shadow: discarding prepared-but-uncommitted shadow");
                }
                std::fs::remove_file(path)?;
                Ok(flag == FLAG_COMMITTED)
            }
            Err(e) => {
                if flag == FLAG_COMMITTED {
                    // Committed but unreadable: the database file may hold a
                    // half-applied swap. Refuse to open.
                    return Err(Error::ShadowFileRecovery(format!(
                        "committed shadow file is unreadable: {e}"
                    )));
                }
                warn!("shadow: discarding torn uncommitted shadow: {e}");
                std::fs::remove_file(path)?;
                Ok(false)
            }
        }
    }
}

fn apply(staged: &[(PageIdx, Vec<u8>)], pm: &PageManager) -> Result<()> {
    for (page, data) in staged {
        pm.write_page_raw(*page, data)?;
    }
    Ok(())
}

fn encode_body(staged: &[(PageIdx, Vec<u8>)]) -> Vec<u8> {
    let mut ser = Serializer::new();
    ser.write_list_len(staged.len());
    for (page, data) in staged {
        ser.write_u64(*page);
        ser.write_bytes(data);
    }
    let checksum = crc32c::crc32c(ser.bytes());
    ser.write_u32(checksum);
    ser.into_bytes()
}

fn decode_body(body: &[u8], page_size: u32) -> Result<Vec<(PageIdx, Vec<u8>)>> {
    if body.len() < 4 {
        return Err(Error::Corruption("shadow body too short".into()));
    }
    let (payload, checksum_bytes) = body.split_at(body.len() - 4);
    let stored = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
    if crc32c::crc32c(payload) != stored {
        return Err(Error::Corruption("shadow body checksum mismatch".into()));
    }
    let mut de = Deserializer::new(payload);
    let count = de.read_list_len()?;
    let mut staged = Vec::with_capacity(count);
    for _ in 0..count {
        let page = de.read_u64()?;
        let data = de.read_bytes(page_size as usize)?.to_vec();
        staged.push((page, data));
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_pages() -> Vec<(PageIdx, Vec<u8>)> {
        vec![(1, vec![0xaa; 4096]), (3, vec![0xbb; 4096])]
    }

    #[test]
    fn commit_applies_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let shadow_path = dir.path().join("db.shadow");
        let pm = PageManager::in_memory(4096);
        let shadow = ShadowFile::new(Some(shadow_path.clone()), 4096);
        for (page, data) in staged_pages() {
            shadow.stage_page(page, data);
        }
        shadow.commit(&pm).unwrap();
        assert_eq!(pm.read_page(1).unwrap(), vec![0xaa; 4096]);
        assert_eq!(pm.read_page(3).unwrap(), vec![0xbb; 4096]);
        assert_eq!(std::fs::metadata(&shadow_path).unwrap().len(), 0);
    }

    #[test]
    fn committed_shadow_is_replayed_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let shadow_path = dir.path().join("db.shadow");
        let body = encode_body(&staged_pages());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SHADOW_MAGIC);
        bytes.push(FLAG_COMMITTED);
        bytes.extend_from_slice(&body);
        std::fs::write(&shadow_path, &bytes).unwrap();

        let pm = PageManager::in_memory(4096);
        assert!(ShadowFile::recover(&shadow_path, &pm).unwrap());
        assert_eq!(pm.read_page(3).unwrap(), vec![0xbb; 4096]);
        assert!(!shadow_path.exists());
    }

    #[test]
    fn prepared_shadow_is_discarded_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let shadow_path = dir.path().join("db.shadow");
        let body = encode_body(&staged_pages());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SHADOW_MAGIC);
        bytes.push(FLAG_PREPARED);
        bytes.extend_from_slice(&body);
        std::fs::write(&shadow_path, &bytes).unwrap();

        let pm = PageManager::in_memory(4096);
        assert!(!ShadowFile::recover(&shadow_path, &pm).unwrap());
        assert_eq!(pm.read_page(3).unwrap(), vec![0; 4096]);
        assert!(!shadow_path.exists());
    }

    #[test]
    fn corrupt_committed_shadow_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let shadow_path = dir.path().join("db.shadow");
        let mut body = encode_body(&staged_pages());
        let len = body.len();
        body[len / 2] ^= 0xff;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SHADOW_MAGIC);
        bytes.push(FLAG_COMMITTED);
        bytes.extend_from_slice(&body);
        std::fs::write(&shadow_path, &bytes).unwrap();

        let pm = PageManager::in_memory(4096);
        match ShadowFile::recover(&shadow_path, &pm) {
            Err(Error::ShadowFileRecovery(_)) => {}
            other => panic!("expected shadow recovery error, got {other:?}"),
        }
    }
}
