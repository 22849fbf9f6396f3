//! Fixed-size page allocation over the single database file.
//!
//! Page 0 is the file header. Pages are only ever overwritten through the
//! [`shadow::ShadowFile`]; freshly allocated pages (never visible to a
//! previous snapshot) may be written directly.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use parking_lot::Mutex;
use quiver_types::buffer::{Deserializer, Serializer};

use crate::error::{Error, Result};

pub mod shadow;

pub type PageIdx = u64;

pub const INVALID_PAGE: PageIdx = u64::MAX;

pub const FILE_MAGIC: [u8; 8] = *b"quiverdb";
pub const STORAGE_VERSION_MAJOR: u32 = 0;
pub const STORAGE_VERSION_MINOR: u32 = 1;

/// Contents of page 0.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub version_major: u32,
    pub version_minor: u32,
    pub page_size: u32,
    pub root_meta_page: PageIdx,
}

impl FileHeader {
    pub const LEN: usize = 8 + 4 + 4 + 4 + 8;

    pub fn new(page_size: u32) -> Self {
        Self {
            version_major: STORAGE_VERSION_MAJOR,
            version_minor: STORAGE_VERSION_MINOR,
            page_size,
            root_meta_page: INVALID_PAGE,
        }
    }

    /// Encodes into a full page image so it can travel through the shadow file.
    pub fn encode(&self, page_size: u32) -> Vec<u8> {
        let mut ser = Serializer::new();
        ser.write_bytes(&FILE_MAGIC);
        ser.write_u32(self.version_major);
        ser.write_u32(self.version_minor);
        ser.write_u32(self.page_size);
        ser.write_u64(self.root_meta_page);
        let mut page = ser.into_bytes();
        page.resize(page_size as usize, 0);
        page
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN || bytes[..8] != FILE_MAGIC {
            return Err(Error::Corruption(
                "database file does not start with magic".into(),
            ));
        }
        let mut de = Deserializer::new(&bytes[8..]);
        let version_major = de.read_u32()?;
        let version_minor = de.read_u32()?;
        let page_size = de.read_u32()?;
        let root_meta_page = de.read_u64()?;
        if version_major != STORAGE_VERSION_MAJOR {
            return Err(Error::Corruption(format!(
                "unsupported storage version {version_major}.{version_minor}"
            )));
        }
        if !page_size.is_power_of_two() || page_size < 512 {
            return Err(Error::Corruption(format!("invalid page size {page_size}")));
        }
        Ok(Self {
            version_major,
            version_minor,
            page_size,
            root_meta_page,
        })
    }
}

#[derive(Debug)]
enum Backing {
    File(Mutex<File>),
    /// `in_memory` mode: page images held in an arena, no I/O at all.
    Memory(Mutex<Vec<Option<Vec<u8>>>>),
}

/// Allocates and reclaims fixed-size pages.
#[derive(Debug)]
pub struct PageManager {
    backing: Backing,
    free_list: Mutex<Vec<PageIdx>>,
    /// One past the highest page ever allocated. Page 0 is the header.
    next_page: Mutex<PageIdx>,
    page_size: u32,
}

impl PageManager {
    /// Creates a fresh database file with a header page.
    pub fn create(path: &Path, page_size: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let header = FileHeader::new(page_size);
        file.write_all(&header.encode(page_size))?;
        file.sync_data()?;
        Ok(Self {
            backing: Backing::File(Mutex::new(file)),
            free_list: Mutex::new(Vec::new()),
            next_page: Mutex::new(1),
            page_size,
        })
    }

    /// Opens an existing database file, validating its header.
    pub fn open(path: &Path) -> Result<(Self, FileHeader)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        if len < FileHeader::LEN as u64 {
            return Err(Error::Corruption(
                "database file is shorter than its header".into(),
            ));
        }
        let mut first = vec![0; FileHeader::LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut first)?;
        let header = FileHeader::decode(&first)?;
        let page_size = header.page_size;
        let num_pages = len.div_ceil(page_size as u64).max(1);
        let pm = Self {
            backing: Backing::File(Mutex::new(file)),
            free_list: Mutex::new(Vec::new()),
            next_page: Mutex::new(num_pages),
            page_size,
        };
        Ok((pm, header))
    }

    /// A purely transient page manager backing `in_memory` mode.
    pub fn in_memory(page_size: u32) -> Self {
        Self {
            backing: Backing::Memory(Mutex::new(vec![Some(
                FileHeader::new(page_size).encode(page_size),
            )])),
            free_list: Mutex::new(Vec::new()),
            next_page: Mutex::new(1),
            page_size,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn num_pages(&self) -> u64 {
        *self.next_page.lock()
    }

    pub fn allocate(&self) -> PageIdx {
        if let Some(page) = self.free_list.lock().pop() {
            return page;
        }
        let mut next = self.next_page.lock();
        let page = *next;
        *next += 1;
        page
    }

    pub fn free(&self, page: PageIdx) {
        debug_assert_ne!(page, 0, "the header page is never freed");
        self.free_list.lock().push(page);
    }

    pub fn free_all(&self, pages: &[PageIdx]) {
        let mut free_list = self.free_list.lock();
        free_list.extend_from_slice(pages);
    }

    pub fn read_page(&self, page: PageIdx) -> Result<Vec<u8>> {
        let size = self.page_size as usize;
        match &self.backing {
            Backing::File(file) => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(page * self.page_size as u64))?;
                let mut buf = vec![0; size];
                // Reading past EOF yields zero bytes for the missing suffix,
                // matching a freshly allocated page that was never written.
                let mut filled = 0;
                while filled < size {
                    let n = file.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                Ok(buf)
            }
            Backing::Memory(pages) => {
                let pages = pages.lock();
                Ok(pages
                    .get(page as usize)
                    .and_then(|p| p.clone())
                    .unwrap_or_else(|| vec![0; size]))
            }
        }
    }

    /// Writes a page that was allocated during the current checkpoint and is
    /// therefore invisible to every existing snapshot.
    pub fn write_new_page(&self, page: PageIdx, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= self.page_size as usize);
        self.write_page_raw(page, data)
    }

    /// Raw page write; only the shadow file apply path and
    /// [`Self::write_new_page`] may call this.
    pub(crate) fn write_page_raw(&self, page: PageIdx, data: &[u8]) -> Result<()> {
        let size = self.page_size as usize;
        match &self.backing {
            Backing::File(file) => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(page * self.page_size as u64))?;
                file.write_all(data)?;
                if data.len() < size {
                    file.write_all(&vec![0; size - data.len()])?;
                }
                Ok(())
            }
            Backing::Memory(pages) => {
                let mut pages = pages.lock();
                if pages.len() <= page as usize {
                    pages.resize(page as usize + 1, None);
                }
                let mut image = data.to_vec();
                image.resize(size, 0);
                pages[page as usize] = Some(image);
                Ok(())
            }
        }
    }

    pub fn sync(&self) -> Result<()> {
        if let Backing::File(file) = &self.backing {
            file.lock().sync_data()?;
        }
        Ok(())
    }

    /// Snapshot of the allocator state, for metadata serialisation and for
    /// restoring after a failed checkpoint.
    pub fn allocator_state(&self) -> (Vec<PageIdx>, PageIdx) {
        (self.free_list.lock().clone(), *self.next_page.lock())
    }

    pub fn restore_allocator_state(&self, free_list: Vec<PageIdx>, next_page: PageIdx) {
        *self.free_list.lock() = free_list;
        *self.next_page.lock() = next_page;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_reuses_freed_pages() {
        let pm = PageManager::in_memory(4096);
        let a = pm.allocate();
        let b = pm.allocate();
        assert_ne!(a, b);
        pm.free(a);
        assert_eq!(pm.allocate(), a);
    }

    #[test]
    fn file_pages_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let pm = PageManager::create(&path, 4096).unwrap();
        let page = pm.allocate();
        pm.write_new_page(page, b"hello pages").unwrap();
        pm.sync().unwrap();
        drop(pm);

        let (pm, header) = PageManager::open(&path).unwrap();
        assert_eq!(header.page_size, 4096);
        let data = pm.read_page(page).unwrap();
        assert_eq!(&data[..11], b"hello pages");
    }

    #[test]
    fn bad_magic_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_db");
        std::fs::write(&path, b"definitely not a database").unwrap();
        match PageManager::open(&path) {
            Err(Error::Corruption(_)) => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
