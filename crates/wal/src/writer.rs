use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Seek, SeekFrom, Write as _},
    path::{Path, PathBuf},
};

use log::debug;
use quiver_types::buffer::Serializer;

use crate::{Error, Header, WalRecord, record_checksum};

/// Anything that can be fsync'd and truncated like a file.
pub trait FileLike {
    fn fsync(&mut self) -> io::Result<()>;
    fn ftruncate(&mut self, size: u64) -> io::Result<()>;
}

impl FileLike for File {
    fn fsync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn ftruncate(&mut self, size: u64) -> io::Result<()> {
        self.set_len(size)
    }
}

/// The append side of the write-ahead log.
///
/// Records buffer in memory until [`Wal::sync`], which flushes and fsyncs.
/// The commit protocol appends a [`WalRecord::Commit`] marker and then calls
/// `sync`; everything before an unsynced marker may be lost on crash, which
/// is exactly the prefix recovery discards anyway.
#[derive(Debug)]
pub struct Wal {
    inner: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
}

impl Wal {
    /// Open `path` for appending, creating it (with a fresh header) if absent.
    ///
    /// The caller is responsible for having truncated a torn tail first; see
    /// [`crate::Replay::good_end`].
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        let bytes_written = if len < Header::LEN as u64 {
            // Empty, or torn while the very first header was being written;
            // nothing durable can exist yet.
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            Header::default().write(&mut file)?;
            file.sync_data()?;
            debug!("starting fresh wal at {}", path.display());
            Header::LEN as u64
        } else {
            file.seek(SeekFrom::Start(0))?;
            Header::decode(&mut file)?;
            file.seek(SeekFrom::End(0))?;
            len
        };
        Ok(Self {
            inner: BufWriter::new(file),
            path: path.to_owned(),
            bytes_written,
        })
    }

    /// Append one record to the in-memory buffer.
    pub fn append(&mut self, record: &WalRecord) -> Result<(), Error> {
        let mut ser = Serializer::new();
        record.encode_payload(&mut ser);
        let payload = ser.into_bytes();
        let kind = record.kind();
        let len = (payload.len() + 1) as u32;

        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&[kind])?;
        self.inner.write_all(&payload)?;
        let checksum = record_checksum(kind, &payload);
        self.inner.write_all(&checksum.to_le_bytes())?;

        self.bytes_written += 4 + len as u64 + 8;
        Ok(())
    }

    /// Flush buffered records and fsync the file.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.inner.flush()?;
        self.inner.get_mut().fsync()?;
        Ok(())
    }

    /// Bytes in the log, header included. Drives the checkpoint threshold.
    pub fn size(&self) -> u64 {
        self.bytes_written
    }

    /// Cut the log back to `size` bytes. Used on open to drop a torn tail.
    pub fn truncate_to(&mut self, size: u64) -> Result<(), Error> {
        debug_assert!(size >= Header::LEN as u64);
        self.inner.flush()?;
        let file = self.inner.get_mut();
        file.ftruncate(size)?;
        file.seek(SeekFrom::Start(size))?;
        file.fsync()?;
        self.bytes_written = size;
        Ok(())
    }

    /// Drop every record, leaving only the header. Called after a checkpoint
    /// has made everything in the log redundant.
    pub fn reset(&mut self) -> Result<(), Error> {
        debug!("truncating wal {} after checkpoint", self.path.display());
        self.truncate_to(Header::LEN as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use quiver_types::{TableId, Value};

    use super::*;
    use crate::{Replay, TableType};

    fn records() -> Vec<WalRecord> {
        vec![
            WalRecord::TableInsertion {
                table_id: TableId(1),
                table_type: TableType::Node,
                rows: vec![vec![Value::Int64(7), Value::String("x".into())]],
            },
            WalRecord::Commit { commit_ts: 1 },
        ]
    }

    #[test]
    fn append_sync_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        for record in records() {
            wal.append(&record).unwrap();
        }
        wal.sync().unwrap();
        let size = wal.size();
        drop(wal);

        let mut replay = Replay::open(&path).unwrap();
        let replayed: Vec<_> = replay.by_ref().collect();
        assert_eq!(replayed, records());
        assert_eq!(replay.good_end(), size);
        assert!(replay.clean_eof());
    }

    #[test]
    fn reset_leaves_only_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        for record in records() {
            wal.append(&record).unwrap();
        }
        wal.sync().unwrap();
        wal.reset().unwrap();
        assert_eq!(wal.size(), Header::LEN as u64);
        drop(wal);

        let mut replay = Replay::open(&path).unwrap();
        assert_eq!(replay.by_ref().count(), 0);
        assert!(replay.clean_eof());
    }

    #[test]
    fn reopen_appends_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&WalRecord::Commit { commit_ts: 1 }).unwrap();
        wal.sync().unwrap();
        drop(wal);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&WalRecord::Commit { commit_ts: 2 }).unwrap();
        wal.sync().unwrap();
        drop(wal);

        let replayed: Vec<_> = Replay::open(&path).unwrap().collect();
        assert_eq!(
            replayed,
            vec![
                WalRecord::Commit { commit_ts: 1 },
                WalRecord::Commit { commit_ts: 2 }
            ]
        );
    }
}
