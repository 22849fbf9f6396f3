//! The Quiver write-ahead log.
//!
//! The log is a single append-only file: a fixed header, then a stream of
//! checksummed records. Every record is framed as
//! `[length(u32) | kind(u8) | payload | xxhash64(u64)]` where the checksum
//! covers `kind || payload`. A transaction's records are appended while it
//! runs and become durable when [`Wal::sync`] is called after the
//! [`WalRecord::Commit`] marker — recovery replays records strictly in file
//! order and stops at the last commit marker it can verify.

use std::io;

mod record;
mod replay;
mod writer;

pub use crate::{
    record::{TableType, WalRecord},
    replay::Replay,
    writer::Wal,
};
pub mod error;

pub use error::Error;

pub const MAGIC: [u8; 6] = *b"qvrwal";

pub const WAL_FORMAT_VERSION: u8 = 1;

/// File header: magic, format version, two reserved bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub version: u8,
}

impl Header {
    pub const LEN: usize = MAGIC.len() + /* version + reserved + reserved */ 3;

    pub fn write<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        out.write_all(&MAGIC)?;
        out.write_all(&[self.version, 0, 0])?;
        Ok(())
    }

    pub fn decode<R: io::Read>(mut read: R) -> Result<Self, Error> {
        let mut buf = [0; Self::LEN];
        read.read_exact(&mut buf)?;
        if !buf.starts_with(&MAGIC) {
            return Err(Error::BadMagic);
        }
        let version = buf[MAGIC.len()];
        if version > WAL_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(Self { version })
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            version: WAL_FORMAT_VERSION,
        }
    }
}

/// Checksum of a record frame: xxhash64 over `kind || payload`.
pub(crate) fn record_checksum(kind: u8, payload: &[u8]) -> u64 {
    use std::hash::Hasher as _;
    let mut hasher = twox_hash::XxHash64::with_seed(0);
    hasher.write(&[kind]);
    hasher.write(payload);
    hasher.finish()
}
