use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("wal file does not start with magic")]
    BadMagic,
    #[error("unsupported wal format version: {0}")]
    UnsupportedVersion(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}
