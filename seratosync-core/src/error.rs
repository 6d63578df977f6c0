//! Error types for seratosync-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Truncated record at offset {offset}: needed {needed} bytes, {available} available")]
    TruncatedRecord {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Unicode recovery failed: {0}")]
    UnicodeRecovery(String),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Binary format error: {0}")]
    BinRw(String),

    #[error("Path error: {0}")]
    Path(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::BinRw(e.to_string())
    }
}
