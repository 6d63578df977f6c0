//! Per-run diagnostics sink
//!
//! Components that recover from damaged input take a `&mut Diagnostics` and
//! report what they skipped or repaired. Each entry is also logged through
//! `tracing` so the CLI shows it as it happens.

use serde::Serialize;
use tracing::warn;

use crate::error::Error;
use crate::string::DecodeStrategy;
use crate::tlv::Tag;

#[derive(Debug, Default, Clone, Serialize)]
pub struct Diagnostics {
    pub warnings: Vec<String>,
    /// Track records dropped because no usable `pfil` survived
    pub discarded_records: usize,
    /// Text fields that needed more than a strict decode
    pub recovered_fields: usize,
    /// Times a scan searched forward for the next record boundary
    pub resyncs: usize,
    /// The file did not start with a `vrsn` record
    pub malformed_header: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!("{}", msg);
        self.warnings.push(msg);
    }

    pub fn malformed_header(&mut self, err: &Error) {
        self.malformed_header = true;
        self.warn(format!("{}; scanning from start", err));
    }

    pub fn discarded(&mut self, offset: usize, reason: &str) {
        self.discarded_records += 1;
        self.warn(format!("Discarded track record at offset {}: {}", offset, reason));
    }

    pub fn recovered(&mut self, tag: Tag, strategy: Option<DecodeStrategy>) {
        self.recovered_fields += 1;
        match strategy {
            Some(s) => self.warn(format!("Recovered {} field with {:?} decoding", tag, s)),
            None => self.warn(format!("Unreadable {} field replaced with empty text", tag)),
        }
    }

    pub fn resync(&mut self, from: usize, to: Option<usize>) {
        self.resyncs += 1;
        match to {
            Some(to) => self.warn(format!("Resynchronized scan from offset {} to {}", from, to)),
            None => self.warn(format!("No further records after offset {}", from)),
        }
    }

    /// Nothing was skipped or repaired
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
