//! `database V2` store
//!
//! File layout: one `vrsn` record, then one `otrk` per track. Reading never
//! aborts on damaged content:
//! - a missing or unknown `vrsn` is flagged and the scan starts at offset 0
//! - a record whose length does not land on a record boundary is cut at the
//!   next `otrk` and decoded as far as it goes
//! - a salvaged track with no readable `pfil` is dropped and counted
//!
//! Top-level records other than `vrsn` and `otrk` are kept as opaque bytes and
//! written back where they were. Writes go to a temporary sibling file that is
//! renamed over the original.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use memmap2::Mmap;
use tracing::{debug, info};

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::prefix;
use crate::string;
use crate::tlv::{self, Tag, OTRK_TAG, VRSN_TAG};
use crate::track::{TrackRecord, PFIL};

pub const DATABASE_VERSION: &str = "2.0/Serato Scratch LIVE Database";

/// Number of stored paths used for prefix inference
pub const DEFAULT_SAMPLE_SIZE: usize = 500;

/// Raw `vrsn` value, kept byte-for-byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionHeader {
    raw: Vec<u8>,
}

impl Default for VersionHeader {
    fn default() -> Self {
        Self::new(DATABASE_VERSION)
    }
}

impl VersionHeader {
    pub fn new(text: &str) -> Self {
        Self {
            raw: string::encode_utf16be(text),
        }
    }

    pub fn from_raw(raw: &[u8]) -> Self {
        Self { raw: raw.to_vec() }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn text(&self) -> String {
        string::decode_utf16be(&self.raw).text
    }

    fn is_recognized(&self) -> bool {
        string::decode_strict(&self.raw)
            .map(|t| t.starts_with("2.0/"))
            .unwrap_or(false)
    }
}

/// Top-level record of an unmodelled kind, kept byte-for-byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueRecord {
    pub tag: Tag,
    pub value: Vec<u8>,
    /// Number of tracks before it in the file
    pub position: usize,
}

/// Fully decoded database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Database {
    pub version: VersionHeader,
    pub tracks: Vec<TrackRecord>,
    /// Ordered by `position`
    pub others: Vec<OpaqueRecord>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(buf: &[u8], diag: &mut Diagnostics) -> Self {
        let (version, start) = read_header(buf, diag);
        let mut tracks = Vec::new();
        let mut others = Vec::new();

        scan_records(buf, start, diag, |raw, diag| {
            if raw.tag == OTRK_TAG {
                if let Some(track) = decode_track(&raw, diag) {
                    tracks.push(track);
                }
            } else if raw.tag == VRSN_TAG && raw.offset == 0 {
                // Unrecognized header, already taken by read_header
            } else {
                debug!("Keeping {} record at offset {}", raw.tag, raw.offset);
                others.push(OpaqueRecord {
                    tag: raw.tag,
                    value: raw.value.to_vec(),
                    position: tracks.len(),
                });
            }
        });

        Database {
            version: version.unwrap_or_default(),
            tracks,
            others,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        tlv::encode_padded_into(&mut out, VRSN_TAG, self.version.raw());

        let mut others = self.others.iter().peekable();
        for (idx, track) in self.tracks.iter().enumerate() {
            while let Some(other) = others.next_if(|o| o.position <= idx) {
                tlv::encode_padded_into(&mut out, other.tag, &other.value);
            }
            tlv::encode_padded_into(&mut out, OTRK_TAG, &track.encode());
        }
        for other in others {
            tlv::encode_padded_into(&mut out, other.tag, &other.value);
        }
        out
    }

    /// Keep only the tracks `keep` accepts. Opaque records stay between the
    /// same surviving tracks.
    pub fn retain_tracks(&mut self, mut keep: impl FnMut(&TrackRecord) -> bool) {
        let mut kept_before = Vec::with_capacity(self.tracks.len() + 1);
        for track in std::mem::take(&mut self.tracks) {
            kept_before.push(self.tracks.len());
            if keep(&track) {
                self.tracks.push(track);
            }
        }
        kept_before.push(self.tracks.len());

        let last = kept_before.len() - 1;
        for other in &mut self.others {
            other.position = kept_before[other.position.min(last)];
        }
    }

    /// Readable `pfil` of every track, in file order
    pub fn paths(&self) -> impl Iterator<Item = String> + '_ {
        self.tracks.iter().filter_map(TrackRecord::path)
    }
}

/// Read and decode the whole database
pub fn read(path: &Path, diag: &mut Diagnostics) -> Result<Database> {
    let buf = fs::read(path)?;
    let db = Database::parse(&buf, diag);
    info!("Read {} track records from {:?}", db.tracks.len(), path);
    Ok(db)
}

/// Replace the database at `path` atomically.
///
/// Take a [`backup`] first; on failure the original file is left as it was.
pub fn write(path: &Path, db: &Database) -> Result<()> {
    write_atomic(path, &db.encode())?;
    info!("Wrote {} track records to {:?}", db.tracks.len(), path);
    Ok(())
}

/// Copy the database to a timestamped sibling and return its path
pub fn backup(path: &Path) -> Result<PathBuf> {
    let target = backup_path(path, Local::now())?;
    fs::copy(path, &target)?;
    info!("Backed up database to {:?}", target);
    Ok(target)
}

/// `<db>.bak-YYYYmmdd-HHMMSS`
pub fn backup_path(path: &Path, now: DateTime<Local>) -> Result<PathBuf> {
    let mut name = file_name(path)?;
    name.push(format!(".bak-{}", now.format("%Y%m%d-%H%M%S")));
    Ok(path.with_file_name(name))
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = file_name(path)?;
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = write_synced(&tmp, bytes).and_then(|_| fs::rename(&tmp, path).map_err(Error::from));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn file_name(path: &Path) -> Result<std::ffi::OsString> {
    path.file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| Error::Path(format!("No file name in {:?}", path)))
}

/// Stored paths of a database, without the rest of each record
#[derive(Debug, Clone, Default)]
pub struct PathIndex {
    /// `pfil` values with `/` separators, in file order
    pub raw_paths: Vec<String>,
    /// Leading raw paths used for inference
    pub sample: Vec<String>,
    pub prefix: Option<String>,
    /// Tracks with a readable path
    pub total: usize,
    /// Tracks dropped for lack of a readable path
    pub discarded: usize,
}

impl PathIndex {
    /// Index a database that is already in memory. Records without a readable
    /// path count as discarded; damage was reported when `db` was read.
    pub fn from_database(db: &Database, sample_size: usize) -> Self {
        let mut index = PathIndex::default();
        for track in &db.tracks {
            match track.path().filter(|p| !p.is_empty()) {
                Some(path) => index.push(prefix::normalize_separators(&path), sample_size),
                None => index.discarded += 1,
            }
        }
        index.finish()
    }

    fn push(&mut self, path: String, sample_size: usize) {
        if self.sample.len() < sample_size {
            self.sample.push(path.clone());
        }
        self.raw_paths.push(path);
    }

    fn finish(mut self) -> Self {
        self.total = self.raw_paths.len();
        self.prefix = prefix::infer_prefix(&self.sample, prefix::DEFAULT_DEPTH_CAP);
        self
    }

    /// Normalize every stored path against `prefix`
    pub fn normalized(&self, prefix: &str) -> HashSet<String> {
        self.raw_paths
            .iter()
            .map(|p| prefix::normalize_db_path(p, prefix))
            .collect()
    }
}

/// Read only the `pfil` of each track and infer the library prefix.
///
/// The file is memory-mapped, so only the pages the scan touches are read.
pub fn read_path_index(path: &Path, sample_size: usize, diag: &mut Diagnostics) -> Result<PathIndex> {
    let file = File::open(path)?;
    let index = if file.metadata()?.len() == 0 {
        index_paths(&[], sample_size, diag)
    } else {
        // SAFETY: read-only map, dropped before returning. The database must
        // not be written by another process during the scan.
        let map = unsafe { Mmap::map(&file)? };
        index_paths(&map, sample_size, diag)
    };
    info!(
        "Indexed {} paths from {:?} (prefix: {:?}, discarded: {})",
        index.total, path, index.prefix, index.discarded
    );
    Ok(index)
}

pub fn index_paths(buf: &[u8], sample_size: usize, diag: &mut Diagnostics) -> PathIndex {
    let (_, start) = read_header(buf, diag);
    let mut index = PathIndex::default();

    scan_records(buf, start, diag, |raw, diag| {
        if raw.tag != OTRK_TAG {
            return;
        }
        let Some(value) = raw_pfil(raw.value) else {
            index.discarded += 1;
            diag.discarded(raw.offset, "no pfil field");
            return;
        };

        let decoded = string::decode_utf16be(value);
        if !decoded.is_clean() {
            diag.recovered(PFIL, decoded.strategy);
        }
        if decoded.text.is_empty() {
            index.discarded += 1;
            diag.discarded(raw.offset, "unreadable pfil");
            return;
        }

        index.push(prefix::normalize_separators(&decoded.text), sample_size);
    });

    index.finish()
}

/// A top-level record found by the scanner
struct RawRecord<'a> {
    offset: usize,
    tag: Tag,
    value: &'a [u8],
    /// Framing was broken; the value is a best guess
    damaged: bool,
}

/// The `vrsn` record and the offset just past it
fn check_header(buf: &[u8]) -> Result<(VersionHeader, usize)> {
    let mut records = tlv::iter_top_level(buf);
    let record = records
        .next()
        .transpose()?
        .ok_or_else(|| Error::MalformedHeader("empty file".to_string()))?;
    if record.tag != VRSN_TAG {
        return Err(Error::MalformedHeader(format!("expected vrsn, found {}", record.tag)));
    }
    let header = VersionHeader::from_raw(record.value);
    if !header.is_recognized() {
        return Err(Error::MalformedHeader(format!("unrecognized version {:?}", header.text())));
    }
    Ok((header, records.position()))
}

/// Returns the header, if any, and the offset to start scanning for tracks.
/// An unrecognized `vrsn` is still returned so it can be written back.
fn read_header(buf: &[u8], diag: &mut Diagnostics) -> (Option<VersionHeader>, usize) {
    match check_header(buf) {
        Ok((header, start)) => (Some(header), start),
        Err(e) => {
            diag.malformed_header(&e);
            let header = tlv::decode_one(buf, 0)
                .ok()
                .flatten()
                .filter(|record| record.tag == VRSN_TAG)
                .map(|record| VersionHeader::from_raw(record.value));
            (header, 0)
        }
    }
}

/// Walk top-level records from `start`, handing each to `visit`.
/// Damaged records are only passed on when they are tracks.
fn scan_records<'a, F>(buf: &'a [u8], start: usize, diag: &mut Diagnostics, mut visit: F)
where
    F: FnMut(RawRecord<'a>, &mut Diagnostics),
{
    let mut records = tlv::iter_top_level(buf).starting_at(start);

    loop {
        let pos = records.position();
        let record = match records.next() {
            None => break,
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                debug!("Undecodable record at offset {}: {}", pos, e);
                let next = tlv::find_record(buf, pos + 1, OTRK_TAG);
                if buf[pos..].starts_with(&OTRK_TAG.bytes()) {
                    let value_start = (pos + tlv::HEADER_LEN).min(buf.len());
                    let end = next.unwrap_or(buf.len()).max(value_start);
                    visit(
                        RawRecord {
                            offset: pos,
                            tag: OTRK_TAG,
                            value: &buf[value_start..end],
                            damaged: true,
                        },
                        diag,
                    );
                }
                diag.resync(pos, next);
                match next {
                    Some(next) => {
                        records = tlv::iter_top_level(buf).starting_at(next);
                        continue;
                    }
                    None => break,
                }
            }
        };

        let next = records.position();
        if next >= buf.len() || tlv::has_plausible_tag(buf, next) {
            visit(
                RawRecord {
                    offset: record.offset,
                    tag: record.tag,
                    value: record.value,
                    damaged: false,
                },
                diag,
            );
            continue;
        }

        // The stored length does not end on a record boundary
        let bound = tlv::find_record(buf, record.value_offset(), OTRK_TAG);
        if record.tag == OTRK_TAG {
            let end = bound.unwrap_or(buf.len());
            visit(
                RawRecord {
                    offset: record.offset,
                    tag: OTRK_TAG,
                    value: &buf[record.value_offset()..end],
                    damaged: true,
                },
                diag,
            );
        }
        diag.resync(record.offset, bound);
        match bound {
            Some(bound) => records = tlv::iter_top_level(buf).starting_at(bound),
            None => break,
        }
    }
}

fn decode_track(raw: &RawRecord<'_>, diag: &mut Diagnostics) -> Option<TrackRecord> {
    let strict = if raw.damaged {
        None
    } else {
        TrackRecord::decode(raw.value)
            .map_err(|e| debug!("Track record at offset {} needs partial decode: {}", raw.offset, e))
            .ok()
    };
    let (record, salvaged) = match strict {
        Some(record) => (record, false),
        None => {
            let partial = TrackRecord::decode_partial(raw.value);
            for tag in &partial.duplicates {
                diag.warn(format!(
                    "Dropped repeated {} field in track record at offset {}",
                    tag, raw.offset
                ));
            }
            (partial.record, true)
        }
    };

    if let Some(decoded) = record.decode_text(PFIL) {
        if !decoded.is_clean() {
            diag.recovered(PFIL, decoded.strategy);
        }
    }

    if salvaged {
        if record.path().is_none() {
            diag.discarded(raw.offset, "no readable pfil");
            return None;
        }
        diag.warn(format!(
            "Salvaged {} fields of damaged track record at offset {}",
            record.len(),
            raw.offset
        ));
    }
    Some(record)
}

/// Raw bytes of the `pfil` field, reading fields until the first error
fn raw_pfil(value: &[u8]) -> Option<&[u8]> {
    tlv::iter_nested(value)
        .map_while(|field| field.ok())
        .find(|field| field.tag == PFIL)
        .map(|field| field.value)
}
