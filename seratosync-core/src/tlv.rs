//! TLV (tag/length/value) record codec
//!
//! `database V2` and `.crate` files are both a **big-endian** stream of records:
//! - 4-byte ASCII tag
//! - u32 value length
//! - `length` bytes of value
//!
//! Top-level records are followed by 0-3 zero bytes up to the next 4-byte
//! boundary. Nested records (the fields inside an `otrk` value) are packed
//! back to back with no padding.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use binrw::{binrw, BinRead};

use crate::error::{Error, Result};

/// Size of a record header: tag + length
pub const HEADER_LEN: usize = 8;

/// Version header, always the first record of a file
pub const VRSN_TAG: Tag = Tag(*b"vrsn");
/// Track entry, used by both the database and crate files
pub const OTRK_TAG: Tag = Tag(*b"otrk");

/// Four-character record tag
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag([u8; 4]);

impl Tag {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// First character of the tag. The application uses it as a type hint
    /// (`t` text, `p` path, `u` integer, `b` flag).
    pub fn kind_char(&self) -> char {
        self.0[0] as char
    }

    /// Whether the bytes look like a real tag rather than misaligned data.
    pub fn is_plausible(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_alphanumeric())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

impl FromStr for Tag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| Error::InvalidTag(format!("{:?} is not 4 bytes", s)))?;
        if !bytes.iter().all(|b| b.is_ascii()) {
            return Err(Error::InvalidTag(format!("{:?} is not ASCII", s)));
        }
        Ok(Tag(bytes))
    }
}

/// On-disk record header
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    tag: [u8; 4],
    length: u32,
}

/// One decoded record, borrowing its value from the source buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub tag: Tag,
    pub value: &'a [u8],
    /// Offset of the record header within the source buffer
    pub offset: usize,
}

impl<'a> Record<'a> {
    pub fn value_offset(&self) -> usize {
        self.offset + HEADER_LEN
    }

    /// Offset just past the value (before any padding)
    pub fn end(&self) -> usize {
        self.value_offset() + self.value.len()
    }
}

/// Number of zero bytes that follow a top-level value of `len` bytes
pub fn pad_len(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Encode a single unpadded record
pub fn encode(tag: Tag, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + value.len());
    encode_into(&mut out, tag, value);
    out
}

/// Append an unpadded record (nested form)
pub fn encode_into(out: &mut Vec<u8>, tag: Tag, value: &[u8]) {
    out.extend_from_slice(&tag.0);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

/// Append a top-level record followed by its alignment padding
pub fn encode_padded_into(out: &mut Vec<u8>, tag: Tag, value: &[u8]) {
    encode_into(out, tag, value);
    out.resize(out.len() + pad_len(value.len()), 0);
}

/// Decode the record starting at `offset`.
///
/// Returns `Ok(None)` at the end of the buffer. A header or value that runs
/// past the end fails with [`Error::TruncatedRecord`]; lengths are never clamped.
pub fn decode_one(buf: &[u8], offset: usize) -> Result<Option<Record<'_>>> {
    if offset >= buf.len() {
        return Ok(None);
    }

    let available = buf.len() - offset;
    if available < HEADER_LEN {
        return Err(Error::TruncatedRecord {
            offset,
            needed: HEADER_LEN,
            available,
        });
    }

    let header = RecordHeader::read(&mut Cursor::new(&buf[offset..offset + HEADER_LEN]))?;
    let length = header.length as usize;
    let value_start = offset + HEADER_LEN;

    if length > buf.len() - value_start {
        return Err(Error::TruncatedRecord {
            offset,
            needed: HEADER_LEN + length,
            available,
        });
    }

    Ok(Some(Record {
        tag: Tag(header.tag),
        value: &buf[value_start..value_start + length],
        offset,
    }))
}

/// Whether a well-formed header that fits in the buffer starts at `pos`
pub fn is_plausible_header(buf: &[u8], pos: usize) -> bool {
    if pos + HEADER_LEN > buf.len() {
        return false;
    }
    let tag = Tag([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
    let length = u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]) as usize;
    tag.is_plausible() && length <= buf.len() - pos - HEADER_LEN
}

/// Whether four tag-like bytes start at `pos`, whatever the length field says
pub fn has_plausible_tag(buf: &[u8], pos: usize) -> bool {
    buf.get(pos..pos + 4)
        .map(|b| b.iter().all(u8::is_ascii_alphanumeric))
        .unwrap_or(false)
}

/// Search forward from `from` for the next plausible record with `tag`.
pub fn find_record(buf: &[u8], from: usize, tag: Tag) -> Option<usize> {
    let mut pos = from;
    while pos + HEADER_LEN <= buf.len() {
        let hit = buf[pos..].windows(4).position(|w| w == tag.0)?;
        let candidate = pos + hit;
        if is_plausible_header(buf, candidate) {
            return Some(candidate);
        }
        pos = candidate + 1;
    }
    None
}

/// Skip the zero padding that may follow a top-level record
fn skip_padding(buf: &[u8], end: usize, value_len: usize) -> usize {
    let limit = (end + pad_len(value_len)).min(buf.len());
    let mut pos = end;
    while pos < limit && buf[pos] == 0 {
        pos += 1;
    }
    pos
}

/// Iterate the top-level records of a file, skipping alignment padding
pub fn iter_top_level(buf: &[u8]) -> Records<'_> {
    Records {
        buf,
        pos: 0,
        padded: true,
        done: false,
    }
}

/// Iterate records packed inside a parent value (no padding)
pub fn iter_nested(buf: &[u8]) -> Records<'_> {
    Records {
        buf,
        pos: 0,
        padded: false,
        done: false,
    }
}

/// Lazy record iterator.
///
/// Yields one `Err` on the first undecodable record and then stops; callers
/// that want to resynchronize use [`find_record`] and [`Records::starting_at`].
#[derive(Debug, Clone)]
pub struct Records<'a> {
    buf: &'a [u8],
    pos: usize,
    padded: bool,
    done: bool,
}

impl<'a> Records<'a> {
    pub fn starting_at(mut self, pos: usize) -> Self {
        self.pos = pos;
        self
    }

    /// Offset of the next record to be decoded
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Offset after `record` including padding when iterating top-level
    pub fn next_offset(&self, record: &Record<'_>) -> usize {
        if self.padded {
            skip_padding(self.buf, record.end(), record.value.len())
        } else {
            record.end()
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match decode_one(self.buf, self.pos) {
            Ok(Some(record)) => {
                self.pos = self.next_offset(&record);
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSNG: Tag = Tag(*b"tsng");

    #[test]
    fn test_encode_layout() {
        let bytes = encode(TSNG, &[0x00, 0x41]);
        assert_eq!(&bytes[0..4], b"tsng");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..], &[0x00, 0x41]);
    }

    #[test]
    fn test_padded_encoding() {
        let mut out = Vec::new();
        encode_padded_into(&mut out, OTRK_TAG, &[1, 2, 3, 4, 5]);
        assert_eq!(out.len(), HEADER_LEN + 5 + 3);
        assert_eq!(&out[13..], &[0, 0, 0]);

        let mut aligned = Vec::new();
        encode_padded_into(&mut aligned, OTRK_TAG, &[1, 2, 3, 4]);
        assert_eq!(aligned.len(), HEADER_LEN + 4);
    }

    #[test]
    fn test_decode_one() {
        let mut buf = encode(TSNG, b"ab");
        buf.extend(encode(VRSN_TAG, b"xyz"));

        let first = decode_one(&buf, 0).unwrap().unwrap();
        assert_eq!(first.tag, TSNG);
        assert_eq!(first.value, b"ab");
        assert_eq!(first.end(), 10);

        let second = decode_one(&buf, first.end()).unwrap().unwrap();
        assert_eq!(second.tag, VRSN_TAG);
        assert_eq!(second.value, b"xyz");

        assert!(decode_one(&buf, second.end()).unwrap().is_none());
    }

    #[test]
    fn test_truncated_header() {
        let buf = b"tsng\x00\x00";
        match decode_one(buf, 0) {
            Err(Error::TruncatedRecord { needed, available, .. }) => {
                assert_eq!(needed, HEADER_LEN);
                assert_eq!(available, 6);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = encode(TSNG, b"abcd");
        buf.truncate(10);
        assert!(matches!(
            decode_one(&buf, 0),
            Err(Error::TruncatedRecord { offset: 0, .. })
        ));
    }

    #[test]
    fn test_top_level_skips_padding() {
        let mut buf = Vec::new();
        encode_padded_into(&mut buf, VRSN_TAG, b"abcdef");
        encode_padded_into(&mut buf, OTRK_TAG, b"g");
        encode_padded_into(&mut buf, OTRK_TAG, b"hijk");

        let records: Vec<_> = iter_top_level(&buf).collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].value, b"g");
        assert_eq!(records[2].value, b"hijk");
    }

    #[test]
    fn test_top_level_accepts_unpadded_stream() {
        let mut buf = encode(VRSN_TAG, b"abcdef");
        buf.extend(encode(OTRK_TAG, b"g"));

        let tags: Vec<Tag> = iter_top_level(&buf).map(|r| r.unwrap().tag).collect();
        assert_eq!(tags, vec![VRSN_TAG, OTRK_TAG]);
    }

    #[test]
    fn test_nested_does_not_skip_zero_bytes() {
        let mut buf = encode(TSNG, b"a");
        buf.push(0);
        let mut iter = iter_nested(&buf);
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_iteration_is_restartable() {
        let mut buf = encode(TSNG, b"a");
        buf.extend(encode(TSNG, b"b"));
        let first: Vec<_> = iter_nested(&buf).map(|r| r.unwrap().value).collect();
        let second: Vec<_> = iter_nested(&buf).map(|r| r.unwrap().value).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_find_record_skips_implausible_hits() {
        let mut buf = b"otrk\xff\xff\xff\xff".to_vec();
        let real = buf.len();
        buf.extend(encode(OTRK_TAG, b"ok"));
        assert_eq!(find_record(&buf, 0, OTRK_TAG), Some(real));
        assert_eq!(find_record(&buf, real + 1, OTRK_TAG), None);
    }

    #[test]
    fn test_tag_parse() {
        assert_eq!("pfil".parse::<Tag>().unwrap(), Tag(*b"pfil"));
        assert!("pfi".parse::<Tag>().is_err());
        assert_eq!(Tag(*b"bply").kind_char(), 'b');
        assert!(!Tag([0, 0, 0, 1]).is_plausible());
    }

    #[test]
    fn test_plausible_tag_ignores_length() {
        let mut buf = encode(OTRK_TAG, b"abcd");
        buf.truncate(10);
        assert!(!is_plausible_header(&buf, 0));
        assert!(has_plausible_tag(&buf, 0));
        assert!(!has_plausible_tag(&buf, 4));
        assert!(!has_plausible_tag(&buf, 8));
    }
}
