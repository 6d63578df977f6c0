//! Track record schema
//!
//! An `otrk` value is a packed sequence of field records. Each field is
//! classified by its tag's first character:
//! - `t`/`p`: UTF-16BE text (`pfil` holds the file path)
//! - `u`: 4-byte big-endian integer
//! - `b`: single-byte flag
//!
//! Anything else, and any value whose bytes would not re-encode identically
//! under its nominal kind, is kept as an opaque blob. Field order is preserved
//! so an unmodified record writes back byte-for-byte.

use crate::error::{Error, Result};
use crate::string::{self, Decoded};
use crate::tlv::{self, Tag};

pub const PFIL: Tag = Tag::new(*b"pfil");
pub const TTYP: Tag = Tag::new(*b"ttyp");
pub const TSNG: Tag = Tag::new(*b"tsng");
pub const TART: Tag = Tag::new(*b"tart");
pub const TALB: Tag = Tag::new(*b"talb");
pub const TADD: Tag = Tag::new(*b"tadd");
pub const UADD: Tag = Tag::new(*b"uadd");
pub const UTME: Tag = Tag::new(*b"utme");
pub const UTPC: Tag = Tag::new(*b"utpc");
pub const UFSB: Tag = Tag::new(*b"ufsb");

/// Flags a freshly added track carries, all cleared
const NEW_TRACK_FLAGS: [Tag; 13] = [
    Tag::new(*b"bhrt"),
    Tag::new(*b"bmis"),
    Tag::new(*b"bply"),
    Tag::new(*b"blop"),
    Tag::new(*b"bitu"),
    Tag::new(*b"bovc"),
    Tag::new(*b"bcrt"),
    Tag::new(*b"biro"),
    Tag::new(*b"bwlb"),
    Tag::new(*b"bwll"),
    Tag::new(*b"buns"),
    Tag::new(*b"bbgl"),
    Tag::new(*b"bkrk"),
];

/// Typed field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Integer(u32),
    Flag(bool),
    /// Uninterpreted bytes (analysis data, padded text, unknown tags)
    Blob(Vec<u8>),
}

impl FieldValue {
    /// Classify raw bytes for `tag`. Only representations that re-encode to
    /// exactly `raw` are chosen; everything else stays a blob.
    pub fn from_raw(tag: Tag, raw: &[u8]) -> Self {
        match tag.kind_char() {
            't' | 'p' => match string::decode_strict(raw) {
                Ok(text) if string::encode_utf16be(&text) == raw => FieldValue::Text(text),
                _ => FieldValue::Blob(raw.to_vec()),
            },
            'u' if raw.len() == 4 => {
                FieldValue::Integer(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            'b' if raw.len() == 1 && raw[0] <= 1 => FieldValue::Flag(raw[0] == 1),
            _ => FieldValue::Blob(raw.to_vec()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            FieldValue::Text(s) => string::encode_utf16be(s),
            FieldValue::Integer(n) => n.to_be_bytes().to_vec(),
            FieldValue::Flag(b) => vec![u8::from(*b)],
            FieldValue::Blob(bytes) => bytes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub tag: Tag,
    pub value: FieldValue,
}

/// One track entry: ordered fields with unique tags
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackRecord {
    fields: Vec<Field>,
}

/// Result of decoding a possibly damaged `otrk` value
#[derive(Debug, Clone)]
pub struct PartialTrack {
    pub record: TrackRecord,
    /// Offset within the value where decoding stopped, if it did not finish
    pub failed_at: Option<usize>,
    /// Repeated tags that were skipped, in the order met
    pub duplicates: Vec<Tag>,
}

impl TrackRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimal record for a newly discovered file. The application fills in
    /// metadata and analysis on its own pass.
    pub fn minimal(path: &str, added_unix: u32) -> Self {
        let mut record = Self::new();
        record.set(TTYP, FieldValue::Text(file_type(path)));
        record.set(PFIL, FieldValue::Text(path.to_string()));
        record.set(TADD, FieldValue::Text(added_unix.to_string()));
        record.set(UADD, FieldValue::Integer(added_unix));
        record.set(UTME, FieldValue::Integer(added_unix));
        record.set(UTPC, FieldValue::Integer(0));
        record.set(UFSB, FieldValue::Integer(0));
        for tag in NEW_TRACK_FLAGS {
            record.set(tag, FieldValue::Flag(false));
        }
        record
    }

    /// Strict decode: fails on truncation or a repeated tag.
    pub fn decode(value: &[u8]) -> Result<Self> {
        let mut record = Self::new();
        for field in tlv::iter_nested(value) {
            let field = field?;
            if record.get(field.tag).is_some() {
                return Err(Error::InvalidTag(format!("duplicate field {}", field.tag)));
            }
            record.fields.push(Field {
                tag: field.tag,
                value: FieldValue::from_raw(field.tag, field.value),
            });
        }
        Ok(record)
    }

    /// Keep every field decoded before the first error
    pub fn decode_partial(value: &[u8]) -> PartialTrack {
        let mut record = Self::new();
        let mut duplicates = Vec::new();
        let mut fields = tlv::iter_nested(value);

        loop {
            let start = fields.position();
            match fields.next() {
                None => break,
                Some(Ok(field)) => {
                    if record.get(field.tag).is_some() {
                        duplicates.push(field.tag);
                        continue;
                    }
                    record.fields.push(Field {
                        tag: field.tag,
                        value: FieldValue::from_raw(field.tag, field.value),
                    });
                }
                Some(Err(_)) => {
                    return PartialTrack {
                        record,
                        failed_at: Some(start),
                        duplicates,
                    };
                }
            }
        }

        PartialTrack {
            record,
            failed_at: None,
            duplicates,
        }
    }

    /// Packed field records, the value of an `otrk`
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            tlv::encode_into(&mut out, field.tag, &field.value.to_bytes());
        }
        out
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, tag: Tag) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.tag == tag).map(|f| &f.value)
    }

    /// Replace the value in place, or append a new field at the end
    pub fn set(&mut self, tag: Tag, value: FieldValue) {
        let value = FieldValue::from_raw(tag, &value.to_bytes());
        match self.fields.iter_mut().find(|f| f.tag == tag) {
            Some(field) => field.value = value,
            None => self.fields.push(Field { tag, value }),
        }
    }

    pub fn remove(&mut self, tag: Tag) -> Option<FieldValue> {
        let idx = self.fields.iter().position(|f| f.tag == tag)?;
        Some(self.fields.remove(idx).value)
    }

    /// Text of a field, running the recovery ladder for damaged values
    pub fn decode_text(&self, tag: Tag) -> Option<Decoded> {
        match self.get(tag)? {
            FieldValue::Text(s) => Some(Decoded {
                text: s.clone(),
                strategy: Some(string::DecodeStrategy::Strict),
            }),
            FieldValue::Blob(raw) if matches!(tag.kind_char(), 't' | 'p') => {
                Some(string::decode_utf16be(raw))
            }
            _ => None,
        }
    }

    pub fn text(&self, tag: Tag) -> Option<String> {
        self.decode_text(tag).map(|d| d.text)
    }

    /// Stored file path, if one is readable
    pub fn path(&self) -> Option<String> {
        self.text(PFIL).filter(|p| !p.is_empty())
    }

    pub fn set_path(&mut self, path: &str) {
        self.set(PFIL, FieldValue::Text(path.to_string()));
    }
}

/// `ttyp` value for a path: lowercase extension, `mp3` if none
fn file_type(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
        _ => "mp3".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TrackRecord {
        let mut record = TrackRecord::new();
        record.set(TTYP, FieldValue::Text("mp3".into()));
        record.set(PFIL, FieldValue::Text("Music/Rock/a.mp3".into()));
        record.set(Tag::new(*b"tbpm"), FieldValue::Text("128.00".into()));
        record.set(UADD, FieldValue::Integer(1_700_000_000));
        record.set(Tag::new(*b"bply"), FieldValue::Flag(true));
        record.set(Tag::new(*b"sbav"), FieldValue::Blob(vec![0x01, 0x02]));
        record
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        let record = sample_record();
        let decoded = TrackRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);

        let tags: Vec<Tag> = decoded.fields().map(|f| f.tag).collect();
        assert_eq!(tags[0], TTYP);
        assert_eq!(tags[1], PFIL);
        assert_eq!(tags[5], Tag::new(*b"sbav"));
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            FieldValue::from_raw(UTPC, &[0, 0, 0, 7]),
            FieldValue::Integer(7)
        );
        assert_eq!(FieldValue::from_raw(Tag::new(*b"bmis"), &[1]), FieldValue::Flag(true));
        // Flag byte outside 0/1 is kept verbatim
        assert_eq!(
            FieldValue::from_raw(Tag::new(*b"bmis"), &[2]),
            FieldValue::Blob(vec![2])
        );
        // Short integer is not an integer
        assert_eq!(FieldValue::from_raw(UTPC, &[0, 7]), FieldValue::Blob(vec![0, 7]));
    }

    #[test]
    fn test_padded_text_is_preserved_and_readable() {
        let mut raw = string::encode_utf16be("0.0MB");
        raw.extend_from_slice(&[0, 0, 0, 0]);
        let tsiz = Tag::new(*b"tsiz");

        let mut record = TrackRecord::new();
        record.set(tsiz, FieldValue::Blob(raw.clone()));
        assert_eq!(record.get(tsiz), Some(&FieldValue::Blob(raw.clone())));
        assert_eq!(record.text(tsiz).as_deref(), Some("0.0MB"));

        let decoded = TrackRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.encode(), record.encode());
    }

    #[test]
    fn test_unknown_tags_survive() {
        let mut value = Vec::new();
        tlv::encode_into(&mut value, PFIL, &string::encode_utf16be("a.mp3"));
        tlv::encode_into(&mut value, Tag::new(*b"zzzz"), &[9, 9, 9]);
        tlv::encode_into(&mut value, Tag::new(*b"ovrv"), &[0xAA; 32]);

        let record = TrackRecord::decode(&value).unwrap();
        assert_eq!(record.len(), 3);
        assert_eq!(record.encode(), value);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut record = sample_record();
        record.set_path("Music/Rock/b.mp3");
        assert_eq!(record.path().as_deref(), Some("Music/Rock/b.mp3"));
        assert_eq!(record.fields().nth(1).map(|f| f.tag), Some(PFIL));
        assert_eq!(record.len(), 6);
    }

    #[test]
    fn test_strict_decode_rejects_duplicates() {
        let mut value = Vec::new();
        tlv::encode_into(&mut value, PFIL, &string::encode_utf16be("a.mp3"));
        tlv::encode_into(&mut value, PFIL, &string::encode_utf16be("b.mp3"));
        assert!(TrackRecord::decode(&value).is_err());

        let partial = TrackRecord::decode_partial(&value);
        assert_eq!(partial.duplicates, vec![PFIL]);
        assert_eq!(partial.record.path().as_deref(), Some("a.mp3"));
    }

    #[test]
    fn test_partial_decode_keeps_leading_fields() {
        let mut value = Vec::new();
        tlv::encode_into(&mut value, TTYP, &string::encode_utf16be("mp3"));
        let cut_at = value.len();
        tlv::encode_into(&mut value, PFIL, &string::encode_utf16be("Music/a.mp3"));
        value.truncate(value.len() - 6);

        assert!(TrackRecord::decode(&value).is_err());
        let partial = TrackRecord::decode_partial(&value);
        assert_eq!(partial.failed_at, Some(cut_at));
        assert_eq!(partial.record.len(), 1);
        assert!(partial.record.path().is_none());
    }

    #[test]
    fn test_minimal_record() {
        let record = TrackRecord::minimal("Music/Rock/New Song.FLAC", 1_700_000_000);
        assert_eq!(record.text(TTYP).as_deref(), Some("flac"));
        assert_eq!(record.path().as_deref(), Some("Music/Rock/New Song.FLAC"));
        assert_eq!(record.text(TADD).as_deref(), Some("1700000000"));
        assert_eq!(record.get(UADD), Some(&FieldValue::Integer(1_700_000_000)));
        assert_eq!(record.get(Tag::new(*b"bmis")), Some(&FieldValue::Flag(false)));

        let decoded = TrackRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_file_type() {
        assert_eq!(file_type("a/b.M4A"), "m4a");
        assert_eq!(file_type("a.b/noext"), "mp3");
        assert_eq!(file_type(".hidden"), "mp3");
    }
}
