//! `.crate` files
//!
//! A crate is a `vrsn` record followed by one `otrk` per track, each holding a
//! single `ptrk` with the track path. Crates live under `Subcrates/` and are
//! named after the folder they mirror, with `%%` between path segments.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::string;
use crate::tlv::{self, Tag, OTRK_TAG, VRSN_TAG};

pub const CRATE_VERSION: &str = "1.0/Serato ScratchLive Crate";

/// Track path inside a crate entry
pub const PTRK_TAG: Tag = Tag::new(*b"ptrk");

/// Separator between folder segments in a crate file name
pub const CRATE_NAME_SEPARATOR: &str = "%%";

/// `<serato_root>/Subcrates/<seg1>%%<seg2>.crate`
pub fn crate_path<'s>(serato_root: &Path, segments: impl IntoIterator<Item = &'s str>) -> PathBuf {
    let name = segments.into_iter().collect::<Vec<_>>().join(CRATE_NAME_SEPARATOR);
    serato_root.join("Subcrates").join(format!("{}.crate", name))
}

/// Serialized crate for `paths`. Same input, same bytes.
pub fn build_payload(paths: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    tlv::encode_padded_into(&mut out, VRSN_TAG, &string::encode_utf16be(CRATE_VERSION));
    for path in paths {
        let entry = tlv::encode(PTRK_TAG, &string::encode_utf16be(path));
        tlv::encode_padded_into(&mut out, OTRK_TAG, &entry);
    }
    out
}

/// Track paths stored in a crate payload, in order.
///
/// Reading stops at the first undecodable record.
pub fn parse(buf: &[u8]) -> Vec<String> {
    let mut paths = Vec::new();
    for record in tlv::iter_top_level(buf) {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                debug!("Stopping crate read: {}", e);
                break;
            }
        };
        if record.tag != OTRK_TAG {
            continue;
        }
        let ptrk = tlv::iter_nested(record.value)
            .map_while(|field| field.ok())
            .find(|field| field.tag == PTRK_TAG);
        if let Some(field) = ptrk {
            let decoded = string::decode_utf16be(field.value);
            if !decoded.text.is_empty() {
                paths.push(decoded.text);
            }
        }
    }
    paths
}

/// Read a crate. A missing file is an empty crate.
pub fn read(crate_path: &Path) -> Result<Vec<String>> {
    match fs::read(crate_path) {
        Ok(buf) => Ok(parse(&buf)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write a crate, creating `Subcrates/` as needed
pub fn write(crate_path: &Path, paths: &[String]) -> Result<()> {
    write_payload(crate_path, &build_payload(paths))
}

pub(crate) fn write_payload(crate_path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = crate_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(crate_path, payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_crate_path() {
        let root = Path::new("/serato");
        assert_eq!(
            crate_path(root, ["Rock", "90s"]),
            PathBuf::from("/serato/Subcrates/Rock%%90s.crate")
        );
        assert_eq!(crate_path(root, ["Jazz"]), PathBuf::from("/serato/Subcrates/Jazz.crate"));
    }

    #[test]
    fn test_payload_layout() {
        let payload = build_payload(&paths(&["a.mp3"]));

        let records: Vec<_> = tlv::iter_top_level(&payload)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tag, VRSN_TAG);
        assert_eq!(string::decode_strict(records[0].value).unwrap(), CRATE_VERSION);
        assert_eq!(records[1].tag, OTRK_TAG);

        let inner = tlv::decode_one(records[1].value, 0).unwrap().unwrap();
        assert_eq!(inner.tag, PTRK_TAG);
        assert_eq!(inner.value, string::encode_utf16be("a.mp3").as_slice());
    }

    #[test]
    fn test_payload_is_deterministic() {
        let list = paths(&["Music/Rock/a.mp3", "Music/Rock/b.mp3"]);
        assert_eq!(build_payload(&list), build_payload(&list));
        assert_ne!(build_payload(&list), build_payload(&paths(&["Music/Rock/a.mp3"])));
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let path = crate_path(tmp.path(), ["Rock", "90s"]);
        let list = paths(&["Music/Rock/90s/a.mp3", "Music/Rock/90s/Ünïcode.flac"]);

        write(&path, &list).unwrap();
        assert!(tmp.path().join("Subcrates").is_dir());
        assert_eq!(read(&path).unwrap(), list);
        assert_eq!(fs::read(&path).unwrap(), build_payload(&list));
    }

    #[test]
    fn test_missing_crate_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(read(&tmp.path().join("none.crate")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_stops_at_truncation() {
        let mut payload = build_payload(&paths(&["a.mp3", "b.mp3"]));
        payload.truncate(payload.len() - 3);
        assert_eq!(parse(&payload), vec!["a.mp3"]);
    }
}
