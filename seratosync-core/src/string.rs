//! UTF-16BE text fields
//!
//! Every text value in Serato files is UTF-16BE without a BOM. Trailing NUL
//! code units are tolerated on read and never written.
//!
//! Damaged text is recovered with an ordered ladder of decode strategies:
//! 1. `Strict`: exact UTF-16BE
//! 2. `Lossy`: replacement decoding with U+FFFD stripped
//! 3. `Pairwise`: salvage `00 xx` ASCII pairs, skipping bytes that break alignment
//!
//! If every strategy fails the field decodes to an empty string.

use crate::error::{Error, Result};

/// Encode a string as UTF-16BE
pub fn encode_utf16be(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// One step of the recovery ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    Strict,
    Lossy,
    Pairwise,
}

/// Strategies in the order they are tried
pub const RECOVERY_LADDER: [DecodeStrategy; 3] = [
    DecodeStrategy::Strict,
    DecodeStrategy::Lossy,
    DecodeStrategy::Pairwise,
];

impl DecodeStrategy {
    /// Attempt to decode `bytes`; `None` hands over to the next strategy.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            DecodeStrategy::Strict => strict(bytes),
            DecodeStrategy::Lossy => lossy(bytes),
            DecodeStrategy::Pairwise => pairwise(bytes),
        }
    }
}

/// Result of running the ladder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// Strategy that produced `text`; `None` means every step failed
    pub strategy: Option<DecodeStrategy>,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.strategy == Some(DecodeStrategy::Strict)
    }
}

/// Decode with the full recovery ladder. Never fails.
pub fn decode_utf16be(bytes: &[u8]) -> Decoded {
    for strategy in RECOVERY_LADDER {
        if let Some(text) = strategy.decode(bytes) {
            return Decoded {
                text,
                strategy: Some(strategy),
            };
        }
    }
    Decoded {
        text: String::new(),
        strategy: None,
    }
}

/// Decode exactly, failing on any malformed input
pub fn decode_strict(bytes: &[u8]) -> Result<String> {
    strict(bytes).ok_or_else(|| {
        Error::UnicodeRecovery(format!("{} bytes are not valid UTF-16BE", bytes.len()))
    })
}

fn units(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
}

fn trim_nul(mut s: String) -> String {
    while s.ends_with('\0') {
        s.pop();
    }
    s
}

fn strict(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    String::from_utf16(&units(bytes).collect::<Vec<_>>())
        .ok()
        .map(trim_nul)
}

fn lossy(bytes: &[u8]) -> Option<String> {
    let total = bytes.len() / 2;
    let mut replaced = 0;
    let mut out = String::with_capacity(total);

    for ch in char::decode_utf16(units(bytes)) {
        match ch {
            Ok('\0') => {}
            Ok(c) => out.push(c),
            Err(_) => replaced += 1,
        }
    }

    // Mostly garbage: leave it to the pairwise pass
    if out.is_empty() || replaced * 2 > total {
        return None;
    }
    Some(out)
}

fn pairwise(bytes: &[u8]) -> Option<String> {
    let mut out = String::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let (hi, lo) = (bytes[i], bytes[i + 1]);
        if hi == 0 && (0x20..0x7f).contains(&lo) {
            out.push(lo as char);
            i += 2;
        } else {
            i += 1;
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ascii() {
        assert_eq!(encode_utf16be("Ab"), vec![0x00, 0x41, 0x00, 0x62]);
        assert!(encode_utf16be("").is_empty());
    }

    #[test]
    fn test_strict_roundtrip_non_ascii() {
        let text = "Música/日本語/🎵.mp3";
        let decoded = decode_utf16be(&encode_utf16be(text));
        assert_eq!(decoded.text, text);
        assert!(decoded.is_clean());
    }

    #[test]
    fn test_trailing_nul_tolerated() {
        let mut bytes = encode_utf16be("a.mp3");
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(decode_strict(&bytes).unwrap(), "a.mp3");
    }

    #[test]
    fn test_odd_length_falls_back_to_lossy() {
        let mut bytes = encode_utf16be("song.mp3");
        bytes.push(0x00);
        assert!(decode_strict(&bytes).is_err());

        let decoded = decode_utf16be(&bytes);
        assert_eq!(decoded.text, "song.mp3");
        assert_eq!(decoded.strategy, Some(DecodeStrategy::Lossy));
    }

    #[test]
    fn test_lone_surrogate_stripped() {
        let mut bytes = encode_utf16be("ab");
        bytes.extend_from_slice(&[0xD8, 0x00]);
        bytes.extend(encode_utf16be("cd"));
        let decoded = decode_utf16be(&bytes);
        assert_eq!(decoded.text, "abcd");
        assert_eq!(decoded.strategy, Some(DecodeStrategy::Lossy));
    }

    #[test]
    fn test_pairwise_recovers_misaligned_ascii() {
        // Mostly unpaired surrogates with ASCII pairs sprinkled in
        let bytes = [0xDC, 0x00, 0xDC, 0x01, 0xDC, 0x02, 0x00, 0x61, 0xDC, 0x03, 0x00, 0x62];
        assert_eq!(DecodeStrategy::Lossy.decode(&bytes), None);
        let decoded = decode_utf16be(&bytes);
        assert_eq!(decoded.text, "ab");
        assert_eq!(decoded.strategy, Some(DecodeStrategy::Pairwise));
    }

    #[test]
    fn test_ladder_exhausted() {
        let decoded = decode_utf16be(&[0xDC, 0x00, 0xDC, 0x00]);
        assert_eq!(decoded.text, "");
        assert_eq!(decoded.strategy, None);
    }

    #[test]
    fn test_ladder_order() {
        assert_eq!(RECOVERY_LADDER[0], DecodeStrategy::Strict);
        assert_eq!(RECOVERY_LADDER[2], DecodeStrategy::Pairwise);
    }
}
