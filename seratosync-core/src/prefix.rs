//! Library prefix inference and path normalization
//!
//! The database stores `pfil` values relative to the volume the file lives on,
//! e.g. `Users/me/Music/Tracks/A/song.mp3` on macOS or `Music\Tracks\song.mp3`
//! from a Windows drive. The scanner produces paths relative to the declared
//! library root. The *prefix* glues the two together: it is the part of a
//! stored path that corresponds to the library root.
//!
//! Resolution runs in two steps:
//! 1. [`infer_prefix`] finds the longest directory prefix shared by at least
//!    half of a sample of stored paths.
//! 2. [`reconcile`] lines that prefix up with the declared root.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

/// Deepest directory prefix considered during inference
pub const DEFAULT_DEPTH_CAP: usize = 8;

/// Convert every `\` to `/`
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Drop a drive letter and any leading or trailing slashes.
///
/// `E:\Music\Tracks` and `/Music/Tracks/` both become `Music/Tracks`.
pub fn strip_root(path: &str) -> String {
    let path = normalize_separators(path);
    let bytes = path.as_bytes();
    let rest = if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        &path[2..]
    } else {
        &path[..]
    };
    rest.trim_matches('/').to_string()
}

/// Non-empty `/`-separated segments
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn eq_segment(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Join a prefix and a root-relative path with `/`
pub fn join(prefix: &str, rel: &str) -> String {
    let rel = normalize_separators(rel);
    let rel = rel.trim_start_matches('/');
    if prefix.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", prefix, rel)
    }
}

/// Most specific directory prefix shared by at least half of `sample`.
///
/// Returns `None` when no prefix reaches that support.
/// Segments are compared case-insensitively; the most common spelling is
/// returned. Ties are broken by count, then lexicographically, so the same
/// sample always yields the same prefix.
pub fn infer_prefix(sample: &[String], depth_cap: usize) -> Option<String> {
    if sample.is_empty() {
        return None;
    }

    // lowercase prefix -> (count, spelling -> count)
    let mut tally: BTreeMap<String, (usize, BTreeMap<String, usize>)> = BTreeMap::new();

    for raw in sample {
        let path = strip_root(raw);
        let segs = segments(&path);
        // The last segment is the file name
        let max_depth = segs.len().saturating_sub(1).min(depth_cap);
        for depth in 1..=max_depth {
            let spelled = segs[..depth].join("/");
            let entry = tally.entry(spelled.to_lowercase()).or_default();
            entry.0 += 1;
            *entry.1.entry(spelled).or_default() += 1;
        }
    }

    let threshold = sample.len();
    let (key, (count, spellings)) = tally
        .iter()
        .filter(|(_, (count, _))| count * 2 >= threshold)
        .max_by(|(ka, (ca, _)), (kb, (cb, _))| {
            segments(ka)
                .len()
                .cmp(&segments(kb).len())
                .then(ca.cmp(cb))
                .then(kb.cmp(ka))
        })?;

    let spelling = spellings
        .iter()
        .max_by(|(sa, ca), (sb, cb)| ca.cmp(cb).then(sb.cmp(sa)))
        .map(|(s, _)| s.clone())
        .unwrap_or_else(|| key.clone());

    debug!("Inferred prefix {:?} ({}/{} paths)", spelling, count, sample.len());
    Some(spelling)
}

/// Where the resolved prefix came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixSource {
    /// The stored paths are more specific than the declared root
    Inferred,
    /// The declared root, expressed in database coordinates
    DeclaredRoot,
    /// Supplied by the user
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPrefix {
    pub prefix: String,
    pub source: PrefixSource,
}

impl ResolvedPrefix {
    pub fn overridden(prefix: &str) -> Self {
        Self {
            prefix: normalize_separators(prefix).trim_matches('/').to_string(),
            source: PrefixSource::Override,
        }
    }
}

/// Reconcile an inferred prefix with the declared library root.
///
/// The root is first anchored in database coordinates: leading segments such
/// as a mount point or home directory are dropped until its head lines up
/// with the inferred prefix. Then:
/// - no inferred prefix: the root is used
/// - root extends the inferred prefix: the root wins
/// - inferred extends the root: the inferred prefix wins, unless the extra
///   segments name a folder inside the library (`is_library_dir`), which means
///   the sample simply sat in one subfolder
/// - only a partial match: the longer of the two, the root on a tie
///
/// Casing follows the root wherever the root supplies the segment.
pub fn reconcile(
    inferred: Option<&str>,
    library_root: &str,
    is_library_dir: impl Fn(&str) -> bool,
) -> ResolvedPrefix {
    let root_path = strip_root(library_root);
    let root = segments(&root_path);

    let inferred_path = inferred.map(strip_root).unwrap_or_default();
    let inferred = segments(&inferred_path);

    if inferred.is_empty() {
        return ResolvedPrefix {
            prefix: root.join("/"),
            source: PrefixSource::DeclaredRoot,
        };
    }

    let anchor = anchor_root(&root, &inferred);
    let anchored = &root[anchor..];
    let common = anchored
        .iter()
        .zip(&inferred)
        .take_while(|(a, b)| eq_segment(a, b))
        .count();

    let declared = ResolvedPrefix {
        prefix: anchored.join("/"),
        source: PrefixSource::DeclaredRoot,
    };

    if common == anchored.len() && common < inferred.len() {
        let extra = inferred[common..].join("/");
        if !anchored.is_empty() && is_library_dir(&extra) {
            debug!("Inferred prefix descends into library folder {:?}", extra);
            return declared;
        }
        let mut prefix: Vec<&str> = anchored.to_vec();
        prefix.extend(&inferred[common..]);
        return ResolvedPrefix {
            prefix: prefix.join("/"),
            source: PrefixSource::Inferred,
        };
    }

    if common == inferred.len() || anchored.len() >= inferred.len() {
        return declared;
    }

    ResolvedPrefix {
        prefix: inferred.join("/"),
        source: PrefixSource::Inferred,
    }
}

/// Index of the root segment the inferred prefix starts at.
///
/// Prefers a position where the overlap agrees completely, then the first
/// position matching the head, then 0.
fn anchor_root(root: &[&str], inferred: &[&str]) -> usize {
    let candidates: Vec<usize> = (0..root.len())
        .filter(|&j| eq_segment(root[j], inferred[0]))
        .collect();

    candidates
        .iter()
        .copied()
        .find(|&j| root[j..].iter().zip(inferred).all(|(a, b)| eq_segment(a, b)))
        .or_else(|| candidates.first().copied())
        .unwrap_or(0)
}

/// Comparison key for a stored path.
///
/// Separators become `/`; when the prefix occurs on segment boundaries
/// (case-insensitively), everything before it is dropped and the prefix is
/// spelled as given, so stored and scanned paths start at the same root.
pub fn normalize_db_path(raw: &str, prefix: &str) -> String {
    let path = normalize_separators(raw);
    let segs = segments(&path);
    let prefix_segs = segments(prefix);

    if !prefix_segs.is_empty() && segs.len() > prefix_segs.len() {
        let found = (0..segs.len() - prefix_segs.len()).find(|&i| {
            segs[i..i + prefix_segs.len()]
                .iter()
                .zip(&prefix_segs)
                .all(|(a, b)| eq_segment(a, b))
        });
        if let Some(i) = found {
            return join(prefix, &segs[i + prefix_segs.len()..].join("/"));
        }
    }

    strip_root(&path)
}
