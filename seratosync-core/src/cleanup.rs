//! Database cleanup and analysis
//!
//! Removes track records that the application cannot use. Checks run in order
//! and a record is counted against the first one it fails:
//! 1. no `pfil`
//! 2. corrupted path (too short, embedded NUL, no extension)
//! 3. no title, artist or album (optional)
//! 4. duplicate path, compared case-insensitively with `\` as `/` (optional)

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::database::{self, Database};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::prefix;
use crate::track::{TrackRecord, PFIL, TALB, TART, TSNG};

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    pub remove_duplicates: bool,
    pub require_metadata: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub original_count: usize,
    pub removed_no_path: usize,
    pub removed_corrupted: usize,
    pub removed_no_metadata: usize,
    pub removed_duplicates: usize,
    pub final_count: usize,
}

impl CleanupStats {
    pub fn removed(&self) -> usize {
        self.original_count - self.final_count
    }
}

/// Drop unusable tracks from `db`, keeping the first occurrence of each
/// surviving path. Non-track records are left alone.
pub fn clean_records(db: &mut Database, options: CleanupOptions) -> CleanupStats {
    let mut stats = CleanupStats {
        original_count: db.tracks.len(),
        ..Default::default()
    };
    let mut seen = HashSet::new();

    db.retain_tracks(|track| {
        let Some(path) = stored_path(track) else {
            stats.removed_no_path += 1;
            return false;
        };
        if is_corrupted_path(&path) {
            stats.removed_corrupted += 1;
            return false;
        }
        if options.require_metadata && !has_metadata(track) {
            stats.removed_no_metadata += 1;
            return false;
        }
        if options.remove_duplicates && !seen.insert(duplicate_key(&path)) {
            stats.removed_duplicates += 1;
            return false;
        }
        true
    });

    stats.final_count = db.tracks.len();
    stats
}

/// Shorter than three characters, contains NUL, or has no file extension
pub fn is_corrupted_path(path: &str) -> bool {
    if path.chars().count() < 3 || path.contains('\0') {
        return true;
    }
    extension(path).is_none()
}

/// Read-only counts for `cleanup --analyze`
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseAnalysis {
    pub total: usize,
    pub no_path: usize,
    pub no_metadata: usize,
    pub corrupted_paths: usize,
    pub potential_duplicates: usize,
    /// Lowercase extension -> track count
    pub extensions: BTreeMap<String, usize>,
}

pub fn analyze(db: &Database) -> DatabaseAnalysis {
    let mut analysis = DatabaseAnalysis {
        total: db.tracks.len(),
        ..Default::default()
    };
    let mut seen = HashSet::new();

    for track in &db.tracks {
        if !has_metadata(track) {
            analysis.no_metadata += 1;
        }
        let Some(path) = stored_path(track) else {
            analysis.no_path += 1;
            continue;
        };
        if is_corrupted_path(&path) {
            analysis.corrupted_paths += 1;
        }
        if !seen.insert(duplicate_key(&path)) {
            analysis.potential_duplicates += 1;
        }
        let ext = extension(&path).unwrap_or_else(|| "(none)".to_string());
        *analysis.extensions.entry(ext).or_default() += 1;
    }

    analysis
}

/// Result of a cleanup run
#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    pub stats: CleanupStats,
    pub backup: Option<PathBuf>,
}

/// Clean the database at `db_path`. Writes (after a backup) only when
/// records were removed and `dry_run` is off.
pub fn clean_database(
    db_path: &Path,
    options: CleanupOptions,
    dry_run: bool,
    diag: &mut Diagnostics,
) -> Result<CleanupOutcome> {
    let mut db = database::read(db_path, diag)?;
    let stats = clean_records(&mut db, options);

    info!(
        "Cleanup: {} -> {} records ({} without path, {} corrupted, {} without metadata, {} duplicates)",
        stats.original_count,
        stats.final_count,
        stats.removed_no_path,
        stats.removed_corrupted,
        stats.removed_no_metadata,
        stats.removed_duplicates
    );

    if stats.removed() == 0 || dry_run {
        return Ok(CleanupOutcome { stats, backup: None });
    }

    let backup = database::backup(db_path)?;
    database::write(db_path, &db)?;
    Ok(CleanupOutcome {
        stats,
        backup: Some(backup),
    })
}

/// Non-blank `pfil`, whatever decoding it took
fn stored_path(track: &TrackRecord) -> Option<String> {
    track.text(PFIL).filter(|p| !p.trim().is_empty())
}

fn has_metadata(track: &TrackRecord) -> bool {
    [TSNG, TART, TALB]
        .into_iter()
        .any(|tag| track.text(tag).is_some_and(|t| !t.trim().is_empty()))
}

fn duplicate_key(path: &str) -> String {
    prefix::normalize_separators(path).to_lowercase()
}

fn extension(path: &str) -> Option<String> {
    let normalized = prefix::normalize_separators(path);
    let name = normalized.rsplit('/').next().unwrap_or(&normalized);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_lowercase()),
        _ => None,
    }
}
