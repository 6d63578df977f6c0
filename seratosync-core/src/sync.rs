//! Library to crate synchronization
//!
//! One run:
//! 1. scan the library
//! 2. index the database paths and resolve the prefix
//! 3. plan one crate per folder and diff each against disk
//! 4. optionally update the database with renamed and new tracks
//!
//! Crates are only written when their bytes change, so repeated runs over an
//! unchanged library touch nothing.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::crate_file;
use crate::database::{self, Database, PathIndex, DEFAULT_SAMPLE_SIZE};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::library::{self, ExtensionFilter, LibraryScan, LibraryStats};
use crate::prefix::{self, ResolvedPrefix};
use crate::track::TrackRecord;

/// Inputs for one sync run
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub db_path: PathBuf,
    pub library_root: PathBuf,
    pub serato_root: PathBuf,
    /// Use this prefix instead of inferring one
    pub prefix_override: Option<String>,
    pub extensions: ExtensionFilter,
    pub sample_size: usize,
    /// Compute everything, write nothing
    pub dry_run: bool,
    /// Append new tracks and apply renames to the database
    pub update_db: bool,
}

impl SyncOptions {
    pub fn new(db_path: PathBuf, library_root: PathBuf, serato_root: PathBuf) -> Self {
        Self {
            db_path,
            library_root,
            serato_root,
            prefix_override: None,
            extensions: ExtensionFilter::default(),
            sample_size: DEFAULT_SAMPLE_SIZE,
            dry_run: false,
            update_db: false,
        }
    }
}

/// Desired contents of one crate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CratePlan {
    pub rel_dir: String,
    pub crate_path: PathBuf,
    /// `prefix/rel` for each file, in scan order
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrateAction {
    Created,
    Untouched,
    Rewritten,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrateOutcome {
    pub rel_dir: String,
    pub crate_path: PathBuf,
    pub action: CrateAction,
    pub tracks: usize,
}

/// Changes made (or planned) to the database
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseUpdate {
    /// `(old, new)` paths rewritten in place
    pub renamed: Vec<(String, String)>,
    /// Paths appended as new records
    pub added: Vec<String>,
    pub backup: Option<PathBuf>,
}

impl DatabaseUpdate {
    pub fn is_empty(&self) -> bool {
        self.renamed.is_empty() && self.added.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub prefix: ResolvedPrefix,
    pub library: LibraryStats,
    /// Tracks in the database with a readable path
    pub database_tracks: usize,
    pub crates: Vec<CrateOutcome>,
    /// Library files the database does not know about
    pub new_tracks: Vec<String>,
    pub database_update: Option<DatabaseUpdate>,
    pub dry_run: bool,
}

impl SyncReport {
    pub fn count(&self, action: CrateAction) -> usize {
        self.crates.iter().filter(|c| c.action == action).count()
    }

    pub fn created(&self) -> usize {
        self.count(CrateAction::Created)
    }

    pub fn rewritten(&self) -> usize {
        self.count(CrateAction::Rewritten)
    }

    pub fn untouched(&self) -> usize {
        self.count(CrateAction::Untouched)
    }

    pub fn renamed(&self) -> usize {
        self.database_update.as_ref().map(|u| u.renamed.len()).unwrap_or(0)
    }
}

/// Crate file for a root-relative folder
pub fn crate_path_for_dir(serato_root: &Path, rel_dir: &str) -> PathBuf {
    crate_file::crate_path(serato_root, rel_dir.split('/').filter(|s| !s.is_empty()))
}

/// One plan per scanned folder. Files directly in the root get no crate.
pub fn build_crate_plans(scan: &LibraryScan, prefix: &str, serato_root: &Path) -> Vec<CratePlan> {
    scan.folders
        .iter()
        .filter(|folder| !folder.is_root())
        .map(|folder| CratePlan {
            rel_dir: folder.rel_dir.clone(),
            crate_path: crate_path_for_dir(serato_root, &folder.rel_dir),
            paths: folder.files.iter().map(|f| prefix::join(prefix, f)).collect(),
        })
        .collect()
}

/// Every scanned file in database coordinates, root files included
pub fn current_library_paths(scan: &LibraryScan, prefix: &str) -> Vec<String> {
    scan.folders
        .iter()
        .flat_map(|folder| folder.files.iter())
        .map(|f| prefix::join(prefix, f))
        .collect()
}

/// Library paths missing from the database, in scan order
pub fn detect_new_tracks(library_paths: &[String], db_paths: &HashSet<String>) -> Vec<String> {
    library_paths
        .iter()
        .filter(|p| !db_paths.contains(p.as_str()))
        .cloned()
        .collect()
}

/// Compare a crate payload with what is on disk
pub fn diff_crate(crate_path: &Path, payload: &[u8]) -> Result<CrateAction> {
    match fs::read(crate_path) {
        Ok(existing) if existing == payload => Ok(CrateAction::Untouched),
        Ok(_) => Ok(CrateAction::Rewritten),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(CrateAction::Created),
        Err(e) => Err(e.into()),
    }
}

/// Diff every plan and write the crates that changed (unless `dry_run`)
pub fn apply_crate_plans(plans: &[CratePlan], dry_run: bool) -> Result<Vec<CrateOutcome>> {
    let mut outcomes = Vec::with_capacity(plans.len());

    for plan in plans {
        let payload = crate_file::build_payload(&plan.paths);
        let action = diff_crate(&plan.crate_path, &payload)?;

        if action != CrateAction::Untouched && !dry_run {
            crate_file::write_payload(&plan.crate_path, &payload)?;
        }
        debug!("{:?} crate {:?} ({} tracks)", action, plan.crate_path, plan.paths.len());

        outcomes.push(CrateOutcome {
            rel_dir: plan.rel_dir.clone(),
            crate_path: plan.crate_path.clone(),
            action,
            tracks: plan.paths.len(),
        });
    }

    Ok(outcomes)
}

/// Override if given, otherwise reconcile the inferred prefix with the root
pub fn resolve_prefix(options: &SyncOptions, inferred: Option<&str>, scan: &LibraryScan) -> ResolvedPrefix {
    if let Some(prefix) = options.prefix_override.as_deref() {
        return ResolvedPrefix::overridden(prefix);
    }
    let root = options.library_root.to_string_lossy();
    prefix::reconcile(inferred, &root, |rel| scan.contains_dir(rel))
}

/// Apply renames and append new tracks to an in-memory database.
///
/// A stored path that is no longer in the library is treated as renamed when
/// its folder has exactly one missing record and exactly one new track.
pub fn plan_database_update(
    db: &mut Database,
    prefix: &str,
    library_paths: &[String],
    new_tracks: &[String],
    added_unix: u32,
) -> DatabaseUpdate {
    let library: HashSet<&str> = library_paths.iter().map(String::as_str).collect();

    let mut missing: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, track) in db.tracks.iter().enumerate() {
        let Some(path) = track.path() else { continue };
        let normalized = prefix::normalize_db_path(&path, prefix);
        if !library.contains(normalized.as_str()) {
            missing.entry(parent_dir(&normalized).to_string()).or_default().push(idx);
        }
    }

    let mut new_by_dir: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
    for path in new_tracks {
        new_by_dir.entry(parent_dir(path)).or_default().push(path);
    }

    let mut renamed = Vec::new();
    for (dir, records) in &missing {
        let candidates = new_by_dir.get(dir.as_str()).map(Vec::as_slice).unwrap_or_default();
        if let ([idx], [new_path]) = (records.as_slice(), candidates) {
            let track = &mut db.tracks[*idx];
            let old = track.path().unwrap_or_default();
            track.set_path(new_path);
            debug!("Renamed {:?} -> {:?}", old, new_path);
            renamed.push((old, new_path.to_string()));
        }
    }

    let renamed_to: HashSet<&str> = renamed.iter().map(|(_, new)| new.as_str()).collect();
    let added: Vec<String> = new_tracks
        .iter()
        .filter(|p| !renamed_to.contains(p.as_str()))
        .cloned()
        .collect();

    for path in &added {
        db.tracks.push(TrackRecord::minimal(path, added_unix));
    }

    DatabaseUpdate {
        renamed,
        added,
        backup: None,
    }
}

/// Apply renames and new tracks to `db` (as read from `db_path`), back up
/// the file and write it back atomically. Nothing is written when there is
/// nothing to change.
pub fn update_database(
    db_path: &Path,
    mut db: Database,
    prefix: &str,
    library_paths: &[String],
    new_tracks: &[String],
    dry_run: bool,
) -> Result<DatabaseUpdate> {
    let before = db.tracks.len();
    let mut update = plan_database_update(&mut db, prefix, library_paths, new_tracks, now_unix());

    if update.is_empty() {
        info!("Database already up to date");
        return Ok(update);
    }
    if dry_run {
        info!(
            "Dry run: would rename {} and add {} tracks",
            update.renamed.len(),
            update.added.len()
        );
        return Ok(update);
    }

    update.backup = Some(database::backup(db_path)?);
    database::write(db_path, &db)?;
    info!(
        "Database updated: {} renamed, {} added ({} -> {} records)",
        update.renamed.len(),
        update.added.len(),
        before,
        db.tracks.len()
    );
    Ok(update)
}

/// Run a full sync
pub fn run(options: &SyncOptions, diag: &mut Diagnostics) -> Result<SyncReport> {
    let scan = library::scan(&options.library_root, &options.extensions)?;
    let stats = scan.stats();
    info!("Library: {} folders, {} audio files", stats.folders, stats.files);

    // The update needs every record, so read the file once and index that
    let (index, db) = if options.update_db {
        let db = database::read(&options.db_path, diag)?;
        (PathIndex::from_database(&db, options.sample_size), Some(db))
    } else {
        let index = database::read_path_index(&options.db_path, options.sample_size, diag)?;
        (index, None)
    };
    let resolved = resolve_prefix(options, index.prefix.as_deref(), &scan);
    info!("Using prefix {:?} ({:?})", resolved.prefix, resolved.source);

    let db_paths = index.normalized(&resolved.prefix);
    let library_paths = current_library_paths(&scan, &resolved.prefix);
    let new_tracks = detect_new_tracks(&library_paths, &db_paths);
    info!("{} tracks not yet in the database", new_tracks.len());

    let plans = build_crate_plans(&scan, &resolved.prefix, &options.serato_root);
    let crates = apply_crate_plans(&plans, options.dry_run)?;

    let database_update = match db {
        Some(db) => Some(update_database(
            &options.db_path,
            db,
            &resolved.prefix,
            &library_paths,
            &new_tracks,
            options.dry_run,
        )?),
        None => None,
    };

    // Renamed records are not new
    let new_tracks = match &database_update {
        Some(update) => update.added.clone(),
        None => new_tracks,
    };

    let report = SyncReport {
        prefix: resolved,
        library: stats,
        database_tracks: index.total,
        crates,
        new_tracks,
        database_update,
        dry_run: options.dry_run,
    };
    info!(
        "Crates: {} created, {} rewritten, {} untouched",
        report.created(),
        report.rewritten(),
        report.untouched()
    );
    Ok(report)
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn now_unix() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::LibraryFolder;
    use crate::prefix::PrefixSource;
    use crate::track::{FieldValue, PFIL};
    use tempfile::TempDir;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn scan(folders: &[(&str, &[&str])]) -> LibraryScan {
        LibraryScan {
            root: PathBuf::from("/Volumes/Drive/Music/Tracks"),
            folders: folders
                .iter()
                .map(|(dir, files)| LibraryFolder {
                    rel_dir: dir.to_string(),
                    files: strings(files),
                })
                .collect(),
        }
    }

    fn db_with(paths: &[&str]) -> Database {
        let mut db = Database::new();
        for path in paths {
            let mut track = TrackRecord::new();
            track.set(PFIL, FieldValue::Text(path.to_string()));
            db.tracks.push(track);
        }
        db
    }

    #[test]
    fn test_crate_plans() {
        let scan = scan(&[
            ("", &["root.mp3"]),
            ("Rock/90s", &["Rock/90s/a.mp3", "Rock/90s/b.mp3"]),
        ]);
        let plans = build_crate_plans(&scan, "Music/Tracks", Path::new("/serato"));

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].crate_path, PathBuf::from("/serato/Subcrates/Rock%%90s.crate"));
        assert_eq!(
            plans[0].paths,
            strings(&["Music/Tracks/Rock/90s/a.mp3", "Music/Tracks/Rock/90s/b.mp3"])
        );

        let all = current_library_paths(&scan, "Music/Tracks");
        assert_eq!(all[0], "Music/Tracks/root.mp3");
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_detect_new_tracks_keeps_order() {
        let library = strings(&["P/c.mp3", "P/a.mp3", "P/b.mp3"]);
        let db: HashSet<String> = strings(&["P/a.mp3", "P/old.mp3"]).into_iter().collect();
        assert_eq!(detect_new_tracks(&library, &db), strings(&["P/c.mp3", "P/b.mp3"]));
    }

    #[test]
    fn test_diff_outcomes() {
        let tmp = TempDir::new().unwrap();
        let plans = vec![CratePlan {
            rel_dir: "A".into(),
            crate_path: tmp.path().join("Subcrates").join("A.crate"),
            paths: strings(&["P/A/x.mp3"]),
        }];

        let dry = apply_crate_plans(&plans, true).unwrap();
        assert_eq!(dry[0].action, CrateAction::Created);
        assert!(!plans[0].crate_path.exists());

        assert_eq!(apply_crate_plans(&plans, false).unwrap()[0].action, CrateAction::Created);
        assert_eq!(apply_crate_plans(&plans, false).unwrap()[0].action, CrateAction::Untouched);

        let mut changed = plans.clone();
        changed[0].paths.push("P/A/y.mp3".into());
        assert_eq!(apply_crate_plans(&changed, false).unwrap()[0].action, CrateAction::Rewritten);
        assert_eq!(
            crate_file::read(&changed[0].crate_path).unwrap(),
            strings(&["P/A/x.mp3", "P/A/y.mp3"])
        );
    }

    #[test]
    fn test_resolve_prefix_override() {
        let mut options = SyncOptions::new("db".into(), "/Volumes/Drive/Music/Tracks".into(), "s".into());
        let scan = scan(&[("A", &["A/x.mp3"])]);

        let resolved = resolve_prefix(&options, Some("Music/Tracks/A"), &scan);
        assert_eq!(resolved.prefix, "Music/Tracks");
        assert_eq!(resolved.source, PrefixSource::DeclaredRoot);

        options.prefix_override = Some("/Custom/Prefix/".into());
        let resolved = resolve_prefix(&options, Some("Music/Tracks/A"), &scan);
        assert_eq!(resolved.prefix, "Custom/Prefix");
        assert_eq!(resolved.source, PrefixSource::Override);
    }

    #[test]
    fn test_single_rename_in_folder() {
        let mut db = db_with(&["E:/Music/Rock/old name.mp3", "Music/Rock/kept.mp3"]);
        let library = strings(&["Music/Rock/kept.mp3", "Music/Rock/new name.mp3"]);
        let new_tracks = strings(&["Music/Rock/new name.mp3"]);

        let update = plan_database_update(&mut db, "Music", &library, &new_tracks, 1_700_000_000);
        assert_eq!(
            update.renamed,
            vec![("E:/Music/Rock/old name.mp3".to_string(), "Music/Rock/new name.mp3".to_string())]
        );
        assert!(update.added.is_empty());
        assert_eq!(db.tracks.len(), 2);
        assert_eq!(db.tracks[0].path().as_deref(), Some("Music/Rock/new name.mp3"));
    }

    #[test]
    fn test_ambiguous_renames_become_additions() {
        let mut db = db_with(&["Music/Rock/gone1.mp3", "Music/Rock/gone2.mp3"]);
        let library = strings(&["Music/Rock/x.mp3", "Music/Jazz/y.mp3"]);
        let new_tracks = library.clone();

        let update = plan_database_update(&mut db, "Music", &library, &new_tracks, 1);
        assert!(update.renamed.is_empty());
        assert_eq!(update.added, new_tracks);
        assert_eq!(db.tracks.len(), 4);
        assert_eq!(db.tracks[3].path().as_deref(), Some("Music/Jazz/y.mp3"));
        assert_eq!(db.tracks[3].get(crate::track::UADD), Some(&FieldValue::Integer(1)));
    }

    #[test]
    fn test_report_counts() {
        let outcome = |action| CrateOutcome {
            rel_dir: "A".into(),
            crate_path: PathBuf::from("A.crate"),
            action,
            tracks: 1,
        };
        let report = SyncReport {
            prefix: ResolvedPrefix::overridden("P"),
            library: LibraryStats::default(),
            database_tracks: 0,
            crates: vec![
                outcome(CrateAction::Created),
                outcome(CrateAction::Untouched),
                outcome(CrateAction::Untouched),
            ],
            new_tracks: Vec::new(),
            database_update: None,
            dry_run: false,
        };
        assert_eq!(report.created(), 1);
        assert_eq!(report.untouched(), 2);
        assert_eq!(report.rewritten(), 0);
        assert_eq!(report.renamed(), 0);
    }
}
