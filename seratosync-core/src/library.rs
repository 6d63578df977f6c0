//! Library scanning
//!
//! Walks the library root and groups audio files by the folder that contains
//! them. Folder and file paths are root-relative with `/` separators, and
//! files within a folder are in file-name order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Extensions mirrored by default
pub const DEFAULT_AUDIO_EXTENSIONS: [&str; 8] =
    ["mp3", "m4a", "aac", "aif", "aiff", "wav", "flac", "ogg"];

/// Allow-list of file extensions (lowercase, without the dot)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: BTreeSet<String>,
}

impl Default for ExtensionFilter {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_AUDIO_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl ExtensionFilter {
    /// Parse a comma-separated list such as `.mp3, FLAC,wav`
    pub fn parse(list: &str) -> Self {
        let extensions = list
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { extensions }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }
}

/// One folder holding at least one audio file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryFolder {
    /// Root-relative folder path; empty for the root itself
    pub rel_dir: String,
    /// Root-relative file paths
    pub files: Vec<String>,
}

impl LibraryFolder {
    pub fn is_root(&self) -> bool {
        self.rel_dir.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.rel_dir.split('/').filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LibraryStats {
    pub folders: usize,
    pub files: usize,
}

/// Result of a library scan, folders in path order
#[derive(Debug, Clone)]
pub struct LibraryScan {
    pub root: PathBuf,
    pub folders: Vec<LibraryFolder>,
}

impl LibraryScan {
    pub fn stats(&self) -> LibraryStats {
        LibraryStats {
            folders: self.folders.len(),
            files: self.folders.iter().map(|f| f.files.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Whether `rel_dir` (case-insensitive) is a scanned folder or an ancestor of one
    pub fn contains_dir(&self, rel_dir: &str) -> bool {
        let wanted = rel_dir.trim_matches('/').to_lowercase();
        if wanted.is_empty() {
            return true;
        }
        self.folders.iter().any(|f| {
            let dir = f.rel_dir.to_lowercase();
            dir == wanted || dir.starts_with(&format!("{}/", wanted))
        })
    }
}

/// Scan `root` for audio files accepted by `filter`
pub fn scan(root: &Path, filter: &ExtensionFilter) -> Result<LibraryScan> {
    if !root.is_dir() {
        return Err(Error::Path(format!("Library root is not a directory: {:?}", root)));
    }

    let mut folders: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !filter.matches(entry.path()) {
            continue;
        }

        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel_file = rel_string(rel);
        let rel_dir = rel.parent().map(rel_string).unwrap_or_default();

        folders.entry(rel_dir).or_default().push(rel_file);
    }

    let folders: Vec<LibraryFolder> = folders
        .into_iter()
        .map(|(rel_dir, files)| LibraryFolder { rel_dir, files })
        .collect();

    debug!("Scanned {:?}: {} folders with audio", root, folders.len());

    Ok(LibraryScan {
        root: root.to_path_buf(),
        folders,
    })
}

fn rel_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
