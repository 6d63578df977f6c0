//! CLI configuration
//!
//! Settings come from an optional JSON file and from command-line flags, with
//! flags taking precedence. The file is looked up in this order:
//! - `--config <path>`
//! - `./config.json`
//! - `<user config dir>/seratosync/config.json`
//!
//! Relative paths in a config file are resolved against the file's directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use seratosync_core::database::DEFAULT_SAMPLE_SIZE;
use seratosync_core::library::ExtensionFilter;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// Database file name inside the `_Serato_` folder
pub const DATABASE_FILE_NAME: &str = "database V2";

/// Every key is optional; missing ones fall back to flags or defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// `database V2` path; defaults to `<serato_root>/database V2`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_root: Option<PathBuf>,
    /// The `_Serato_` folder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serato_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Comma-separated extensions, e.g. `.mp3,.flac`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Cannot read config file {:?}", path))?;
        let mut config: FileConfig =
            serde_json::from_str(&text).with_context(|| format!("Invalid config file {:?}", path))?;

        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }
        Ok(config)
    }

    fn resolve_relative(&mut self, base: &Path) {
        for path in [&mut self.db, &mut self.library_root, &mut self.serato_root]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Values set in `overrides` replace those in `self`
    pub fn merge(self, overrides: FileConfig) -> FileConfig {
        FileConfig {
            db: overrides.db.or(self.db),
            library_root: overrides.library_root.or(self.library_root),
            serato_root: overrides.serato_root.or(self.serato_root),
            prefix: overrides.prefix.or(self.prefix),
            exts: overrides.exts.or(self.exts),
            sample_size: overrides.sample_size.or(self.sample_size),
        }
    }

    pub fn sample() -> Self {
        FileConfig {
            db: Some(PathBuf::from("/path/to/_Serato_/database V2")),
            library_root: Some(PathBuf::from("/path/to/your/music/library")),
            serato_root: Some(PathBuf::from("/path/to/_Serato_")),
            prefix: None,
            exts: Some(".mp3,.m4a,.aac,.flac,.wav".to_string()),
            sample_size: None,
        }
    }

    /// Explicit `db`, else the database inside `serato_root`
    pub fn db_path(&self) -> Option<PathBuf> {
        self.db
            .clone()
            .or_else(|| self.serato_root.as_ref().map(|root| root.join(DATABASE_FILE_NAME)))
    }
}

/// Candidate config files when `--config` is not given, most local first
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("seratosync").join(CONFIG_FILE_NAME));
    }
    paths
}

/// Load the config file. An explicit path must exist; otherwise the first
/// default location that exists is used, and none at all is fine.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<(FileConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("Config file not found: {:?}", path);
        }
        return Ok((FileConfig::load(path)?, Some(path.to_path_buf())));
    }

    for path in default_config_paths() {
        if path.is_file() {
            return Ok((FileConfig::load(&path)?, Some(path)));
        }
        debug!("No config at {:?}", path);
    }
    Ok((FileConfig::default(), None))
}

/// Settings for a sync run, all required values present
#[derive(Debug, Clone)]
pub struct Config {
    pub db: PathBuf,
    pub library_root: PathBuf,
    pub serato_root: PathBuf,
    pub prefix: Option<String>,
    pub extensions: ExtensionFilter,
    pub sample_size: usize,
}

impl Config {
    pub fn from_file_config(file: FileConfig) -> anyhow::Result<Self> {
        let db = file.db_path();
        let Some(library_root) = file.library_root else {
            bail!("Missing library root (--library-root or \"library_root\" in config)");
        };
        let Some(serato_root) = file.serato_root else {
            bail!("Missing Serato root (--serato-root or \"serato_root\" in config)");
        };
        let Some(db) = db else {
            bail!("Missing database path");
        };

        let extensions = match &file.exts {
            Some(list) => parse_extensions(list)?,
            None => ExtensionFilter::default(),
        };

        Ok(Config {
            db,
            library_root,
            serato_root,
            prefix: file.prefix.filter(|p| !p.trim().is_empty()),
            extensions,
            sample_size: file.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE).max(1),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.db.is_file() {
            bail!("Database file not found: {:?}", self.db);
        }
        if !self.library_root.is_dir() {
            bail!("Library root must be a directory: {:?}", self.library_root);
        }
        if !self.serato_root.is_dir() {
            bail!("Serato root must be a directory: {:?}", self.serato_root);
        }
        Ok(())
    }
}

/// Comma-separated extensions, with or without leading dots
pub fn parse_extensions(list: &str) -> anyhow::Result<ExtensionFilter> {
    let filter = ExtensionFilter::parse(list);
    if filter.is_empty() {
        bail!("No file extensions in {:?}", list);
    }
    Ok(filter)
}

/// Annotated sample config for `--show-config-example`
pub fn example() -> anyhow::Result<String> {
    let mut out = String::new();
    out.push_str("// seratosync looks for config.json in this order:\n");
    out.push_str("//   1. ./config.json\n");
    if let Some(dir) = dirs::config_dir() {
        out.push_str(&format!("//   2. {}\n", dir.join("seratosync").join(CONFIG_FILE_NAME).display()));
    }
    out.push_str("// or use --config <path>. Relative paths are resolved against the file's folder.\n");
    out.push_str("// Remove these comment lines before saving.\n");
    out.push_str(&serde_json::to_string_pretty(&FileConfig::sample())?);
    out.push('\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_resolves_relative_paths() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{ "library_root": "Music", "serato_root": "/abs/_Serato_", "exts": "mp3,flac" }"#,
        )
        .unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.library_root, Some(tmp.path().join("Music")));
        assert_eq!(config.serato_root, Some(PathBuf::from("/abs/_Serato_")));
        assert_eq!(config.db_path(), Some(PathBuf::from("/abs/_Serato_/database V2")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ "library": "x" }"#).unwrap();
        assert!(FileConfig::load(&path).is_err());
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let tmp = TempDir::new().unwrap();
        assert!(load(Some(&tmp.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig {
            library_root: Some("/file/lib".into()),
            serato_root: Some("/file/_Serato_".into()),
            exts: Some("mp3".into()),
            ..Default::default()
        };
        let flags = FileConfig {
            library_root: Some("/flag/lib".into()),
            ..Default::default()
        };

        let merged = file.merge(flags);
        assert_eq!(merged.library_root, Some(PathBuf::from("/flag/lib")));
        assert_eq!(merged.serato_root, Some(PathBuf::from("/file/_Serato_")));
        assert_eq!(merged.exts.as_deref(), Some("mp3"));
    }

    #[test]
    fn test_config_requires_roots() {
        let err = Config::from_file_config(FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains("library root"));

        let config = Config::from_file_config(FileConfig {
            library_root: Some("/lib".into()),
            serato_root: Some("/s".into()),
            prefix: Some("  ".into()),
            sample_size: Some(0),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.db, PathBuf::from("/s/database V2"));
        assert_eq!(config.prefix, None);
        assert_eq!(config.sample_size, 1);
        assert_eq!(config.extensions, ExtensionFilter::default());
    }

    #[test]
    fn test_validate() {
        let tmp = TempDir::new().unwrap();
        let serato = tmp.path().join("_Serato_");
        fs::create_dir_all(&serato).unwrap();
        let config = Config {
            db: serato.join(DATABASE_FILE_NAME),
            library_root: tmp.path().to_path_buf(),
            serato_root: serato.clone(),
            prefix: None,
            extensions: ExtensionFilter::default(),
            sample_size: DEFAULT_SAMPLE_SIZE,
        };
        assert!(config.validate().is_err());

        fs::write(serato.join(DATABASE_FILE_NAME), b"").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_extensions() {
        let filter = parse_extensions(".MP3, flac").unwrap();
        assert!(filter.matches(Path::new("a.flac")));
        assert!(parse_extensions(" , ").is_err());
    }

    #[test]
    fn test_example_parses_after_comments() {
        let example = example().unwrap();
        let json: String = example
            .lines()
            .filter(|l| !l.starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        let parsed: FileConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, FileConfig::sample());
    }
}
