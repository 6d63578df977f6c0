//! seratosync: mirror a music folder tree into Serato crates
//!
//! Every folder holding audio files becomes a crate under
//! `_Serato_/Subcrates`, named after the folder path. Optionally appends new
//! tracks to `database V2`.

mod config;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use seratosync_core::cleanup::{self, CleanupOptions};
use seratosync_core::database::{self, PathIndex, DEFAULT_SAMPLE_SIZE};
use seratosync_core::library::{self, ExtensionFilter};
use seratosync_core::sync::{self, SyncOptions, SyncReport};
use seratosync_core::Diagnostics;

use config::{Config, FileConfig};

/// New tracks listed before the output is cut short
const MAX_LISTED_TRACKS: usize = 20;

#[derive(Parser)]
#[command(name = "seratosync")]
#[command(about = "Mirror a music folder tree into Serato crates")]
#[command(version)]
struct Cli {
    /// Config file (default: ./config.json, then the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print an example config file and exit
    #[arg(long)]
    show_config_example: bool,

    /// Defaults to `sync`
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write one crate per library folder
    Sync(SyncArgs),

    /// Remove unusable track records from the database
    Cleanup(CleanupArgs),

    /// Show what the database contains and which prefix it implies
    Inspect(InspectArgs),
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Sync(SyncArgs::default())
    }
}

#[derive(Args, Default)]
struct SyncArgs {
    /// Path to `database V2` (default: <serato-root>/database V2)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Root of the music folder tree
    #[arg(long)]
    library_root: Option<PathBuf>,

    /// The `_Serato_` folder
    #[arg(long)]
    serato_root: Option<PathBuf>,

    /// Path prefix for crate entries; skips inference
    #[arg(long)]
    prefix: Option<String>,

    /// Comma-separated audio extensions, e.g. `.mp3,.flac`
    #[arg(long)]
    exts: Option<String>,

    /// Stored paths sampled for prefix inference
    #[arg(long)]
    sample_size: Option<usize>,

    /// Report what would change without writing
    #[arg(long)]
    dry_run: bool,

    /// Also add new tracks (and apply renames) to the database
    #[arg(long)]
    update_db: bool,
}

impl SyncArgs {
    fn overrides(&self) -> FileConfig {
        FileConfig {
            db: self.db.clone(),
            library_root: self.library_root.clone(),
            serato_root: self.serato_root.clone(),
            prefix: self.prefix.clone(),
            exts: self.exts.clone(),
            sample_size: self.sample_size,
        }
    }
}

#[derive(Args)]
struct CleanupArgs {
    /// Path to `database V2` (default: <serato-root>/database V2)
    #[arg(long)]
    db: Option<PathBuf>,

    /// The `_Serato_` folder
    #[arg(long)]
    serato_root: Option<PathBuf>,

    /// Remove records whose path repeats (case-insensitive)
    #[arg(long)]
    remove_duplicates: bool,

    /// Remove records with no title, artist or album
    #[arg(long)]
    require_metadata: bool,

    /// Only report what cleanup would find
    #[arg(long)]
    analyze: bool,

    /// Report counts without writing
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct InspectArgs {
    /// Path to `database V2` (default: <serato-root>/database V2)
    #[arg(long)]
    db: Option<PathBuf>,

    /// The `_Serato_` folder
    #[arg(long)]
    serato_root: Option<PathBuf>,

    /// Reconcile the inferred prefix against this library root
    #[arg(long)]
    library_root: Option<PathBuf>,

    /// Stored paths sampled for prefix inference
    #[arg(long)]
    sample_size: Option<usize>,
}

#[derive(Serialize)]
struct JsonOutput<'a, T: Serialize> {
    result: &'a T,
    diagnostics: &'a Diagnostics,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.show_config_example {
        print!("{}", config::example()?);
        return Ok(());
    }

    // Setup logging
    let level = if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (file_config, source) = config::load(cli.config.as_deref())?;
    if let Some(source) = &source {
        info!("Loaded config from {:?}", source);
    }

    let json = cli.json;
    let mut diag = Diagnostics::new();
    match cli.command.unwrap_or_default() {
        Commands::Sync(args) => cmd_sync(file_config, args, json, &mut diag),
        Commands::Cleanup(args) => cmd_cleanup(file_config, args, json, &mut diag),
        Commands::Inspect(args) => cmd_inspect(file_config, args, json, &mut diag),
    }
}

fn cmd_sync(file: FileConfig, args: SyncArgs, json: bool, diag: &mut Diagnostics) -> anyhow::Result<()> {
    let config = Config::from_file_config(file.merge(args.overrides()))?;
    config.validate()?;

    info!("Library root: {:?}", config.library_root);
    info!("Serato root: {:?}", config.serato_root);

    let mut options = SyncOptions::new(config.db, config.library_root, config.serato_root);
    options.prefix_override = config.prefix;
    options.extensions = config.extensions;
    options.sample_size = config.sample_size;
    options.dry_run = args.dry_run;
    options.update_db = args.update_db;

    let report = sync::run(&options, diag).context("Sync failed")?;

    if json {
        return print_json(&report, diag);
    }
    print_sync_report(&report);
    print_diagnostics(diag);
    Ok(())
}

fn cmd_cleanup(file: FileConfig, args: CleanupArgs, json: bool, diag: &mut Diagnostics) -> anyhow::Result<()> {
    let merged = file.merge(FileConfig {
        db: args.db,
        serato_root: args.serato_root,
        ..Default::default()
    });
    let db_path = merged
        .db_path()
        .context("Missing database path (--db or --serato-root)")?;
    if !db_path.is_file() {
        anyhow::bail!("Database file not found: {:?}", db_path);
    }

    if args.analyze {
        let db = database::read(&db_path, diag)?;
        let analysis = cleanup::analyze(&db);
        if json {
            return print_json(&analysis, diag);
        }
        println!("✓ Database: {} tracks", analysis.total);
        println!("  Without path: {}", analysis.no_path);
        println!("  Without metadata: {}", analysis.no_metadata);
        println!("  Corrupted paths: {}", analysis.corrupted_paths);
        println!("  Potential duplicates: {}", analysis.potential_duplicates);
        println!("  Extensions:");
        for (ext, count) in &analysis.extensions {
            println!("    {:>8}  {}", ext, count);
        }
        print_diagnostics(diag);
        return Ok(());
    }

    let options = CleanupOptions {
        remove_duplicates: args.remove_duplicates,
        require_metadata: args.require_metadata,
    };
    let outcome = cleanup::clean_database(&db_path, options, args.dry_run, diag).context("Cleanup failed")?;

    if json {
        return print_json(&outcome, diag);
    }
    let stats = &outcome.stats;
    println!("✓ Cleanup: {} -> {} tracks", stats.original_count, stats.final_count);
    println!("  Without path: {}", stats.removed_no_path);
    println!("  Corrupted: {}", stats.removed_corrupted);
    println!("  Without metadata: {}", stats.removed_no_metadata);
    println!("  Duplicates: {}", stats.removed_duplicates);
    if let Some(backup) = &outcome.backup {
        println!("  Backup: {}", backup.display());
    }
    if args.dry_run {
        println!("  (dry run: database not modified)");
    }
    print_diagnostics(diag);
    Ok(())
}

#[derive(Serialize)]
struct Inspection {
    version: String,
    tracks: usize,
    other_records: usize,
    indexed_paths: usize,
    discarded: usize,
    inferred_prefix: Option<String>,
    resolved_prefix: Option<String>,
    sample: Vec<String>,
}

fn cmd_inspect(file: FileConfig, args: InspectArgs, json: bool, diag: &mut Diagnostics) -> anyhow::Result<()> {
    let merged = file.merge(FileConfig {
        db: args.db,
        serato_root: args.serato_root,
        library_root: args.library_root,
        sample_size: args.sample_size,
        ..Default::default()
    });
    let db_path = merged
        .db_path()
        .context("Missing database path (--db or --serato-root)")?;
    let sample_size = merged.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE).max(1);

    let db = database::read(&db_path, diag)?;
    let index = PathIndex::from_database(&db, sample_size);

    let resolved_prefix = match &merged.library_root {
        Some(root) => {
            let scan = library::scan(root, &ExtensionFilter::default())?;
            let options = SyncOptions::new(db_path.clone(), root.clone(), PathBuf::new());
            Some(sync::resolve_prefix(&options, index.prefix.as_deref(), &scan).prefix)
        }
        None => None,
    };

    let inspection = Inspection {
        version: db.version.text(),
        tracks: db.tracks.len(),
        other_records: db.others.len(),
        indexed_paths: index.total,
        discarded: index.discarded + diag.discarded_records,
        inferred_prefix: index.prefix,
        resolved_prefix,
        sample: index.sample.into_iter().take(5).collect(),
    };

    if json {
        return print_json(&inspection, diag);
    }
    println!("✓ {}", inspection.version);
    println!("  Track records: {}", inspection.tracks);
    if inspection.other_records > 0 {
        println!("  Other records (kept as-is): {}", inspection.other_records);
    }
    println!("  Readable paths: {} ({} discarded)", inspection.indexed_paths, inspection.discarded);
    println!("  Inferred prefix: {}", inspection.inferred_prefix.as_deref().unwrap_or("(none)"));
    if let Some(prefix) = &inspection.resolved_prefix {
        println!("  Resolved prefix: {}", prefix);
    }
    println!("  Sample paths:");
    for path in &inspection.sample {
        println!("    {}", path);
    }
    print_diagnostics(diag);
    Ok(())
}

fn print_json<T: Serialize>(result: &T, diag: &Diagnostics) -> anyhow::Result<()> {
    let output = JsonOutput {
        result,
        diagnostics: diag,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_sync_report(report: &SyncReport) {
    println!("✓ Prefix: {} ({:?})", report.prefix.prefix, report.prefix.source);
    println!("  Library: {} folders, {} files", report.library.folders, report.library.files);
    println!("  Database: {} tracks", report.database_tracks);
    println!(
        "  Crates: {} created, {} rewritten, {} untouched",
        report.created(),
        report.rewritten(),
        report.untouched()
    );

    println!("  New tracks: {}", report.new_tracks.len());
    for path in report.new_tracks.iter().take(MAX_LISTED_TRACKS) {
        println!("    + {}", path);
    }
    if report.new_tracks.len() > MAX_LISTED_TRACKS {
        println!("    ... and {} more", report.new_tracks.len() - MAX_LISTED_TRACKS);
    }

    if let Some(update) = &report.database_update {
        println!("  Renamed: {}", update.renamed.len());
        for (old, new) in &update.renamed {
            println!("    {} -> {}", old, new);
        }
        if let Some(backup) = &update.backup {
            println!("  Backup: {}", backup.display());
        }
    }

    if report.dry_run {
        println!("  (dry run: nothing written)");
    }
}

fn print_diagnostics(diag: &Diagnostics) {
    if diag.is_clean() {
        return;
    }
    eprintln!(
        "✗ {} warnings ({} records discarded, {} fields recovered, {} resyncs{})",
        diag.warnings.len(),
        diag.discarded_records,
        diag.recovered_fields,
        diag.resyncs,
        if diag.malformed_header { ", malformed header" } else { "" }
    );
}
