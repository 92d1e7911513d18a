//! clipstack - inspect and maintain a clipboard history from the command line
//!
//! Usage:
//!     clipstack [--root DIR] [--config FILE] [-v] <command>

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clipstack::config::HistoryConfig;
use clipstack::database::Database;
use clipstack::history::ClipboardHistory;
use clipstack::interface::unix_millis;
use clipstack::migrations::{latest_version, AbortOperator};
use clipstack::models::{now_local, Clip};
use clipstack::owners::FileStemResolver;
use clipstack::search::Searcher;
use clipstack::transfer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// History directory (database and payload folders)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print clips, newest first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Case-insensitive substring search over text and file lists
    Search { query: String },
    /// Write clips to a zip archive
    Export {
        dest: PathBuf,
        /// Only these clip ids (default: all)
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<i64>>,
    },
    /// Merge an archive into the history
    Import { archive: PathBuf },
    /// Apply the configured retention policy now
    Cleanup,
    /// Delete every clip, owner and payload file
    DeleteAll {
        #[arg(long)]
        yes: bool,
    },
    /// Move the schema to a specific version (0 removes every table)
    Migrate {
        #[arg(long)]
        to: u32,
    },
    /// Database and registry figures
    Stats,
    /// Write the effective settings to the config file
    InitConfig,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clipstack")
        .join("config.toml")
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(args: &Args) -> Result<(HistoryConfig, PathBuf)> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = HistoryConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if let Some(root) = &args.root {
        config.history_root = root.clone();
    }
    Ok((config, path))
}

fn open_history(config: HistoryConfig) -> Result<ClipboardHistory> {
    let root = config.history_root.clone();
    ClipboardHistory::open(config, Box::new(AbortOperator), Box::new(FileStemResolver))
        .with_context(|| format!("Failed to open history at {}", root.display()))
}

fn preview(clip: &Clip) -> String {
    let text = clip
        .searchable_text()
        .map(str::to_string)
        .unwrap_or_else(|| {
            let formats: Vec<_> = clip.data.keys().map(|f| format!("{f:?}")).collect();
            format!("[{}]", formats.join(", "))
        });
    let single_line: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() > 60 {
        format!("{}…", single_line.chars().take(60).collect::<String>())
    } else {
        single_line
    }
}

fn print_clip(clip: &Clip) {
    println!(
        "{:>6}  {}  {}{}  {}",
        clip.id,
        clip.clip_time.format("%Y-%m-%d %H:%M:%S"),
        if clip.is_favorite { "★" } else { " " },
        if clip.is_link { "🔗" } else { " " },
        preview(clip)
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    let (config, config_path) = load_config(&args)?;

    match args.command {
        Command::List { limit } => {
            let history = open_history(config)?;
            for clip in history.clips().iter().take(limit) {
                print_clip(clip);
            }
        }
        Command::Search { query } => {
            let history = open_history(config)?;
            let ids = Searcher::new()
                .search(history.search_entries(), query)
                .await
                .context("Search failed")?;
            for clip in ids.iter().filter_map(|id| history.clip(*id)) {
                print_clip(clip);
            }
        }
        Command::Export { dest, ids } => {
            let history = open_history(config)?;
            let plan = history.export_plan(ids.as_deref());
            let count = transfer::export_archive(&plan, &dest)
                .with_context(|| format!("Failed to export to {}", dest.display()))?;
            println!("Exported {count} clips to {}", dest.display());
        }
        Command::Import { archive } => {
            let mut history = open_history(config)?;
            let bundle = transfer::read_archive(&archive, &history.config().history_root.clone())
                .with_context(|| format!("Failed to read {}", archive.display()))?;
            let count = history.apply_import(bundle).context("Failed to import clips")?;
            println!("Imported {count} clips");
        }
        Command::Cleanup => {
            let mut history = open_history(config)?;
            let deleted = history.run_cleanup(now_local());
            println!("Deleted {deleted} clips");
        }
        Command::DeleteAll { yes } => {
            if !yes {
                bail!("Refusing to delete the whole history without --yes");
            }
            let mut history = open_history(config)?;
            history.delete_all_clips().context("Failed to delete clips")?;
            println!("History cleared");
        }
        Command::Migrate { to } => {
            let db = Database::open(
                config.database_path(),
                &config.history_root,
                &FileStemResolver,
                &AbortOperator,
            )
            .context("Failed to open database")?;
            let version = db
                .migrate_to(to, &FileStemResolver)
                .with_context(|| format!("Failed to migrate to version {to}"))?;
            println!("Schema at version {version} (latest {})", latest_version());
        }
        Command::Stats => {
            let history = open_history(config)?;
            let db = history.database();
            println!("Database:   {}", db.path().display());
            println!("Schema:     v{}", db.schema_version()?);
            println!("Size:       {} bytes", db.database_size()?);
            println!("Clips:      {}", db.count_clips()?);
            println!("Owners:     {}", history.owners().owners().filter(|o| !o.is_unknown()).count());
            println!("Tags:       {}", history.tags().tags().count());
            if let Some(newest) = history.clips().first() {
                println!("Newest:     {} ms", unix_millis(newest.clip_time));
            }
            for filter in history.owner_filters() {
                println!("Filter:     {} ({}) blocked {}", filter.name, filter.pattern, filter.filtered_count);
            }
        }
        Command::InitConfig => {
            config
                .save(&config_path)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Wrote {}", config_path.display());
        }
    }

    Ok(())
}
