//! Command surface for inspecting persisted execution diffs.
//!
//! Hosts embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//!
//! Read commands open the store read-only and never create the database file.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use session_diffs_core::{format_rfc3339, DevServerConfig, SessionDiffSummary};
use session_diffs_store_sqlite::{MalformedPolicy, SessionDiffs, SessionOverview, SqliteDiffStore};

#[derive(Debug, Parser)]
#[command(name = "sdiff")]
#[command(about = "Session history execution-diff inspector")]
pub struct Cli {
    #[arg(long, default_value = "./session_history.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
    Diffs {
        #[command(subcommand)]
        command: DiffsCommand,
    },
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    DevServer {
        #[command(subcommand)]
        command: DevServerCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    /// Create the schema (idempotent).
    Init,
}

#[derive(Debug, Subcommand)]
pub enum DiffsCommand {
    List(DiffsListArgs),
    Summary(DiffsSummaryArgs),
}

#[derive(Debug, Args)]
pub struct DiffsListArgs {
    #[arg(long)]
    session_id: String,
    #[arg(long)]
    json: bool,
    /// Leave out records whose files_changed cannot be decoded instead of failing.
    #[arg(long)]
    skip_malformed: bool,
    #[arg(long)]
    show_diff: bool,
}

#[derive(Debug, Args)]
pub struct DiffsSummaryArgs {
    #[arg(long)]
    session_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    List(SessionsListArgs),
}

#[derive(Debug, Args)]
pub struct SessionsListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum DevServerCommand {
    Show(DevServerShowArgs),
}

#[derive(Debug, Args)]
pub struct DevServerShowArgs {
    /// JSON file with `port` and `proxy`; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or queried, a record
/// fails to decode, or configuration loading fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    match command {
        Command::Store { command } => run_store(command, db_path),
        Command::Diffs { command } => {
            tracing::debug!(db = %db_path.display(), command = ?command, "running diffs command");
            let store = SqliteDiffStore::open_read_only(db_path)?;
            run_diffs(command, &store)
        }
        Command::Sessions { command } => {
            tracing::debug!(db = %db_path.display(), command = ?command, "running sessions command");
            let store = SqliteDiffStore::open_read_only(db_path)?;
            run_sessions(command, &store)
        }
        Command::DevServer { command } => {
            tracing::debug!(command = ?command, "running dev-server command");
            run_dev_server(command)
        }
    }
}

fn run_store(command: StoreCommand, db_path: &Path) -> Result<()> {
    match command {
        StoreCommand::Init => {
            let store = SqliteDiffStore::open(db_path)?;
            store.migrate()?;
            tracing::info!(db = %db_path.display(), "initialized execution diff store");
            println!("initialized execution diff store at {}", db_path.display());
            Ok(())
        }
    }
}

fn run_diffs(command: DiffsCommand, store: &SqliteDiffStore) -> Result<()> {
    match command {
        DiffsCommand::List(args) => {
            let policy = if args.skip_malformed {
                MalformedPolicy::Skip
            } else {
                MalformedPolicy::Abort
            };
            let diffs = store.fetch_diffs_for_session_with(&args.session_id, policy)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&diffs)?);
            } else {
                print!("{}", render_diff_table(&diffs, args.show_diff)?);
            }
            Ok(())
        }
        DiffsCommand::Summary(args) => {
            let summary = store.summarize_session(&args.session_id)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", render_summary(&summary));
            }
            Ok(())
        }
    }
}

fn run_sessions(command: SessionsCommand, store: &SqliteDiffStore) -> Result<()> {
    match command {
        SessionsCommand::List(args) => {
            let sessions = store.list_sessions()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print!("{}", render_sessions(&sessions));
            }
            Ok(())
        }
    }
}

fn run_dev_server(command: DevServerCommand) -> Result<()> {
    match command {
        DevServerCommand::Show(args) => {
            let config = load_dev_server_config(args.config.as_deref())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", render_dev_server(&config));
            }
            Ok(())
        }
    }
}

fn load_dev_server_config(path: Option<&Path>) -> Result<DevServerConfig> {
    let Some(path) = path else {
        return Ok(DevServerConfig::default());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read dev server config {}", path.display()))?;
    Ok(DevServerConfig::from_json(&raw)?)
}

fn render_diff_table(diffs: &SessionDiffs, show_diff: bool) -> Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "session: {} ({} records)",
        diffs.session_id,
        diffs.records.len()
    )?;
    writeln!(
        out,
        "{:<6} {:<28} {:>6} {:>6} {:>6} {:<17} {:<20} files",
        "seq", "id", "files", "+", "-", "commits", "timestamp"
    )?;
    writeln!(out, "{}", "-".repeat(110))?;

    for record in &diffs.records {
        let commits = format!(
            "{}..{}",
            short_hash(record.before_commit_hash.as_deref()),
            short_hash(record.after_commit_hash.as_deref())
        );
        let files_column = if record.stats_consistent() {
            record.stats_files_changed.to_string()
        } else {
            format!("{}!", record.stats_files_changed)
        };
        writeln!(
            out,
            "{:<6} {:<28} {:>6} {:>6} {:>6} {:<17} {:<20} {}",
            record.execution_sequence,
            record.id,
            files_column,
            record.stats_additions,
            record.stats_deletions,
            commits,
            format_rfc3339(record.timestamp)?,
            record.files_changed.join(",")
        )?;

        if show_diff {
            match record.git_diff.as_deref() {
                Some(diff) if record.has_changes() => {
                    for line in diff.lines() {
                        writeln!(out, "    {line}")?;
                    }
                }
                _ => writeln!(out, "    (no changes captured)")?,
            }
        }
    }

    for skipped in &diffs.skipped {
        writeln!(
            out,
            "skipped: {} (seq {}): {}",
            skipped.record_id, skipped.execution_sequence, skipped.detail
        )?;
    }

    Ok(out)
}

fn render_summary(summary: &SessionDiffSummary) -> String {
    let sequence_range = match (
        summary.first_execution_sequence,
        summary.last_execution_sequence,
    ) {
        (Some(first), Some(last)) => format!("{first}..{last}"),
        _ => "n/a".to_string(),
    };

    format!(
        "session={} records={} sequences={} additions={} deletions={} files_touched={} inconsistent_stats={}\nfiles={}\n",
        summary.session_id,
        summary.record_count,
        sequence_range,
        summary.total_additions,
        summary.total_deletions,
        summary.files_touched.len(),
        summary.inconsistent_stats_records,
        summary.files_touched.join(",")
    )
}

fn render_sessions(sessions: &[SessionOverview]) -> String {
    let mut out = format!("{:<40} {:>8} last_seq\n", "session_id", "records");
    for session in sessions {
        let last = session
            .last_execution_sequence
            .map_or_else(|| "n/a".to_string(), |value| value.to_string());
        out.push_str(&format!(
            "{:<40} {:>8} {}\n",
            session.session_id, session.record_count, last
        ));
    }
    out
}

fn render_dev_server(config: &DevServerConfig) -> String {
    let mut out = format!("port={}\n", config.port);
    for (prefix, rule) in &config.proxy {
        out.push_str(&format!(
            "proxy {prefix} -> {} change_origin={}\n",
            rule.target,
            if rule.change_origin { "yes" } else { "no" }
        ));
    }
    out
}

fn short_hash(value: Option<&str>) -> &str {
    match value {
        Some(hash) if hash.len() > 7 => hash.get(..7).unwrap_or(hash),
        Some(hash) => hash,
        None => "-",
    }
}
