//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use cluster_warden::core::config::Config;
use cluster_warden::core::errors::WardenError;
use cluster_warden::daemon::ingest::{ReplaySummary, replay_file};
use cluster_warden::daemon::loop_main::{DaemonStats, RemediationDaemon};
use cluster_warden::engine::RemediationEngine;
use cluster_warden::model::history::Outcome;
use cluster_warden::store::escalation::{EscalationRow, EscalationStore, SqliteEscalationStore};

/// Cluster Warden: escalating remediation of Kubernetes policy violations.
#[derive(Debug, Parser)]
#[command(
    name = "cwarden",
    author,
    version,
    about = "Cluster Warden - Policy Violation Remediation",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Read configuration from PATH instead of the default location.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Emit one JSON object per command on stdout.
    #[arg(long, global = true)]
    json: bool,
    /// Debug-level diagnostics on stderr.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Only warnings and errors on stderr.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the ingestion and decision loop until SIGINT/SIGTERM.
    Daemon(DaemonArgs),
    /// Process one file of observations once and print what was decided.
    Replay(ReplayArgs),
    /// List live escalation rows.
    History(HistoryArgs),
    /// Delete expired escalation rows.
    Prune,
    /// View and check configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DaemonArgs {
    /// Partition to read (repeatable); replaces `ingest.partitions`.
    #[arg(long = "partition", value_name = "PATH")]
    partitions: Vec<PathBuf>,
    /// Keep polling partitions for appended observations.
    #[arg(long)]
    follow: bool,
    /// Decide and log only; no state, audit, notification or action.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args)]
struct ReplayArgs {
    /// File with one JSON observation per line.
    #[arg(value_name = "FILE")]
    file: PathBuf,
    /// Decide and log only; no state, audit, notification or action.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct HistoryArgs {
    /// Only rows in this namespace.
    #[arg(long, value_name = "NS")]
    namespace: Option<String>,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Defaults to `path`.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file location and whether it exists.
    Path,
    /// Print the effective configuration (file, env overrides, defaults).
    Show,
    /// Load and validate; exit 1 when invalid.
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// Command failure, mapped onto the process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// 1 for user errors, 2 for runtime and IO, 3 when output cannot be encoded.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<WardenError> for CliError {
    fn from(error: WardenError) -> Self {
        match error {
            WardenError::InvalidConfig { .. }
            | WardenError::MissingConfig { .. }
            | WardenError::ConfigParse { .. } => Self::User(error.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    init_tracing(cli);

    match &cli.command {
        Command::Daemon(args) => run_daemon(cli, args),
        Command::Replay(args) => run_replay(cli, args),
        Command::History(args) => run_history(cli, args),
        Command::Prune => run_prune(cli),
        Command::Config(args) => run_config(cli, args),
    }
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

// ──────────────────── daemon ────────────────────

fn run_daemon(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    if !args.partitions.is_empty() {
        config.ingest.partitions.clone_from(&args.partitions);
    }
    config.ingest.follow |= args.follow;
    config.engine.dry_run |= args.dry_run;
    config.check()?;

    let stats = RemediationDaemon::init(config)?.run()?;
    match output_mode(cli) {
        OutputMode::Human => print_daemon_stats_human(&stats),
        OutputMode::Json => write_json_line(&json!({
            "command": "daemon",
            "stats": serde_json::to_value(&stats)?,
        }))?,
    }
    Ok(())
}

fn print_daemon_stats_human(stats: &DaemonStats) {
    println!("Daemon stopped.");
    println!("  Observations: {}", stats.observations);
    println!("  Processed:    {}", stats.processed);
    println!("  Rejected:     {}", stats.rejected);
    println!("  Failed:       {}", stats.failed);
    println!("  Retries:      {}", stats.retries);
    if stats.pruned > 0 {
        println!("  Pruned rows:  {}", stats.pruned);
    }
}

// ──────────────────── replay ────────────────────

fn run_replay(cli: &Cli, args: &ReplayArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    config.engine.dry_run |= args.dry_run;

    let engine = RemediationEngine::from_config(&config)?;
    let summary = replay_file(&engine, &args.file, &config.engine.cluster_name)?;

    match output_mode(cli) {
        OutputMode::Human => print_replay_human(&summary, engine.is_dry_run()),
        OutputMode::Json => write_json_line(&json!({
            "command": "replay",
            "dry_run": engine.is_dry_run(),
            "summary": serde_json::to_value(&summary)?,
        }))?,
    }
    Ok(())
}

fn print_replay_human(summary: &ReplaySummary, dry_run: bool) {
    let mode = if dry_run { " (dry run)" } else { "" };
    println!(
        "Replayed {} line(s) from {}{mode}",
        summary.lines,
        summary.file.display()
    );
    for observed in &summary.observations {
        for violation in &observed.report.violations {
            let recorded: Vec<&str> = violation.recorded.iter().map(|o| o.as_str()).collect();
            println!(
                "  line {:>4}: {} -> {} [{}]",
                observed.line,
                violation.fingerprint,
                violation.verdict,
                recorded.join(", ")
            );
        }
    }
    for error in &summary.errors {
        println!("  line {:>4}: {} {}", error.line, error.code, error.message);
    }
}

// ──────────────────── history / prune ────────────────────

fn open_store(config: &Config) -> Result<Option<SqliteEscalationStore>, CliError> {
    if !config.paths.state_db.exists() {
        return Ok(None);
    }
    let store =
        SqliteEscalationStore::open(&config.paths.state_db, config.engine.violation_expiry())?;
    Ok(Some(store))
}

fn run_history(cli: &Cli, args: &HistoryArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let rows = match open_store(&config)? {
        Some(store) => store.live_rows(args.namespace.as_deref(), Utc::now())?,
        None => Vec::new(),
    };

    match output_mode(cli) {
        OutputMode::Human => {
            if rows.is_empty() {
                println!("No live escalation rows.");
            }
            for row in &rows {
                print_row_human(row);
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "history",
            "namespace": args.namespace,
            "rows": serde_json::to_value(&rows)?,
        }))?,
    }
    Ok(())
}

fn print_row_human(row: &EscalationRow) {
    let last = row
        .history
        .last(Outcome::Notify)
        .map_or_else(|| "-".to_string(), |at| at.to_rfc3339());
    println!(
        "{}  notify={} action={} last_notify={} expires={}",
        row.fingerprint,
        row.history.notify_count(),
        row.history.count(Outcome::EntityAction),
        last,
        row.expire_at.to_rfc3339()
    );
}

fn run_prune(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let removed = match open_store(&config)? {
        Some(store) => store.prune_expired(Utc::now())?,
        None => 0,
    };

    match output_mode(cli) {
        OutputMode::Human => println!("Pruned {removed} expired escalation row(s)."),
        OutputMode::Json => write_json_line(&json!({
            "command": "prune",
            "removed": removed,
        }))?,
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    }))?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        }))?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        write_json_line(&json!({
                            "command": "config validate",
                            "valid": false,
                            "code": e.code(),
                            "error": e.to_string(),
                        }))?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CWARDEN_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
