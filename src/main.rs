use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Gmail,
    JsonArchive,
}

#[derive(Debug, Parser)]
#[command(name = "mailmind", version, about = "Incremental mailbox analytics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// SQLite database path
    #[arg(long, global = true, env = "MAILMIND_DB")]
    db: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage mailboxes
    Mailboxes {
        #[command(subcommand)]
        command: MailboxCommands,
    },
    /// Analyze a date range, fetching only what is not yet covered
    Analyze(AnalyzeArgs),
    /// Show the unprocessed gaps of a date range
    Gaps(WindowArgs),
    /// Show processed intervals of a mailbox
    Coverage {
        #[arg(long)]
        mailbox: String,
    },
    /// Inspect and control analysis runs
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Show database stats
    Stats,
    /// Run MCP status server over stdio
    Mcp,
}

#[derive(Debug, Args)]
struct WindowArgs {
    #[arg(long)]
    mailbox: String,
    /// First day included (YYYY-MM-DD, UTC)
    #[arg(long)]
    since: String,
    /// First day excluded (YYYY-MM-DD, UTC)
    #[arg(long)]
    until: String,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[command(flatten)]
    window: WindowArgs,
    /// Reprocess the whole window even where already covered
    #[arg(long, default_value_t = false)]
    force: bool,
    #[arg(long, default_value_t = 31)]
    fetch_chunk_days: i64,
}

#[derive(Debug, Subcommand)]
enum MailboxCommands {
    /// List configured mailboxes
    List,
    /// Add or update a mailbox
    Add {
        email: String,
        #[arg(long, value_enum)]
        provider: ProviderArg,
        /// Archive file or directory for json-archive mailboxes
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a mailbox with its messages, runs and coverage
    Remove { mailbox_id: String },
    /// Re-enable a mailbox, e.g. after fixing credentials
    Activate { mailbox_id: String },
    Deactivate { mailbox_id: String },
}

#[derive(Debug, Subcommand)]
enum RunCommands {
    /// List runs, newest first
    List {
        #[arg(long)]
        mailbox: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one run
    Show { run_id: String },
    /// Request cancellation of a pending or processing run
    Cancel { run_id: String },
    /// Fail runs stuck in processing and clean up after them
    Reap {
        #[arg(long, default_value_t = 5)]
        older_than_minutes: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::path::{Path, PathBuf};

    use anyhow::{anyhow, Context, Result};
    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
    use serde_json::json;
    use tracing::warn;

    use mailmind::analyzer::KeywordAnalyzer;
    use mailmind::connectors::ProviderConnectors;
    use mailmind::coverage::{CoverageTracker, Span};
    use mailmind::crypto::PayloadKeys;
    use mailmind::db::models::{Mailbox, Provider, RunStatus};
    use mailmind::db::Database;
    use mailmind::output::{self, GapReport, OutputFormat};
    use mailmind::pipeline::{execute_run, reap_stale_runs, validate_request, PipelineOptions};

    use super::{
        AnalyzeArgs, Cli, Commands, MailboxCommands, ProviderArg, RunCommands, WindowArgs,
    };

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let db_path = match cli.db {
            Some(path) => path,
            None => Database::default_db_path().context("resolve default mailmind database path")?,
        };
        let format = OutputFormat::from_json_flag(cli.json);

        match cli.command {
            Commands::Mailboxes { command } => handle_mailboxes(&db_path, command, format),
            Commands::Analyze(args) => handle_analyze(&db_path, args, format).await,
            Commands::Gaps(args) => handle_gaps(&db_path, args, format),
            Commands::Coverage { mailbox } => handle_coverage(&db_path, &mailbox, format),
            Commands::Runs { command } => handle_runs(&db_path, command, format),
            Commands::Stats => handle_stats(&db_path, format),
            Commands::Mcp => handle_mcp(&db_path),
        }
    }

    fn open_db(db_path: &Path) -> Result<Database> {
        Database::open(db_path)
            .with_context(|| format!("open mailmind database at {}", db_path.display()))
    }

    fn handle_mailboxes(db_path: &Path, command: MailboxCommands, format: OutputFormat) -> Result<()> {
        let db = open_db(db_path)?;

        match command {
            MailboxCommands::List => {
                let mailboxes = db.list_mailboxes()?;
                println!("{}", output::format_mailboxes(format, &mailboxes)?);
            }
            MailboxCommands::Add {
                email,
                provider,
                path,
                name,
            } => {
                let provider = match provider {
                    ProviderArg::Gmail => Provider::Gmail,
                    ProviderArg::JsonArchive => Provider::JsonArchive,
                };
                if provider == Provider::JsonArchive && path.is_none() {
                    return Err(anyhow!("json-archive mailboxes need --path"));
                }
                let config = path.map(|path| json!({ "path": path.display().to_string() }));
                let mailbox = Mailbox {
                    mailbox_id: email.trim().to_ascii_lowercase(),
                    email_address: email,
                    provider,
                    display_name: name,
                    is_active: true,
                    created_at: None,
                    config,
                };
                db.insert_mailbox(&mailbox)?;
                println!("Added mailbox: {}", mailbox.mailbox_id);
            }
            MailboxCommands::Remove { mailbox_id } => {
                if db.remove_mailbox(&mailbox_id)? == 0 {
                    println!("No mailbox found: {mailbox_id}");
                } else {
                    println!("Removed mailbox: {mailbox_id}");
                }
            }
            MailboxCommands::Activate { mailbox_id } => {
                set_active(&db, &mailbox_id, true)?;
            }
            MailboxCommands::Deactivate { mailbox_id } => {
                set_active(&db, &mailbox_id, false)?;
            }
        }
        Ok(())
    }

    fn set_active(db: &Database, mailbox_id: &str, active: bool) -> Result<()> {
        if !db.set_mailbox_active(mailbox_id, active)? {
            return Err(anyhow!("mailbox not found: {mailbox_id}"));
        }
        let state = if active { "Activated" } else { "Deactivated" };
        println!("{state} mailbox: {mailbox_id}");
        Ok(())
    }

    /// Runs in the foreground; Ctrl-C requests cancellation through a second
    /// connection and the pipeline stops at its next checkpoint.
    async fn handle_analyze(db_path: &Path, args: AnalyzeArgs, format: OutputFormat) -> Result<()> {
        let db = open_db(db_path)?;
        let window = parse_window(&args.window)?;
        validate_request(&db, &args.window.mailbox, window.start, window.end)?;

        let keys = PayloadKeys::from_env().context("load payload encryption key")?;
        let options = PipelineOptions {
            fetch_chunk_days: args.fetch_chunk_days,
            force: args.force,
            ..PipelineOptions::default()
        };

        let run = db.create_run(&args.window.mailbox, window.start, window.end, args.force)?;
        eprintln!("Run {} started (Ctrl-C to cancel)", run.run_id);

        let watcher = spawn_cancel_watcher(db_path.to_path_buf(), run.run_id.clone());
        let finished = execute_run(
            &db,
            &run.run_id,
            &ProviderConnectors,
            &KeywordAnalyzer,
            &keys,
            options,
        )
        .await;
        watcher.abort();

        let finished = finished.with_context(|| format!("record result of run {}", run.run_id))?;
        println!("{}", output::format_run(format, &finished)?);
        if finished.status == RunStatus::Failed {
            return Err(anyhow!(
                "run {} failed: {}",
                finished.run_id,
                finished.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
        Ok(())
    }

    fn spawn_cancel_watcher(db_path: PathBuf, run_id: String) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match Database::open(&db_path).and_then(|db| db.request_cancel(&run_id)) {
                Ok(_) => eprintln!("Cancellation requested; stopping at the next checkpoint"),
                Err(error) => warn!(run_id = %run_id, "could not cancel run: {error}"),
            }
        })
    }

    fn handle_gaps(db_path: &Path, args: WindowArgs, format: OutputFormat) -> Result<()> {
        let db = open_db(db_path)?;
        let window = parse_window(&args)?;
        let tracker = CoverageTracker::new(&db, args.mailbox.clone());
        let report = GapReport {
            gaps: tracker.gaps(window.start, window.end)?,
            fully_covered: tracker.is_fully_covered(window.start, window.end)?,
            mailbox_id: args.mailbox,
            window,
        };
        println!("{}", output::format_gaps(format, &report)?);
        Ok(())
    }

    fn handle_coverage(db_path: &Path, mailbox_id: &str, format: OutputFormat) -> Result<()> {
        let db = open_db(db_path)?;
        let intervals = CoverageTracker::new(&db, mailbox_id).intervals()?;
        println!("{}", output::format_coverage(format, &intervals)?);
        Ok(())
    }

    fn handle_runs(db_path: &Path, command: RunCommands, format: OutputFormat) -> Result<()> {
        let db = open_db(db_path)?;

        match command {
            RunCommands::List { mailbox, limit } => {
                let runs = db.list_runs(mailbox.as_deref(), limit)?;
                println!("{}", output::format_runs(format, &runs)?);
            }
            RunCommands::Show { run_id } => {
                let run = db
                    .get_run(&run_id)?
                    .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
                println!("{}", output::format_run(format, &run)?);
            }
            RunCommands::Cancel { run_id } => {
                let run = db.request_cancel(&run_id)?;
                println!("{}", output::format_run(format, &run)?);
            }
            RunCommands::Reap { older_than_minutes } => {
                if older_than_minutes <= 0 {
                    return Err(anyhow!("--older-than-minutes must be positive"));
                }
                let reaped = reap_stale_runs(&db, chrono::Duration::minutes(older_than_minutes))?;
                println!("{}", output::format_runs(format, &reaped)?);
            }
        }
        Ok(())
    }

    fn handle_stats(db_path: &Path, format: OutputFormat) -> Result<()> {
        let db = open_db(db_path)?;
        let stats = db.get_stats()?;
        println!("{}", output::format_stats(format, &stats)?);
        Ok(())
    }

    fn handle_mcp(db_path: &Path) -> Result<()> {
        let db = open_db(db_path)?;
        mailmind::mcp::run_stdio_server(&db)
    }

    fn parse_window(args: &WindowArgs) -> Result<Span> {
        let since = parse_date_arg("since", &args.since)?;
        let until = parse_date_arg("until", &args.until)?;
        Span::new(since, until).ok_or_else(|| {
            anyhow!(
                "--since {} must be before --until {}",
                args.since,
                args.until
            )
        })
    }

    fn parse_date_arg(label: &str, raw: &str) -> Result<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid --{label} date '{raw}', expected YYYY-MM-DD"))?;
        Ok(date.and_time(NaiveTime::MIN).and_utc())
    }
}
