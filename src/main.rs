use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cmd;

#[derive(Parser)]
#[command(name = "reviewd")]
#[command(version, about = "Review-gated artifact lifecycle daemon")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository root (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the review daemon for a role
    Daemon {
        role: String,
        /// Run a single drain-and-process cycle, then exit
        #[arg(long)]
        once: bool,
        /// Poll interval in seconds. Overrides workflow.toml.
        #[arg(long)]
        interval: Option<u64>,
        /// Reviewer command. Overrides workflow.toml and REVIEWER_CMD.
        #[arg(long)]
        reviewer_cmd: Option<String>,
        /// Reviewer timeout in seconds. Overrides workflow.toml.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Ask a running daemon to stop after its current message
    Stop {
        role: String,
        /// Wait until the daemon has exited
        #[arg(long)]
        wait: bool,
    },
    /// Show daemon liveness and mailbox backlog
    Status { role: Option<String> },
    /// Deliver a message to a role's mailbox
    Send {
        /// Recipient role
        #[arg(long)]
        to: String,
        /// Referenced artifact path or pattern
        #[arg(long)]
        artifact: String,
        #[arg(long, default_value = "review-request")]
        event: String,
        /// Sender role (receives the response)
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        /// Free-text context for the reviewer
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        session: Option<String>,
        /// Message body
        #[arg(long)]
        body: Option<String>,
    },
    /// List messages in a role's mailbox
    List {
        role: String,
        /// Filter by event type
        #[arg(long)]
        event: Option<String>,
        /// Filter by artifact substring
        #[arg(long)]
        artifact: Option<String>,
        /// Filter by sender role
        #[arg(long)]
        from: Option<String>,
        /// Only messages not yet processed
        #[arg(long)]
        unprocessed: bool,
        /// Only messages newer than this (e.g. 7d, 24h, 2025-11-01)
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one message with its body
    Read {
        role: String,
        /// File identity or Message-ID
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show a conversation: a message, its replies and its session
    Thread {
        role: String,
        /// Message identity, Message-ID or session id
        key: String,
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default workflow.toml file
    Init,
}

/// Install the tracing subscriber: stderr always, plus a daily log file when
/// `log_file` is given. The returned guard must live until exit.
fn init_logging(verbose: bool, log_file: Option<(&Path, String)>) -> Option<WorkerGuard> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_file {
        Some((dir, name)) => {
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo_dir = match cli.repo_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only daemons log to a file; skip it if the log directory can't be made.
    let log_file = match &cli.command {
        Commands::Daemon { role, .. } => {
            let dir = repo_dir.join(".workflow").join("logs");
            std::fs::create_dir_all(&dir)
                .ok()
                .map(|_| (dir, format!("{}.log", role)))
        }
        _ => None,
    };
    let _log_guard = init_logging(
        cli.verbose,
        log_file.as_ref().map(|(dir, name)| (dir.as_path(), name.clone())),
    );

    match &cli.command {
        Commands::Daemon {
            role,
            once,
            interval,
            reviewer_cmd,
            timeout,
        } => {
            let overrides = cmd::DaemonOverrides {
                interval: *interval,
                reviewer_cmd: reviewer_cmd.clone(),
                timeout: *timeout,
            };
            cmd::cmd_daemon(&repo_dir, cli.verbose, role, *once, overrides).await?;
        }
        Commands::Stop { role, wait } => cmd::cmd_stop(&repo_dir, role, *wait).await?,
        Commands::Status { role } => cmd::cmd_status(&repo_dir, role.as_deref())?,
        Commands::Send {
            to,
            artifact,
            event,
            from,
            subject,
            context,
            session,
            body,
        } => {
            let request = cmd::SendRequest {
                to,
                artifact,
                event,
                from: from.as_deref(),
                subject: subject.as_deref(),
                context: context.as_deref(),
                session: session.as_deref(),
                body: body.as_deref(),
            };
            cmd::cmd_send(&repo_dir, &request)?;
        }
        Commands::List {
            role,
            event,
            artifact,
            from,
            unprocessed,
            since,
            limit,
            json,
        } => {
            let filter = cmd::build_list_filter(
                event.as_deref(),
                artifact.clone(),
                from.clone(),
                *unprocessed,
                since.as_deref(),
                *limit,
            )?;
            cmd::cmd_list(&repo_dir, role, &filter, *json)?;
        }
        Commands::Read { role, id, json } => cmd::cmd_read(&repo_dir, role, id, *json)?,
        Commands::Thread { role, key, json } => cmd::cmd_thread(&repo_dir, role, key, *json)?,
        Commands::Config { command } => cmd::cmd_config(&repo_dir, command.clone())?,
    }

    Ok(())
}
