//! Daemon lifecycle commands: `reviewd daemon`, `stop`, `status`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use reviewd::config::Config;
use reviewd::daemon::{Daemon, DaemonHandle, read_live};
use reviewd::errors::DaemonError;
use reviewd::mailbox::{ListFilter, Mailbox};

/// Command-line settings layered over workflow.toml.
#[derive(Debug, Default)]
pub struct DaemonOverrides {
    pub interval: Option<u64>,
    pub reviewer_cmd: Option<String>,
    pub timeout: Option<u64>,
}

pub async fn cmd_daemon(
    repo_dir: &Path,
    verbose: bool,
    role: &str,
    once: bool,
    overrides: DaemonOverrides,
) -> Result<()> {
    let mut config = Config::new(repo_dir.to_path_buf(), verbose)?;
    config.ensure_directories()?;

    {
        let workflow = config.workflow_mut();
        if let Some(secs) = overrides.interval {
            workflow.defaults.poll_interval_secs = secs;
        }
        if let Some(role_config) = workflow.roles.get_mut(role) {
            if overrides.reviewer_cmd.is_some() {
                role_config.reviewer_cmd = overrides.reviewer_cmd;
            }
            if overrides.timeout.is_some() {
                role_config.timeout_secs = overrides.timeout;
            }
        }
        for warning in workflow.validate() {
            tracing::warn!(%warning, "configuration warning");
        }
    }

    let daemon = Daemon::new(config, role)?;

    if once {
        let report = daemon.run_once().await?;
        println!(
            "{} drained={} approved={} rejected={} violations={} retried={} failed={} skipped={}",
            style("Cycle complete:").bold(),
            report.drained,
            report.approved,
            report.rejected,
            report.violations,
            report.retried,
            report.failed,
            report.skipped
        );
        return Ok(());
    }

    let handle = daemon.handle();
    tokio::spawn(async move {
        if let Err(e) = watch_signals(handle).await {
            tracing::warn!(error = %e, "signal handling unavailable");
        }
    });

    daemon.run().await.map_err(|e| match e {
        DaemonError::Other(inner) => inner,
        other => anyhow::Error::new(other),
    })
}

/// First SIGINT/SIGTERM asks the daemon to stop after the in-flight review;
/// a second one exits at once.
async fn watch_signals(handle: DaemonHandle) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut received = 0u32;
    loop {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        received += 1;
        if received == 1 {
            info!(signal = name, "shutdown requested, finishing in-flight review");
            handle.stop();
        } else {
            tracing::warn!(signal = name, "second signal, exiting immediately");
            std::process::exit(130);
        }
    }
}

pub async fn cmd_stop(repo_dir: &Path, role: &str, wait: bool) -> Result<()> {
    let config = Config::new(repo_dir.to_path_buf(), false)?;
    let pid_file = config.pid_file(role);

    let Some(record) = read_live(&pid_file) else {
        println!("{} daemon is not running", role);
        return Ok(());
    };

    std::fs::create_dir_all(&config.run_dir).context("Failed to create run directory")?;
    std::fs::write(config.stop_file(role), record.pid.to_string())
        .context("Failed to write stop request")?;
    println!("Stop requested for {} (pid {})", role, record.pid);

    if wait {
        // The daemon finishes its in-flight review first, bounded by the reviewer timeout.
        let deadline = Duration::from_secs(config.workflow().timeout_secs(role) + 5);
        let started = std::time::Instant::now();
        while read_live(&pid_file).is_some() {
            if started.elapsed() > deadline {
                anyhow::bail!("{} daemon did not stop within {}s", role, deadline.as_secs());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        println!("{} daemon stopped", role);
    }
    Ok(())
}

pub fn cmd_status(repo_dir: &Path, role: Option<&str>) -> Result<()> {
    let config = Config::new(repo_dir.to_path_buf(), false)?;
    let roles: Vec<String> = match role {
        Some(r) => vec![r.to_string()],
        None => config.workflow().roles.keys().cloned().collect(),
    };

    println!();
    println!(
        "{:<26} {:<10} {:<8} {:<8} Since",
        "Role", "State", "Pid", "Pending"
    );
    println!(
        "{:<26} {:<10} {:<8} {:<8} -----",
        "--------------------------", "-----", "---", "-------"
    );

    for role in roles {
        let pending = Mailbox::new(&config.mailbox_root, &role)
            .list(&ListFilter {
                processed: Some(false),
                ..Default::default()
            })
            .map(|rows| rows.len())
            .unwrap_or(0);

        match read_live(&config.pid_file(&role)) {
            Some(record) => println!(
                "{:<26} {:<10} {:<8} {:<8} {}",
                role,
                style("running").green(),
                record.pid,
                pending,
                record.started_at.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!(
                "{:<26} {:<10} {:<8} {:<8} -",
                role,
                style("stopped").dim(),
                "-",
                pending
            ),
        }
    }
    println!();
    Ok(())
}
