use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::workflow_config::WorkflowToml;

/// Environment variable that relocates the mailbox root.
pub const MAILDIR_ENV: &str = "WORKFLOW_MAILDIR";

/// Runtime configuration for the review engine.
///
/// This struct bridges `WorkflowToml` with the runtime needs of the daemon
/// and the CLI. It resolves every directory against the canonical
/// repository root.
#[derive(Debug, Clone)]
pub struct Config {
    pub repo_root: PathBuf,
    pub workflow_dir: PathBuf,
    pub mailbox_root: PathBuf,
    pub reviews_dir: PathBuf,
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    workflow: WorkflowToml,
}

impl Config {
    /// Load the configuration for the repository at `repo_root`.
    pub fn new(repo_root: PathBuf, verbose: bool) -> Result<Self> {
        let repo_root = repo_root
            .canonicalize()
            .context("Failed to resolve repository root")?;
        let workflow_dir = repo_root.join(".workflow");
        let workflow = WorkflowToml::load_or_default(&workflow_dir)?;
        Ok(Self::with_workflow(
            repo_root,
            workflow,
            std::env::var(MAILDIR_ENV).ok(),
            verbose,
        ))
    }

    /// Build from an already-loaded workflow file. `maildir_override` takes
    /// precedence over `project.mailbox_dir`.
    pub fn with_workflow(
        repo_root: PathBuf,
        workflow: WorkflowToml,
        maildir_override: Option<String>,
        verbose: bool,
    ) -> Self {
        let workflow_dir = repo_root.join(".workflow");
        let mailbox_root = match maildir_override.filter(|v| !v.trim().is_empty()) {
            Some(raw) => resolve_against(&repo_root, &expand_home(&raw)),
            None => match workflow.project.mailbox_dir {
                Some(ref dir) => {
                    resolve_against(&repo_root, &expand_home(&dir.to_string_lossy()))
                }
                None => repo_root.join("mailbox"),
            },
        };
        let reviews_dir = resolve_against(&repo_root, &workflow.project.reviews_dir);

        Self {
            run_dir: workflow_dir.join("run"),
            log_dir: workflow_dir.join("logs"),
            workflow_dir,
            mailbox_root,
            reviews_dir,
            repo_root,
            verbose,
            workflow,
        }
    }

    pub fn workflow(&self) -> &WorkflowToml {
        &self.workflow
    }

    /// Mutable access for command-line overrides.
    pub fn workflow_mut(&mut self) -> &mut WorkflowToml {
        &mut self.workflow
    }

    pub fn config_file(&self) -> PathBuf {
        self.workflow_dir.join("workflow.toml")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.run_dir).context("Failed to create run directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.mailbox_root)
            .context("Failed to create mailbox directory")?;
        Ok(())
    }

    /// Liveness record for a role daemon.
    pub fn pid_file(&self, role: &str) -> PathBuf {
        self.run_dir.join(format!("{}.pid", role))
    }

    /// Stop-request file for a role daemon.
    pub fn stop_file(&self, role: &str) -> PathBuf {
        self.run_dir.join(format!("{}.stop", role))
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

fn resolve_against(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
