//! External reviewer execution.
//!
//! The reviewer is a black box: it receives the context bundle on stdin and
//! writes its review to stdout. Every call is one bounded attempt; retrying is
//! left to the daemon.

use crate::context::ContextBundle;
use crate::errors::{InvocationFailure, ReviewError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Captured result of a successful reviewer run.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Runs a reviewer over a context bundle.
#[async_trait]
pub trait ReviewerInvoker: Send + Sync {
    async fn invoke(
        &self,
        bundle: &ContextBundle,
        timeout: Duration,
    ) -> Result<InvocationOutput, ReviewError>;
}

/// Runs a shell command in the repository root with the bundle on stdin.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    command: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl CommandInvoker {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
            env: Vec::new(),
        }
    }

    /// Extra environment variable for the reviewer process.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl ReviewerInvoker for CommandInvoker {
    async fn invoke(
        &self,
        bundle: &ContextBundle,
        limit: Duration,
    ) -> Result<InvocationOutput, ReviewError> {
        let spawn_failed = |message: String| ReviewError::ExternalInvocation {
            reason: InvocationFailure::Spawn { message },
            stderr: String::new(),
        };

        debug!(command = %self.command, timeout_secs = limit.as_secs(), "invoking reviewer");
        let started = Instant::now();

        // Use shell to handle pipelines and arguments in the configured command
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(|e| spawn_failed(format!("{}: {}", self.command, e)))?;
        let pgid = child.id();

        // A reviewer that never reads stdin must not stall the wait below.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = bundle.text.clone().into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await
                    && e.kind() != std::io::ErrorKind::BrokenPipe
                {
                    warn!(error = %e, "failed to write context to reviewer stdin");
                }
            });
        }

        // The reviewer leads its own process group; on timeout the whole group goes.
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| spawn_failed(format!("wait failed: {}", e)))?,
            Err(_) => {
                if let Some(pgid) = pgid {
                    kill_process_group(pgid);
                }
                warn!(command = %self.command, timeout_secs = limit.as_secs(), "reviewer timed out, killed");
                return Err(ReviewError::ExternalInvocation {
                    reason: InvocationFailure::Timeout {
                        secs: limit.as_secs(),
                    },
                    stderr: String::new(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let duration = started.elapsed();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            debug!(code, stderr = %stderr.trim(), "reviewer exited with failure");
            return Err(ReviewError::ExternalInvocation {
                reason: InvocationFailure::NonZeroExit { code },
                stderr,
            });
        }

        debug!(elapsed_ms = duration.as_millis() as u64, bytes = stdout.len(), "reviewer finished");
        Ok(InvocationOutput {
            stdout,
            stderr,
            duration,
        })
    }
}

fn kill_process_group(pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "reviewer process group already gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBundle;
    use std::fs;
    use tempfile::tempdir;

    fn bundle(text: &str) -> ContextBundle {
        ContextBundle {
            sections: Vec::new(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let dir = tempdir().unwrap();
        let invoker = CommandInvoker::new("echo 'Status: APPROVED'", dir.path());
        let out = invoker
            .invoke(&bundle("ctx"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "Status: APPROVED");
    }

    #[tokio::test]
    async fn test_bundle_arrives_on_stdin() {
        let dir = tempdir().unwrap();
        let invoker = CommandInvoker::new("cat > received.txt; echo done", dir.path());
        invoker
            .invoke(&bundle("## Artifact\nhello"), Duration::from_secs(10))
            .await
            .unwrap();
        let received = fs::read_to_string(dir.path().join("received.txt")).unwrap();
        assert_eq!(received, "## Artifact\nhello");
    }

    #[tokio::test]
    async fn test_runs_in_working_dir_with_env() {
        let dir = tempdir().unwrap();
        let invoker = CommandInvoker::new("pwd; echo \"$REVIEWD_ROLE\"", dir.path())
            .with_env("REVIEWD_ROLE", "spec-reviewer");
        let out = invoker
            .invoke(&bundle(""), Duration::from_secs(10))
            .await
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.stdout.contains(&*canonical.to_string_lossy()));
        assert!(out.stdout.contains("spec-reviewer"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let dir = tempdir().unwrap();
        let invoker = CommandInvoker::new("echo 'quota exceeded' >&2; exit 3", dir.path());
        let err = invoker
            .invoke(&bundle(""), Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            ReviewError::ExternalInvocation { reason, stderr } => {
                assert_eq!(reason, InvocationFailure::NonZeroExit { code: 3 });
                assert!(stderr.contains("quota exceeded"));
            }
            other => panic!("Expected ExternalInvocation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_reviewer() {
        let dir = tempdir().unwrap();
        let invoker = CommandInvoker::new("sleep 5", dir.path());
        let started = Instant::now();
        let err = invoker
            .invoke(&bundle(""), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(
            err,
            ReviewError::ExternalInvocation {
                reason: InvocationFailure::Timeout { secs: 1 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempdir().unwrap();
        let invoker = CommandInvoker::new("(sleep 2; touch survived) & sleep 10", dir.path());
        let err = invoker
            .invoke(&bundle(""), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReviewError::ExternalInvocation {
                reason: InvocationFailure::Timeout { .. },
                ..
            }
        ));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("survived").exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_foreground_subshell() {
        let dir = tempdir().unwrap();
        let invoker = CommandInvoker::new("(sleep 2; touch survived); true", dir.path());
        assert!(
            invoker
                .invoke(&bundle(""), Duration::from_secs(1))
                .await
                .is_err()
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("survived").exists());
    }

    #[tokio::test]
    async fn test_reviewer_ignoring_large_stdin_still_completes() {
        let dir = tempdir().unwrap();
        let invoker = CommandInvoker::new("echo APPROVED", dir.path());
        let big = "x".repeat(1 << 20);
        let out = invoker
            .invoke(&bundle(&big), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "APPROVED");
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_spawn_failure() {
        let invoker = CommandInvoker::new("true", "/nonexistent/reviewd/dir");
        let err = invoker
            .invoke(&bundle(""), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReviewError::ExternalInvocation {
                reason: InvocationFailure::Spawn { .. },
                ..
            }
        ));
    }
}
