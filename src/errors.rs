//! Typed error hierarchy for the review engine.
//!
//! Two top-level enums split failures by blast radius:
//! - `ReviewError`: scoped to one review attempt (one message); never stops the daemon
//! - `DaemonError`: daemon-level failures that stop the process with a diagnostic

use std::path::PathBuf;
use thiserror::Error;

/// Why an external reviewer invocation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationFailure {
    /// The reviewer did not finish within the wall-clock budget and was killed.
    Timeout { secs: u64 },
    /// The reviewer finished but reported failure.
    NonZeroExit { code: i32 },
    /// The reviewer process could not be started or waited on.
    Spawn { message: String },
}

impl std::fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationFailure::Timeout { secs } => write!(f, "timeout after {}s", secs),
            InvocationFailure::NonZeroExit { code } => write!(f, "non-zero exit ({})", code),
            InvocationFailure::Spawn { message } => write!(f, "spawn failed: {}", message),
        }
    }
}

/// Errors scoped to a single review attempt.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Artifact not found: {path}")]
    ArtifactNotFound { path: PathBuf },

    #[error("Corrupt mailbox message {message_id}: {reason}")]
    MailboxCorruption { message_id: String, reason: String },

    #[error("Reviewer invocation failed: {reason}")]
    ExternalInvocation {
        reason: InvocationFailure,
        /// Captured stderr, attached as diagnostic detail.
        stderr: String,
    },

    #[error("Ambiguous reviewer decision: {0}")]
    DecisionParse(String),

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReviewError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReviewError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the triggering message should stay unprocessed so the next
    /// poll cycle retries it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReviewError::ExternalInvocation { .. } | ReviewError::MailboxCorruption { .. }
        )
    }
}

impl From<git2::Error> for ReviewError {
    fn from(err: git2::Error) -> Self {
        ReviewError::GitOperation(err.message().to_string())
    }
}

/// Errors that stop a role daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Daemon for role '{role}' is already running (pid {pid})")]
    AlreadyRunning { role: String, pid: u32 },

    #[error("Failed to write liveness record at {path}: {source}")]
    Liveness {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot access mailbox root {path}: {source}")]
    MailboxRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Role '{0}' is not configured")]
    UnknownRole(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_timeout_is_retryable() {
        let err = ReviewError::ExternalInvocation {
            reason: InvocationFailure::Timeout { secs: 2 },
            stderr: String::new(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn non_zero_exit_carries_code_and_stderr() {
        let err = ReviewError::ExternalInvocation {
            reason: InvocationFailure::NonZeroExit { code: 3 },
            stderr: "model unavailable".to_string(),
        };
        match &err {
            ReviewError::ExternalInvocation { reason, stderr } => {
                assert_eq!(reason, &InvocationFailure::NonZeroExit { code: 3 });
                assert_eq!(stderr, "model unavailable");
            }
            _ => panic!("Expected ExternalInvocation"),
        }
        assert!(err.to_string().contains("non-zero exit (3)"));
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        let missing = ReviewError::ArtifactNotFound {
            path: PathBuf::from("specs/proposed/gone.md"),
        };
        assert!(!missing.is_retryable());
        assert!(!ReviewError::Configuration("no schema".into()).is_retryable());
        assert!(!ReviewError::GitOperation("index locked".into()).is_retryable());
    }

    #[test]
    fn git2_errors_become_git_operation() {
        let err: ReviewError = git2::Error::from_str("bad ref").into();
        match err {
            ReviewError::GitOperation(msg) => assert_eq!(msg, "bad ref"),
            _ => panic!("Expected GitOperation"),
        }
    }

    #[test]
    fn daemon_already_running_names_role_and_pid() {
        let err = DaemonError::AlreadyRunning {
            role: "spec-reviewer".into(),
            pid: 4242,
        };
        let msg = err.to_string();
        assert!(msg.contains("spec-reviewer"));
        assert!(msg.contains("4242"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ReviewError::DecisionParse("both markers".into()));
        assert_std_error(&DaemonError::UnknownRole("ghost".into()));
    }
}
