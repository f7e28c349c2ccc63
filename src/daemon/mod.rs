//! Role daemon: poll the mailbox, review, gate, repeat.
//!
//! One daemon serves one role. Messages are handled strictly one at a time
//! in the order the mailbox yields them. Per-message failures are logged and
//! decide whether the message is retried; they never stop the loop.

pub mod liveness;

use crate::config::Config;
use crate::context::ContextBuilder;
use crate::decision::{self, Decision, Verdict};
use crate::errors::{DaemonError, ReviewError};
use crate::gatekeeper::{Gatekeeper, ReviewRecord, TransitionOutcome};
use crate::integrity::{IntegrityOutcome, TestIntegrityVerifier};
use crate::invoker::{CommandInvoker, ReviewerInvoker};
use crate::mailbox::{Mailbox, Message, StoredMessage, resolve_artifact};
use crate::store::{Artifact, ArtifactStore, FsArtifactStore};
use crate::workflow_config::RoleConfig;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use liveness::{LivenessGuard, LivenessRecord, read_live};

/// Shared stop/running flags for a daemon.
#[derive(Debug, Clone, Default)]
pub struct DaemonHandle {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl DaemonHandle {
    /// Ask the daemon to exit after the in-flight message.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Per-cycle tally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub drained: usize,
    pub approved: usize,
    pub rejected: usize,
    /// Rejected by the integrity check without a reviewer
    pub violations: usize,
    /// Left unprocessed for the next cycle
    pub retried: usize,
    /// Terminal errors; the message was marked processed
    pub failed: usize,
    /// Undecodable files
    pub skipped: usize,
}

impl CycleReport {
    pub fn handled(&self) -> usize {
        self.approved + self.rejected + self.violations + self.failed
    }
}

/// Result of one successfully handled review request.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub verdict: Verdict,
    pub violation: bool,
    pub transition: TransitionOutcome,
}

pub struct Daemon {
    config: Config,
    role: String,
    role_config: RoleConfig,
    invoker: Arc<dyn ReviewerInvoker>,
    store: Arc<dyn ArtifactStore>,
    poll_interval: Duration,
    handle: DaemonHandle,
}

impl Daemon {
    /// Build the daemon for `role` with the configured reviewer command.
    pub fn new(config: Config, role: &str) -> Result<Self, DaemonError> {
        let workflow = config.workflow();
        let role_config = workflow
            .roles
            .get(role)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownRole(role.to_string()))?;
        let invoker = CommandInvoker::new(workflow.reviewer_cmd(role), &config.repo_root)
            .with_env("REVIEWD_ROLE", role)
            .with_env("REVIEWD_KIND", &role_config.review_kind);
        let poll_interval = Duration::from_secs(workflow.defaults.poll_interval_secs);
        let store = FsArtifactStore::new(&config.repo_root);

        Ok(Self {
            role: role.to_string(),
            role_config,
            invoker: Arc::new(invoker),
            store: Arc::new(store),
            poll_interval,
            handle: DaemonHandle::default(),
            config,
        })
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn ReviewerInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    fn mailbox(&self) -> Mailbox {
        Mailbox::new(&self.config.mailbox_root, &self.role)
    }

    /// Run until stopped. Holds the liveness record for the whole run.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let _guard = self.start()?;
        info!(
            role = %self.role,
            kind = %self.role_config.review_kind,
            interval_secs = self.poll_interval.as_secs(),
            mailbox = %self.config.mailbox_root.display(),
            "daemon started"
        );

        let result = self.poll_loop().await;
        self.handle.running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => info!(role = %self.role, "daemon stopped"),
            Err(ref e) => error!(role = %self.role, error = %e, "daemon stopped on error"),
        }
        result
    }

    async fn poll_loop(&self) -> Result<(), DaemonError> {
        while !self.should_stop() {
            let report = self.run_cycle().await?;
            log_report(&self.role, &report);
            if self.should_stop() {
                break;
            }
            self.sleep_interruptibly().await;
        }
        Ok(())
    }

    /// One drain-and-process cycle under the liveness record.
    pub async fn run_once(&self) -> Result<CycleReport, DaemonError> {
        let _guard = self.start()?;
        let report = self.run_cycle().await;
        self.handle.running.store(false, Ordering::SeqCst);
        let report = report?;
        log_report(&self.role, &report);
        Ok(report)
    }

    fn start(&self) -> Result<LivenessGuard, DaemonError> {
        let guard = LivenessGuard::acquire(&self.config.pid_file(&self.role), &self.role)?;
        // A stop request left over from a previous run does not apply to this one.
        let _ = std::fs::remove_file(self.config.stop_file(&self.role));
        self.mailbox()
            .ensure_dirs()
            .map_err(|e| DaemonError::MailboxRoot {
                path: self.config.mailbox_root.clone(),
                source: match e {
                    ReviewError::Io { source, .. } => source,
                    other => std::io::Error::other(other.to_string()),
                },
            })?;
        self.handle.running.store(true, Ordering::SeqCst);
        Ok(guard)
    }

    fn should_stop(&self) -> bool {
        if self.handle.stop_requested() {
            return true;
        }
        let stop_file = self.config.stop_file(&self.role);
        if stop_file.exists() {
            info!(role = %self.role, "stop requested");
            let _ = std::fs::remove_file(&stop_file);
            self.handle.stop();
            return true;
        }
        false
    }

    /// Sleep the poll interval, waking at least once per second to check for a stop.
    async fn sleep_interruptibly(&self) {
        let tick = Duration::from_secs(1);
        let mut remaining = self.poll_interval;
        while !remaining.is_zero() {
            let step = remaining.min(tick);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
            if self.should_stop() {
                return;
            }
        }
    }

    /// Drain the mailbox and handle every unprocessed request once.
    pub async fn run_cycle(&self) -> Result<CycleReport, DaemonError> {
        let mailbox = self.mailbox();
        let mailbox_err = |e: ReviewError| DaemonError::MailboxRoot {
            path: mailbox.dir().to_path_buf(),
            source: match e {
                ReviewError::Io { source, .. } => source,
                other => std::io::Error::other(other.to_string()),
            },
        };

        let mut report = CycleReport {
            drained: mailbox.drain().map_err(mailbox_err)?.len(),
            ..Default::default()
        };
        let scan = mailbox
            .find_unprocessed(&self.role_config.event_types)
            .map_err(mailbox_err)?;

        for corrupt in &scan.corrupt {
            warn!(role = %self.role, error = %corrupt, "skipping corrupt message");
            report.skipped += 1;
        }

        for stored in &scan.messages {
            let id = stored.identity.as_str();
            match self.process(stored).await {
                Ok(outcome) => {
                    if outcome.violation {
                        report.violations += 1;
                    } else if outcome.verdict.is_approved() {
                        report.approved += 1;
                    } else {
                        report.rejected += 1;
                    }
                    self.respond(&stored.message, &outcome);
                    self.mark_processed(&mailbox, id);
                }
                Err(e) if e.is_retryable() => {
                    warn!(role = %self.role, message_id = id, error = %e, "review attempt failed, will retry");
                    report.retried += 1;
                }
                Err(e) => {
                    error!(role = %self.role, message_id = id, error = %e, "review failed");
                    report.failed += 1;
                    self.mark_processed(&mailbox, id);
                }
            }

            if self.handle.stop_requested() {
                debug!(role = %self.role, "stop requested, leaving remaining messages");
                break;
            }
        }

        Ok(report)
    }

    fn mark_processed(&self, mailbox: &Mailbox, id: &str) {
        if let Err(e) = mailbox.mark_processed(id) {
            error!(role = %self.role, message_id = id, error = %e, "failed to mark message processed");
        }
    }

    /// Review one request end to end.
    pub async fn process(&self, stored: &StoredMessage) -> Result<ReviewOutcome, ReviewError> {
        let workflow = self.config.workflow();
        let message = &stored.message;
        let kind_name = self.role_config.review_kind.as_str();
        let kind = workflow.kinds.get(kind_name).ok_or_else(|| {
            ReviewError::Configuration(format!("unknown review kind '{}'", kind_name))
        })?;

        let path = resolve_artifact(&self.config.repo_root, message.artifact())?;
        let artifact = Artifact::locate(workflow, &path)?;
        info!(
            role = %self.role,
            message_id = %stored.identity,
            feature = %artifact.feature,
            artifact = %artifact.path.display(),
            "reviewing"
        );

        let bundle = ContextBuilder::new(workflow, &*self.store).build(
            &self.role,
            kind_name,
            &artifact,
            message.context.as_deref(),
        )?;

        let integrity = if kind.integrity_check {
            TestIntegrityVerifier::new(&self.config.repo_root, workflow)
                .with_kind(kind_name)
                .check(&artifact.feature)?
        } else {
            IntegrityOutcome::NoBaseline
        };

        let (decision, reviewer_output, violation) = match integrity {
            IntegrityOutcome::Violation(violation) => {
                (Decision::forced(Verdict::NeedsChanges), None, Some(violation))
            }
            _ => {
                let timeout = Duration::from_secs(workflow.timeout_secs(&self.role));
                let output = self.invoker.invoke(&bundle, timeout).await?;
                let decision = decision::parse(&output.stdout);
                if let Some(ref ambiguity) = decision.ambiguity {
                    warn!(role = %self.role, feature = %artifact.feature, %ambiguity, "ambiguous reviewer decision");
                }
                (decision, Some(output.stdout), None)
            }
        };

        let is_violation = violation.is_some();
        let record = ReviewRecord {
            kind: kind_name.to_string(),
            role: self.role.clone(),
            artifact: artifact.path.clone(),
            feature: artifact.feature.clone(),
            message_id: message.id.clone(),
            decision,
            context_digest: bundle.digest(),
            reviewer_output,
            violation,
            created_at: Utc::now(),
        };
        let archived = workflow.defaults.archive_context.then_some(&bundle);
        let transition = Gatekeeper::new(workflow, &*self.store).transition(
            &artifact,
            &record,
            workflow.defaults.auto_move,
            archived,
        )?;

        info!(
            role = %self.role,
            feature = %artifact.feature,
            verdict = %record.verdict(),
            "review complete"
        );
        Ok(ReviewOutcome {
            verdict: record.verdict(),
            violation: is_violation,
            transition,
        })
    }

    /// Tell the requester how the review went.
    fn respond(&self, request: &Message, outcome: &ReviewOutcome) {
        let Some(ref requester) = request.from else {
            return;
        };
        let artifact = outcome
            .transition
            .moved_to
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| request.artifact().to_string());
        let mut response = Message::new(outcome.verdict.response_event(), requester, &artifact)
            .with_from(&self.role)
            .with_subject(&format!("{}: {}", outcome.verdict, artifact))
            .with_context(&format!(
                "review record: {}",
                outcome.transition.record_path.display()
            ))
            .with_in_reply_to(&request.id)
            .with_body(&format!("In reply to {}\n", request.id));
        if let Some(ref session) = request.session_id {
            response = response.with_session_id(session);
        }

        match Mailbox::new(&self.config.mailbox_root, requester).deliver(&response) {
            Ok(id) => debug!(role = %self.role, to = %requester, id = %id, "response delivered"),
            Err(e) => warn!(role = %self.role, to = %requester, error = %e, "failed to deliver response"),
        }
    }
}

fn log_report(role: &str, report: &CycleReport) {
    if report.drained == 0 && report.handled() == 0 && report.retried == 0 && report.skipped == 0 {
        debug!(role, "cycle idle");
        return;
    }
    info!(
        role,
        drained = report.drained,
        approved = report.approved,
        rejected = report.rejected,
        violations = report.violations,
        retried = report.retried,
        failed = report.failed,
        skipped = report.skipped,
        "cycle complete"
    );
}
