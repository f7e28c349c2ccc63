//! Review records and approved state transitions.
//!
//! The record of every attempt is written first and never rolled back. An
//! approval then moves the artifact one state forward and commits the move
//! together with the record.

use crate::context::ContextBundle;
use crate::decision::{Decision, Verdict};
use crate::errors::ReviewError;
use crate::integrity::TestIntegrityViolation;
use crate::store::{Artifact, ArtifactStore};
use crate::tracker::GitTracker;
use crate::workflow_config::WorkflowToml;
use chrono::{DateTime, Utc};
use glob::MatchOptions;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// One review attempt, as written to `reviews/<kind>/`.
#[derive(Debug, Clone)]
pub struct ReviewRecord {
    pub kind: String,
    pub role: String,
    pub artifact: PathBuf,
    pub feature: String,
    pub message_id: String,
    pub decision: Decision,
    pub context_digest: String,
    pub reviewer_output: Option<String>,
    pub violation: Option<TestIntegrityViolation>,
    pub created_at: DateTime<Utc>,
}

impl ReviewRecord {
    pub fn verdict(&self) -> Verdict {
        self.decision.verdict
    }

    /// `<timestamp>-<feature>-<VERDICT>.md`
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.md",
            self.created_at.format("%Y-%m-%dT%H-%M-%S"),
            self.feature,
            self.verdict().as_str()
        )
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Review: {} ({})\n", self.feature, self.kind);
        let _ = writeln!(out, "- Verdict: **{}**", self.verdict());
        let _ = writeln!(out, "- Kind: {}", self.kind);
        let _ = writeln!(out, "- Artifact: {}", self.artifact.display());
        let _ = writeln!(out, "- Role: {}", self.role);
        let _ = writeln!(out, "- Message: {}", self.message_id);
        let _ = writeln!(out, "- Reviewed at: {}", self.created_at.to_rfc3339());
        let _ = writeln!(out, "- Decision source: {}", self.decision.source.as_str());
        let _ = writeln!(out, "- Context digest: sha256:{}", self.context_digest);

        if let Some(ref ambiguity) = self.decision.ambiguity {
            let _ = writeln!(out, "\n## Decision ambiguity\n\n{}", ambiguity);
        }
        if let Some(ref violation) = self.violation {
            let _ = writeln!(out, "\n## Test integrity violation\n\n{}", violation.to_markdown().trim_end());
        }
        if let Some(ref output) = self.reviewer_output {
            let _ = writeln!(out, "\n## Reviewer output\n\n{}", output.trim_end());
        }
        out
    }
}

/// What the gatekeeper did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// Root-relative path of the written record
    pub record_path: PathBuf,
    pub context_path: Option<PathBuf>,
    /// New root-relative artifact path, if it moved
    pub moved_to: Option<PathBuf>,
    pub commit: Option<String>,
}

pub struct Gatekeeper<'a> {
    workflow: &'a WorkflowToml,
    store: &'a dyn ArtifactStore,
}

impl<'a> Gatekeeper<'a> {
    pub fn new(workflow: &'a WorkflowToml, store: &'a dyn ArtifactStore) -> Self {
        Self { workflow, store }
    }

    /// Persist the record, then apply the transition if the review approved it.
    pub fn transition(
        &self,
        artifact: &Artifact,
        record: &ReviewRecord,
        auto_move: bool,
        context: Option<&ContextBundle>,
    ) -> Result<TransitionOutcome, ReviewError> {
        let kind = self.workflow.kinds.get(&record.kind).ok_or_else(|| {
            ReviewError::Configuration(format!("unknown review kind '{}'", record.kind))
        })?;

        let record_dir = self.workflow.project.reviews_dir.join(&record.kind);
        let record_path = self
            .store
            .write_unique(&record_dir.join(record.file_name()), &record.render())?;
        let context_path = match context {
            Some(bundle) => {
                let stem = record_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                Some(self.store.write_unique(
                    &record_path.with_file_name(format!("{}.context.md", stem)),
                    &bundle.text,
                )?)
            }
            None => None,
        };
        info!(
            kind = %record.kind,
            feature = %record.feature,
            verdict = %record.verdict(),
            record = %record_path.display(),
            "review record written"
        );

        let mut outcome = TransitionOutcome {
            record_path,
            context_path,
            moved_to: None,
            commit: None,
        };

        if !record.verdict().is_approved() || !auto_move || record.violation.is_some() {
            return Ok(outcome);
        }

        let git_err = |reason: String| {
            error!(
                feature = %record.feature,
                record = %outcome.record_path.display(),
                %reason,
                "transition failed, record kept"
            );
            ReviewError::GitOperation(reason)
        };

        if artifact.family != kind.family || artifact.state != kind.from {
            return Err(git_err(format!(
                "{} is in {}/{}, expected {}/{}",
                artifact.path.display(),
                artifact.family,
                artifact.state,
                kind.family,
                kind.from
            )));
        }
        let family = self.workflow.families.get(&kind.family).ok_or_else(|| {
            ReviewError::Configuration(format!("unknown family '{}'", kind.family))
        })?;
        let Some(file_name) = artifact.path.file_name() else {
            return Err(git_err(format!("{} has no file name", artifact.path.display())));
        };
        let destination = family.state_dir(&kind.to).join(file_name);

        self.store
            .relocate(&artifact.path, &destination)
            .map_err(|e| git_err(e.to_string()))?;

        let mut paths = vec![artifact.path.clone(), destination.clone()];
        paths.extend(self.committable(&outcome.record_path));
        if let Some(ref context_path) = outcome.context_path {
            paths.extend(self.committable(context_path));
        }
        if kind.sets_baseline {
            let protected = self.protected_files(&record.kind, &record.feature);
            debug!(
                feature = %record.feature,
                files = protected.len(),
                "committing protected files with baseline"
            );
            paths.extend(protected);
        }

        let message = kind.render_commit_message(&record.kind, &record.feature, record.verdict().as_str());
        let commit = GitTracker::new(self.store.root())
            .and_then(|tracker| {
                tracker.commit_paths(
                    &message,
                    &paths,
                    &self.workflow.project.author_name,
                    &self.workflow.project.author_email,
                )
            })
            .map_err(|e| git_err(format!("{:#}", e)))?;

        info!(
            feature = %record.feature,
            from = %artifact.path.display(),
            to = %destination.display(),
            commit = %&commit[..commit.len().min(8)],
            "artifact transitioned"
        );
        outcome.moved_to = Some(destination);
        outcome.commit = Some(commit);
        Ok(outcome)
    }

    /// Root-relative paths of the feature's protected files on disk.
    fn protected_files(&self, kind: &str, feature: &str) -> Vec<PathBuf> {
        let root = self.store.root();
        let escaped_root = glob::Pattern::escape(&root.to_string_lossy());
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        let mut files = Vec::new();
        for pattern in self.workflow.protected_patterns(kind, feature) {
            let full = format!("{}/{}", escaped_root, pattern.as_str());
            let Ok(matches) = glob::glob_with(&full, options) else {
                continue;
            };
            for path in matches.filter_map(|m| m.ok()).filter(|p| p.is_file()) {
                if let Ok(rel) = path.strip_prefix(root)
                    && !files.iter().any(|f: &PathBuf| f == rel)
                {
                    files.push(rel.to_path_buf());
                }
            }
        }
        files
    }

    /// Root-relative form of `path`, if it lies inside the repository.
    fn committable(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() {
            path.strip_prefix(self.store.root()).ok().map(Path::to_path_buf)
        } else {
            Some(path.to_path_buf())
        }
    }
}
