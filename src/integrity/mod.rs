//! Test-integrity verification.
//!
//! Once a feature's tests are approved, the approval commit is the baseline.
//! Any later change under the protected directory means the implementation
//! edited its own tests, and the review fails without consulting a reviewer.

use crate::errors::ReviewError;
use crate::tracker::{CommitInfo, FileDiff, GitTracker};
use crate::workflow_config::WorkflowToml;
use glob::MatchOptions;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Evidence of protected files changed after the baseline.
#[derive(Debug, Clone)]
pub struct TestIntegrityViolation {
    pub feature: String,
    pub baseline: CommitInfo,
    pub protected_dir: PathBuf,
    pub files: Vec<FileDiff>,
}

impl TestIntegrityViolation {
    /// Markdown evidence for the review record.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Files under `{}/` changed since baseline `{}` ({}):\n",
            self.protected_dir.display(),
            short_sha(&self.baseline.sha),
            self.baseline.summary
        );
        for file in &self.files {
            let _ = writeln!(
                out,
                "### {} ({})\n",
                file.path.display(),
                file.change_type.as_str()
            );
            if !file.added_lines.is_empty() {
                let _ = writeln!(out, "- added lines: {}", join_numbers(&file.added_lines));
            }
            if !file.removed_lines.is_empty() {
                let _ = writeln!(out, "- removed lines: {}", join_numbers(&file.removed_lines));
            }
            if !file.excerpt.is_empty() {
                let _ = writeln!(out, "\n```diff\n{}\n```", file.excerpt);
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone)]
pub enum IntegrityOutcome {
    /// No approval commit yet; nothing to protect.
    NoBaseline,
    Clean { baseline: CommitInfo },
    Violation(TestIntegrityViolation),
}

impl IntegrityOutcome {
    pub fn violation(&self) -> Option<&TestIntegrityViolation> {
        match self {
            IntegrityOutcome::Violation(v) => Some(v),
            _ => None,
        }
    }
}

/// Checks one feature's protected files against its baseline.
///
/// A file counts as the feature's when the baseline commit touched it or it
/// matches the review kind's related patterns under the protected directory.
/// Other features' tests never cause a violation.
pub struct TestIntegrityVerifier<'a> {
    repo_root: &'a Path,
    workflow: &'a WorkflowToml,
    kind: Option<&'a str>,
}

impl<'a> TestIntegrityVerifier<'a> {
    pub fn new(repo_root: &'a Path, workflow: &'a WorkflowToml) -> Self {
        Self {
            repo_root,
            workflow,
            kind: None,
        }
    }

    /// Also protect files matching this review kind's related patterns.
    pub fn with_kind(mut self, kind: &'a str) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn check(&self, feature: &str) -> Result<IntegrityOutcome, ReviewError> {
        let pattern = self
            .workflow
            .baseline_regex(feature)
            .map_err(|e| ReviewError::Configuration(format!("{:#}", e)))?;
        let git_err = |e: anyhow::Error| ReviewError::GitOperation(format!("{:#}", e));

        let tracker = GitTracker::new(self.repo_root).map_err(git_err)?;
        let Some(baseline) = tracker.find_commit_matching(&pattern).map_err(git_err)? else {
            debug!(feature, "no integrity baseline, skipping check");
            return Ok(IntegrityOutcome::NoBaseline);
        };

        let protected_dir = self.workflow.project.protected_dir.clone();
        let mut files = tracker
            .diff_dir_since(&baseline.sha, &protected_dir, self.workflow.defaults.excerpt_lines)
            .map_err(git_err)?;

        let baseline_paths = tracker.paths_changed_in(&baseline.sha).map_err(git_err)?;
        let patterns = self
            .kind
            .map(|kind| self.workflow.protected_patterns(kind, feature))
            .unwrap_or_default();
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        files.retain(|file| {
            baseline_paths.contains(&file.path)
                || patterns
                    .iter()
                    .any(|p| p.matches_path_with(&file.path, options))
        });

        if files.is_empty() {
            debug!(feature, baseline = %short_sha(&baseline.sha), "protected tests unchanged");
            return Ok(IntegrityOutcome::Clean { baseline });
        }

        warn!(
            feature,
            baseline = %short_sha(&baseline.sha),
            files = files.len(),
            "protected tests changed since approval"
        );
        Ok(IntegrityOutcome::Violation(TestIntegrityViolation {
            feature: feature.to_string(),
            baseline,
            protected_dir,
            files,
        }))
    }
}

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

fn join_numbers(lines: &[u32]) -> String {
    lines
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        dir
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
        GitTracker::new(dir)
            .unwrap()
            .commit_all(msg, "test", "test@test.com")
            .unwrap();
    }

    #[test]
    fn test_no_baseline_is_not_a_violation() {
        let dir = setup_repo();
        commit_file(dir.path(), "tests/test_cache.py", "assert True\n", "init");
        let workflow = WorkflowToml::default();
        let outcome = TestIntegrityVerifier::new(dir.path(), &workflow)
            .check("weather-cache")
            .unwrap();
        assert!(matches!(outcome, IntegrityOutcome::NoBaseline));
    }

    #[test]
    fn test_clean_after_baseline() {
        let dir = setup_repo();
        commit_file(
            dir.path(),
            "tests/test_weather_cache.py",
            "assert fetch() == 1\n",
            "tests approved for weather-cache (todo -> doing)",
        );
        commit_file(dir.path(), "src/cache.py", "def fetch(): return 1\n", "implement");
        let workflow = WorkflowToml::default();
        let outcome = TestIntegrityVerifier::new(dir.path(), &workflow)
            .check("weather-cache")
            .unwrap();
        assert!(matches!(outcome, IntegrityOutcome::Clean { .. }));
    }

    #[test]
    fn test_changed_assertion_is_violation_with_evidence() {
        let dir = setup_repo();
        commit_file(
            dir.path(),
            "tests/test_weather_cache.py",
            "def test_ttl():\n    assert ttl() == 300\n",
            "tests approved for weather-cache (todo -> doing)",
        );
        fs::write(
            dir.path().join("tests/test_weather_cache.py"),
            "def test_ttl():\n    assert ttl() == 30\n",
        )
        .unwrap();

        let workflow = WorkflowToml::default();
        let outcome = TestIntegrityVerifier::new(dir.path(), &workflow)
            .check("weather-cache")
            .unwrap();
        let violation = outcome.violation().unwrap();
        assert_eq!(violation.files.len(), 1);
        assert_eq!(violation.files[0].added_lines, vec![2]);

        let evidence = violation.to_markdown();
        assert!(evidence.contains("tests/test_weather_cache.py (modified)"));
        assert!(evidence.contains("added lines: 2"));
        assert!(evidence.contains("+    assert ttl() == 30"));
    }

    #[test]
    fn test_other_features_baseline_is_ignored() {
        let dir = setup_repo();
        commit_file(
            dir.path(),
            "tests/test_a.py",
            "x\n",
            "tests approved for weather-cache-v2 (todo -> doing)",
        );
        fs::write(dir.path().join("tests/test_a.py"), "y\n").unwrap();
        let workflow = WorkflowToml::default();
        let outcome = TestIntegrityVerifier::new(dir.path(), &workflow)
            .check("weather-cache")
            .unwrap();
        assert!(matches!(outcome, IntegrityOutcome::NoBaseline));
    }

    #[test]
    fn test_later_feature_tests_do_not_affect_baseline() {
        let dir = setup_repo();
        commit_file(
            dir.path(),
            "tests/test_weather-cache.py",
            "assert fetch() == 1\n",
            "tests approved for weather-cache (todo -> doing)",
        );
        commit_file(
            dir.path(),
            "tests/test_user-auth.py",
            "assert login()\n",
            "tests approved for user-auth (todo -> doing)",
        );
        fs::write(dir.path().join("tests/test_user-auth.py"), "assert True\n").unwrap();

        let workflow = WorkflowToml::default();
        let outcome = TestIntegrityVerifier::new(dir.path(), &workflow)
            .with_kind("implementation")
            .check("weather-cache")
            .unwrap();
        assert!(matches!(outcome, IntegrityOutcome::Clean { .. }));
    }

    #[test]
    fn test_new_feature_test_file_after_baseline_is_violation() {
        let dir = setup_repo();
        commit_file(
            dir.path(),
            "tests/test_weather-cache.py",
            "assert fetch() == 1\n",
            "tests approved for weather-cache (todo -> doing)",
        );
        fs::write(
            dir.path().join("tests/test_weather-cache_extra.py"),
            "assert True\n",
        )
        .unwrap();

        let workflow = WorkflowToml::default();
        let scoped = TestIntegrityVerifier::new(dir.path(), &workflow)
            .with_kind("implementation")
            .check("weather-cache")
            .unwrap();
        let violation = scoped.violation().unwrap();
        assert_eq!(
            violation.files[0].path,
            PathBuf::from("tests/test_weather-cache_extra.py")
        );

        let unscoped = TestIntegrityVerifier::new(dir.path(), &workflow)
            .check("weather-cache")
            .unwrap();
        assert!(matches!(unscoped, IntegrityOutcome::Clean { .. }));
    }

    #[test]
    fn test_not_a_repository_is_git_error() {
        let dir = tempdir().unwrap();
        let workflow = WorkflowToml::default();
        let result = TestIntegrityVerifier::new(dir.path(), &workflow).check("x");
        assert!(matches!(result, Err(ReviewError::GitOperation(_))));
    }
}
