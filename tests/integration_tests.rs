//! Integration tests for the reviewd CLI
//!
//! These tests drive the binary end to end against throwaway repositories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use git2::{Repository, Signature};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a reviewd Command
fn reviewd(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("reviewd");
    cmd.current_dir(dir.path())
        .env_remove("WORKFLOW_MAILDIR")
        .env_remove("REVIEWER_CMD")
        .env_remove("RUST_LOG");
    cmd
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// A git repository with one proposed spec and the documents a spec review needs.
fn create_review_project() -> TempDir {
    let dir = create_temp_project();
    let root = dir.path();
    write(root, "workflow/roles/spec-reviewer.md", "Review the spec.\n");
    write(root, "workflow/schemas/spec.md", "A spec states goals.\n");
    write(root, "specs/proposed/user-auth.md", "# User auth\n\nLogin flow.\n");
    write(root, ".gitignore", "mailbox/\n.workflow/\n");

    let repo = Repository::init(root).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
        .unwrap();
    dir
}

fn commit_count(root: &Path) -> usize {
    let repo = Repository::open(root).unwrap();
    let mut walk = repo.revwalk().unwrap();
    walk.push_head().unwrap();
    walk.count()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_reviewd_help() {
        let dir = create_temp_project();
        reviewd(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("daemon"))
            .stdout(predicate::str::contains("send"));
    }

    #[test]
    fn test_reviewd_version() {
        let dir = create_temp_project();
        reviewd(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = create_temp_project();
        reviewd(&dir).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration"))
            .stdout(predicate::str::contains("spec-reviewer"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created workflow.toml"));

        let path = dir.path().join(".workflow/workflow.toml");
        assert!(path.exists());
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("[roles.spec-reviewer]"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = create_temp_project();
        write(dir.path(), ".workflow/workflow.toml", "[defaults]\ntimeout_secs = 7\n");

        reviewd(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".workflow/workflow.toml")).unwrap();
        assert!(content.contains("timeout_secs = 7"));
    }

    #[test]
    fn test_config_validate_no_config() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults (valid)"));
    }

    #[test]
    fn test_config_validate_reports_unknown_kind() {
        let dir = create_temp_project();
        write(
            dir.path(),
            ".workflow/workflow.toml",
            "[roles.architect]\nreview_kind = \"missing\"\n",
        );

        reviewd(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("unknown review kind 'missing'"));
    }

    #[test]
    fn test_config_show_honors_maildir_env() {
        let dir = create_temp_project();

        reviewd(&dir)
            .env("WORKFLOW_MAILDIR", "elsewhere/mail")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("elsewhere/mail"));
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = create_temp_project();
        write(dir.path(), ".workflow/workflow.toml", "[defaults\ntimeout_secs = ");

        reviewd(&dir).args(["config", "show"]).assert().failure();
    }
}

// =============================================================================
// Mailbox Tests
// =============================================================================

mod mailbox {
    use super::*;

    #[test]
    fn test_send_then_list() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args([
                "send",
                "--to",
                "spec-reviewer",
                "--artifact",
                "specs/proposed/user-auth.md",
                "--from",
                "spec-writer",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Delivered review-request to spec-reviewer"));

        assert!(dir.path().join("mailbox/spec-reviewer/unseen").is_dir());

        reviewd(&dir)
            .args(["list", "spec-reviewer"])
            .assert()
            .success()
            .stdout(predicate::str::contains("specs/proposed/user-auth.md"))
            .stdout(predicate::str::contains("spec-writer"));
    }

    #[test]
    fn test_send_to_qualified_address_uses_role() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args([
                "send",
                "--to",
                "test-reviewer@localhost",
                "--artifact",
                "weather-cache.md",
            ])
            .assert()
            .success();

        assert!(dir.path().join("mailbox/test-reviewer/unseen").is_dir());
    }

    #[test]
    fn test_send_rejects_unknown_event() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args([
                "send",
                "--to",
                "spec-reviewer",
                "--artifact",
                "x.md",
                "--event",
                "gossip",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid event type"));
    }

    #[test]
    fn test_list_json_filters_by_event() {
        let dir = create_temp_project();
        for event in ["review-request", "question"] {
            reviewd(&dir)
                .args([
                    "send",
                    "--to",
                    "spec-reviewer",
                    "--artifact",
                    "a.md",
                    "--event",
                    event,
                ])
                .assert()
                .success();
        }

        let output = reviewd(&dir)
            .args(["list", "spec-reviewer", "--event", "question", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["event_type"], "question");
    }

    #[test]
    fn test_read_shows_message_body() {
        let dir = create_temp_project();
        reviewd(&dir)
            .args([
                "send",
                "--to",
                "spec-reviewer",
                "--artifact",
                "specs/proposed/user-auth.md",
                "--from",
                "spec-writer",
                "--body",
                "Token expiry changed since last round.",
            ])
            .assert()
            .success();

        let output = reviewd(&dir)
            .args(["list", "spec-reviewer", "--json"])
            .output()
            .unwrap();
        let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let identity = rows[0]["identity"].as_str().unwrap().to_string();

        reviewd(&dir)
            .args(["read", "spec-reviewer", &identity])
            .assert()
            .success()
            .stdout(predicate::str::contains(format!("Message-ID: {}", identity)))
            .stdout(predicate::str::contains("From: spec-writer"))
            .stdout(predicate::str::contains("Token expiry changed since last round."));

        reviewd(&dir)
            .args(["read", "spec-reviewer", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No message 'ghost'"));
    }

    #[test]
    fn test_list_since_filters_old_messages() {
        let dir = create_temp_project();
        write(
            dir.path(),
            "mailbox/spec-reviewer/unseen/1600000000.old",
            "Message-ID: 1600000000.old\n\
Date: Sun, 13 Sep 2020 12:26:40 +0000\n\
To: spec-reviewer\n\
X-Event-Type: review-request\n\
X-Artifacts: specs/proposed/legacy.md\n\
\n",
        );
        reviewd(&dir)
            .args(["send", "--to", "spec-reviewer", "--artifact", "specs/proposed/fresh.md"])
            .assert()
            .success();

        let recent = reviewd(&dir)
            .args(["list", "spec-reviewer", "--since", "7d", "--json"])
            .output()
            .unwrap();
        assert!(recent.status.success());
        let rows: serde_json::Value = serde_json::from_slice(&recent.stdout).unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["artifact"], "specs/proposed/fresh.md");

        let everything = reviewd(&dir)
            .args(["list", "spec-reviewer", "--since", "2020-01-01", "--json"])
            .output()
            .unwrap();
        let rows: serde_json::Value = serde_json::from_slice(&everything.stdout).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 2);

        reviewd(&dir)
            .args(["list", "spec-reviewer", "--since", "last-week"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Use format like '7d', '24h'"));
    }

    #[test]
    fn test_list_empty_mailbox() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args(["list", "spec-reviewer"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No messages for spec-reviewer"));
    }
}

// =============================================================================
// Daemon Lifecycle Tests
// =============================================================================

mod daemon {
    use super::*;

    #[test]
    fn test_status_shows_stopped_roles() {
        let dir = create_temp_project();

        reviewd(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("spec-reviewer"))
            .stdout(predicate::str::contains("stopped"));
    }

    #[test]
    fn test_stop_when_not_running() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args(["stop", "spec-reviewer"])
            .assert()
            .success()
            .stdout(predicate::str::contains("not running"));
    }

    #[test]
    fn test_daemon_unknown_role_fails() {
        let dir = create_temp_project();

        reviewd(&dir)
            .args(["daemon", "ghost", "--once"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ghost"));
    }

    #[test]
    fn test_daemon_once_approves_and_moves() {
        let dir = create_review_project();
        let before = commit_count(dir.path());

        reviewd(&dir)
            .args([
                "send",
                "--to",
                "spec-reviewer",
                "--artifact",
                "user-auth.md",
                "--from",
                "spec-writer",
            ])
            .assert()
            .success();

        reviewd(&dir)
            .args([
                "daemon",
                "spec-reviewer",
                "--once",
                "--reviewer-cmd",
                "cat > /dev/null; echo APPROVED",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("approved=1"));

        assert!(!dir.path().join("specs/proposed/user-auth.md").exists());
        assert!(dir.path().join("specs/todo/user-auth.md").exists());
        assert_eq!(commit_count(dir.path()), before + 1);
        assert!(dir.path().join("reviews/spec").is_dir());
        assert!(dir.path().join(".workflow/logs").is_dir());

        reviewd(&dir)
            .args(["list", "spec-writer", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("approval"));

        reviewd(&dir)
            .args(["list", "spec-reviewer", "--unprocessed"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No messages"));
    }

    #[test]
    fn test_daemon_once_with_failing_reviewer_leaves_message() {
        let dir = create_review_project();

        reviewd(&dir)
            .args(["send", "--to", "spec-reviewer", "--artifact", "user-auth.md"])
            .assert()
            .success();

        reviewd(&dir)
            .args([
                "daemon",
                "spec-reviewer",
                "--once",
                "--reviewer-cmd",
                "exit 3",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("retried=1"));

        assert!(dir.path().join("specs/proposed/user-auth.md").exists());
        reviewd(&dir)
            .args(["list", "spec-reviewer", "--unprocessed", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("user-auth.md"));
    }

    #[test]
    fn test_second_interrupt_exits_during_review() {
        use std::time::{Duration, Instant};

        let dir = create_review_project();
        reviewd(&dir)
            .args(["send", "--to", "spec-reviewer", "--artifact", "user-auth.md"])
            .assert()
            .success();

        let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_reviewd"))
            .current_dir(dir.path())
            .env_remove("WORKFLOW_MAILDIR")
            .args(["daemon", "spec-reviewer", "--reviewer-cmd", "sleep 8"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        // Wait for the review to be in flight.
        let seen = dir.path().join("mailbox/spec-reviewer/seen");
        let deadline = Instant::now() + Duration::from_secs(10);
        while fs::read_dir(&seen).map(|d| d.count()).unwrap_or(0) == 0 {
            assert!(Instant::now() < deadline, "daemon never drained its mailbox");
            std::thread::sleep(Duration::from_millis(100));
        }
        std::thread::sleep(Duration::from_millis(500));

        unsafe { libc::kill(pid, libc::SIGINT) };
        std::thread::sleep(Duration::from_millis(300));
        assert!(child.try_wait().unwrap().is_none());
        unsafe { libc::kill(pid, libc::SIGINT) };

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            assert!(started.elapsed() < Duration::from_secs(4), "daemon ignored second interrupt");
            std::thread::sleep(Duration::from_millis(50));
        };
        assert_eq!(status.code(), Some(130));
    }

    #[test]
    fn test_thread_links_request_and_response() {
        let dir = create_review_project();

        reviewd(&dir)
            .args([
                "send",
                "--to",
                "spec-reviewer",
                "--artifact",
                "user-auth.md",
                "--from",
                "spec-writer",
                "--session",
                "sess-auth",
            ])
            .assert()
            .success();
        reviewd(&dir)
            .args([
                "daemon",
                "spec-reviewer",
                "--once",
                "--reviewer-cmd",
                "cat > /dev/null; echo APPROVED",
            ])
            .assert()
            .success();

        let output = reviewd(&dir)
            .args(["thread", "spec-reviewer", "sess-auth", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let thread: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let thread = thread.as_array().unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0]["event_type"], "review-request");
        assert_eq!(thread[1]["event_type"], "approval");
        assert_eq!(thread[1]["in_reply_to"], thread[0]["id"]);

        let response_id = thread[1]["id"].as_str().unwrap().to_string();
        reviewd(&dir)
            .args(["thread", "spec-writer", &response_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Thread with 2 message(s):"))
            .stdout(predicate::str::contains("specs/todo/user-auth.md"));

        reviewd(&dir)
            .args(["thread", "spec-writer", "sess-missing"])
            .assert()
            .failure();
    }
}
