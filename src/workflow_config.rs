//! Workflow configuration for the review engine.
//!
//! Reads `.workflow/workflow.toml`. Layering is file → environment → CLI:
//! sections missing from the file fall back to built-in defaults, and
//! `REVIEWER_CMD` / `WORKFLOW_MAILDIR` override the file where noted.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! reviewer_cmd = "claude --print"
//! reviews_dir = "reviews"
//! protected_dir = "tests"
//! baseline_pattern = "tests approved for {feature}"
//!
//! [defaults]
//! timeout_secs = 600
//! poll_interval_secs = 60
//! auto_move = true
//!
//! [families.specs]
//! dir = "specs"
//! states = ["proposed", "todo", "doing", "done"]
//!
//! [kinds.spec]
//! family = "specs"
//! from = "proposed"
//! to = "todo"
//! schemas = ["workflow/schemas/{kind}.md"]
//! related = ["planning/ROADMAP.md"]
//!
//! [roles.spec-reviewer]
//! review_kind = "spec"
//! instructions = "workflow/roles/{role}.md"
//! ```

use crate::mailbox::EventType;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default reviewer command when neither the file nor the environment sets one.
pub const DEFAULT_REVIEWER_CMD: &str = "claude --print";

/// Project-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Reviewer command shared by all roles (default: `REVIEWER_CMD` or "claude --print")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_cmd: Option<String>,
    /// Mailbox root, relative to the repository root (default: "mailbox")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox_dir: Option<PathBuf>,
    /// Where review records are written, relative to the repository root
    #[serde(default = "default_reviews_dir")]
    pub reviews_dir: PathBuf,
    /// Directory whose contents are frozen once tests are approved
    #[serde(default = "default_protected_dir")]
    pub protected_dir: PathBuf,
    /// Commit message pattern marking the integrity baseline for a feature
    #[serde(default = "default_baseline_pattern")]
    pub baseline_pattern: String,
    /// Commit author name for gatekeeper commits
    #[serde(default = "default_author_name")]
    pub author_name: String,
    /// Commit author email for gatekeeper commits
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_reviews_dir() -> PathBuf {
    PathBuf::from("reviews")
}

fn default_protected_dir() -> PathBuf {
    PathBuf::from("tests")
}

fn default_baseline_pattern() -> String {
    "tests approved for {feature}".to_string()
}

fn default_author_name() -> String {
    "reviewd".to_string()
}

fn default_author_email() -> String {
    "reviewd@localhost".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            reviewer_cmd: None,
            mailbox_dir: None,
            reviews_dir: default_reviews_dir(),
            protected_dir: default_protected_dir(),
            baseline_pattern: default_baseline_pattern(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

/// Defaults applied to every role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Wall-clock budget for one reviewer invocation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Sleep between mailbox polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Let the gatekeeper relocate approved artifacts
    #[serde(default = "default_auto_move")]
    pub auto_move: bool,
    /// Archive the invocation context next to each review record
    #[serde(default)]
    pub archive_context: bool,
    /// Maximum diff lines kept per file in integrity evidence
    #[serde(default = "default_excerpt_lines")]
    pub excerpt_lines: usize,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_auto_move() -> bool {
    true
}

fn default_excerpt_lines() -> usize {
    40
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            auto_move: default_auto_move(),
            archive_context: false,
            excerpt_lines: default_excerpt_lines(),
        }
    }
}

/// An artifact family: one directory holding ordered state subdirectories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConfig {
    pub dir: PathBuf,
    pub states: Vec<String>,
}

impl FamilyConfig {
    fn new(dir: &str, states: &[&str]) -> Self {
        Self {
            dir: PathBuf::from(dir),
            states: states.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Position of a state in the lifecycle, if it belongs to this family.
    pub fn state_index(&self, state: &str) -> Option<usize> {
        self.states.iter().position(|s| s == state)
    }

    /// Root-relative directory for a state.
    pub fn state_dir(&self, state: &str) -> PathBuf {
        self.dir.join(state)
    }
}

/// A review kind owns exactly one lifecycle edge of one family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindConfig {
    pub family: String,
    pub from: String,
    pub to: String,
    /// Schema / criteria documents (mandatory, at least one)
    #[serde(default)]
    pub schemas: Vec<String>,
    /// Related upstream documents or glob patterns (optional)
    #[serde(default)]
    pub related: Vec<String>,
    /// Run the test-integrity verifier before invoking the reviewer
    #[serde(default)]
    pub integrity_check: bool,
    /// Commit message template; placeholders: {kind} {feature} {verdict} {from} {to}
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    /// The approval commit is an integrity baseline: the feature's protected
    /// files are committed together with the artifact
    #[serde(default)]
    pub sets_baseline: bool,
}

impl KindConfig {
    fn new(family: &str, from: &str, to: &str, related: &[&str]) -> Self {
        Self {
            family: family.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            schemas: vec!["workflow/schemas/{kind}.md".to_string()],
            related: related.iter().map(|s| s.to_string()).collect(),
            integrity_check: false,
            commit_message: None,
            sets_baseline: false,
        }
    }

    /// Render the commit message for an approved transition.
    pub fn render_commit_message(&self, kind: &str, feature: &str, verdict: &str) -> String {
        let template = self
            .commit_message
            .as_deref()
            .unwrap_or("{kind} review {verdict} for {feature} ({from} -> {to})");
        expand_placeholders(
            template,
            &[
                ("kind", kind),
                ("feature", feature),
                ("verdict", verdict),
                ("from", &self.from),
                ("to", &self.to),
            ],
        )
    }
}

/// Per-role daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Review kind this role performs
    pub review_kind: String,
    /// Reviewer command override for this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_cmd: Option<String>,
    /// Role instructions document
    #[serde(default = "default_instructions")]
    pub instructions: String,
    /// Event types this role's daemon acts on
    #[serde(default = "default_event_types")]
    pub event_types: Vec<EventType>,
    /// Timeout override for this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_instructions() -> String {
    "workflow/roles/{role}.md".to_string()
}

fn default_event_types() -> Vec<EventType> {
    vec![EventType::ReviewRequest]
}

impl RoleConfig {
    fn new(review_kind: &str) -> Self {
        Self {
            review_kind: review_kind.to_string(),
            reviewer_cmd: None,
            instructions: default_instructions(),
            event_types: default_event_types(),
            timeout_secs: None,
        }
    }
}

fn default_families() -> BTreeMap<String, FamilyConfig> {
    BTreeMap::from([
        (
            "specs".to_string(),
            FamilyConfig::new("specs", &["proposed", "todo", "doing", "done"]),
        ),
        (
            "bugs".to_string(),
            FamilyConfig::new("bugs", &["to_fix", "fixing", "fixed"]),
        ),
    ])
}

fn default_kinds() -> BTreeMap<String, KindConfig> {
    let mut tests = KindConfig::new("specs", "todo", "doing", &["tests/**/*{feature}*"]);
    tests.commit_message = Some("tests approved for {feature} ({from} -> {to})".to_string());
    tests.sets_baseline = true;

    let mut implementation = KindConfig::new(
        "specs",
        "doing",
        "done",
        &["tests/**/*{feature}*", "src/**/*{feature}*"],
    );
    implementation.integrity_check = true;

    BTreeMap::from([
        (
            "spec".to_string(),
            KindConfig::new(
                "specs",
                "proposed",
                "todo",
                &["planning/VISION.md", "planning/SCOPE.md", "planning/ROADMAP.md"],
            ),
        ),
        ("tests".to_string(), tests),
        ("implementation".to_string(), implementation),
        (
            "bug-triage".to_string(),
            KindConfig::new("bugs", "to_fix", "fixing", &[]),
        ),
        (
            "bugfix".to_string(),
            KindConfig::new("bugs", "fixing", "fixed", &["tests/**/*{feature}*"]),
        ),
    ])
}

fn default_roles() -> BTreeMap<String, RoleConfig> {
    BTreeMap::from([
        ("spec-reviewer".to_string(), RoleConfig::new("spec")),
        ("test-reviewer".to_string(), RoleConfig::new("tests")),
        (
            "implementation-reviewer".to_string(),
            RoleConfig::new("implementation"),
        ),
        ("bug-triager".to_string(), RoleConfig::new("bug-triage")),
        ("bug-reviewer".to_string(), RoleConfig::new("bugfix")),
    ])
}

/// The complete workflow.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub families: BTreeMap<String, FamilyConfig>,
    #[serde(default)]
    pub kinds: BTreeMap<String, KindConfig>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
}

impl Default for WorkflowToml {
    fn default() -> Self {
        Self {
            project: ProjectConfig::default(),
            defaults: DefaultsConfig::default(),
            families: default_families(),
            kinds: default_kinds(),
            roles: default_roles(),
        }
    }
}

impl WorkflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string, filling in built-in families,
    /// kinds and roles the file does not redefine.
    pub fn parse(content: &str) -> Result<Self> {
        let mut toml: WorkflowToml =
            toml::from_str(content).context("Failed to parse workflow.toml")?;
        for (name, family) in default_families() {
            toml.families.entry(name).or_insert(family);
        }
        for (name, kind) in default_kinds() {
            toml.kinds.entry(name).or_insert(kind);
        }
        for (name, role) in default_roles() {
            toml.roles.entry(name).or_insert(role);
        }
        Ok(toml)
    }

    /// Load from `<workflow_dir>/workflow.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(workflow_dir: &Path) -> Result<Self> {
        let config_path = workflow_dir.join("workflow.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize workflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Reviewer command for a role: role override, then project, then `REVIEWER_CMD`.
    pub fn reviewer_cmd(&self, role: &str) -> String {
        self.roles
            .get(role)
            .and_then(|r| r.reviewer_cmd.clone())
            .or_else(|| self.project.reviewer_cmd.clone())
            .or_else(|| std::env::var("REVIEWER_CMD").ok())
            .unwrap_or_else(|| DEFAULT_REVIEWER_CMD.to_string())
    }

    /// Invocation timeout for a role.
    pub fn timeout_secs(&self, role: &str) -> u64 {
        self.roles
            .get(role)
            .and_then(|r| r.timeout_secs)
            .unwrap_or(self.defaults.timeout_secs)
    }

    /// Compile the integrity baseline pattern for one feature.
    pub fn baseline_regex(&self, feature: &str) -> Result<Regex> {
        let escaped = regex::escape(feature);
        let pattern = regex::escape(&self.project.baseline_pattern).replace(r"\{feature\}", &escaped);
        // The feature must not run on into a longer name ("cache" vs "cache-v2").
        Regex::new(&format!(r"(?i){}(?:[^\w-]|$)", pattern))
            .with_context(|| format!("Invalid baseline pattern '{}'", self.project.baseline_pattern))
    }

    /// Validate the configuration and return any warnings.
    /// A feature's protected files as glob patterns: the kind's related
    /// patterns, placeholders expanded, that point inside `protected_dir`.
    pub fn protected_patterns(&self, kind: &str, feature: &str) -> Vec<glob::Pattern> {
        let Some(kind_config) = self.kinds.get(kind) else {
            return Vec::new();
        };
        let protected = self.project.protected_dir.to_string_lossy();
        let prefix = format!("{}/", protected.trim_end_matches('/'));
        kind_config
            .related
            .iter()
            .map(|raw| expand_placeholders(raw, &[("feature", feature), ("kind", kind)]))
            .filter(|pattern| pattern.starts_with(&prefix))
            .filter_map(|pattern| glob::Pattern::new(&pattern).ok())
            .collect()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.timeout_secs == 0 {
            warnings.push("defaults.timeout_secs is 0: every review would time out".to_string());
        }
        if self.defaults.poll_interval_secs == 0 {
            warnings.push("defaults.poll_interval_secs is 0: daemon would busy-poll".to_string());
        }
        if !self.project.baseline_pattern.contains("{feature}") {
            warnings.push(format!(
                "baseline_pattern '{}' has no {{feature}} placeholder",
                self.project.baseline_pattern
            ));
        }

        for (name, family) in &self.families {
            if family.states.len() < 2 {
                warnings.push(format!("Family '{}' needs at least two states", name));
            }
        }

        for (name, kind) in &self.kinds {
            let Some(family) = self.families.get(&kind.family) else {
                warnings.push(format!(
                    "Kind '{}' references unknown family '{}'",
                    name, kind.family
                ));
                continue;
            };
            match (family.state_index(&kind.from), family.state_index(&kind.to)) {
                (Some(from), Some(to)) if to <= from => warnings.push(format!(
                    "Kind '{}' moves backwards ({} -> {})",
                    name, kind.from, kind.to
                )),
                (None, _) | (_, None) => warnings.push(format!(
                    "Kind '{}' uses states outside family '{}' ({} -> {})",
                    name, kind.family, kind.from, kind.to
                )),
                _ => {}
            }
            if kind.schemas.is_empty() {
                warnings.push(format!("Kind '{}' has no schema documents", name));
            }
        }

        for (name, role) in &self.roles {
            if !self.kinds.contains_key(&role.review_kind) {
                warnings.push(format!(
                    "Role '{}' references unknown review kind '{}'",
                    name, role.review_kind
                ));
            }
            if role.timeout_secs == Some(0) {
                warnings.push(format!("Role '{}' has timeout_secs = 0", name));
            }
        }

        warnings
    }
}

/// Replace `{name}` placeholders in a template.
pub fn expand_placeholders(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}
