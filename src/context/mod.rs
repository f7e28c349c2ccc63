//! Invocation context assembly.
//!
//! A bundle is rebuilt for every review attempt from the role instructions,
//! the artifact itself, related upstream documents and the schema documents
//! of the review kind. Nothing is carried over between attempts.

use crate::errors::ReviewError;
use crate::store::{Artifact, ArtifactStore};
use crate::workflow_config::{WorkflowToml, expand_placeholders};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Instructions,
    Artifact,
    Related,
    Schema,
    RequestNotes,
}

impl SectionKind {
    fn heading(&self) -> &'static str {
        match self {
            SectionKind::Instructions => "Role instructions",
            SectionKind::Artifact => "Artifact",
            SectionKind::Related => "Related document",
            SectionKind::Schema => "Review criteria",
            SectionKind::RequestNotes => "Request notes",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextSection {
    pub kind: SectionKind,
    /// Root-relative source document, if the section came from a file
    pub source: Option<PathBuf>,
    pub body: String,
}

/// The assembled reviewer input.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub sections: Vec<ContextSection>,
    pub text: String,
}

impl ContextBundle {
    fn from_sections(sections: Vec<ContextSection>) -> Self {
        let text = sections
            .iter()
            .map(render_section)
            .collect::<Vec<_>>()
            .join("\n");
        Self { sections, text }
    }

    /// Hex SHA-256 of the rendered text.
    pub fn digest(&self) -> String {
        format!("{:x}", Sha256::digest(self.text.as_bytes()))
    }

    pub fn sections_of(&self, kind: SectionKind) -> impl Iterator<Item = &ContextSection> {
        self.sections.iter().filter(move |s| s.kind == kind)
    }
}

fn render_section(section: &ContextSection) -> String {
    let title = match section.source {
        Some(ref path) => format!("## {}: {}", section.kind.heading(), path.display()),
        None => format!("## {}", section.kind.heading()),
    };
    let fence = fence_for(&section.body);
    let mut body = section.body.clone();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!("{}\n\n{}\n{}{}\n", title, fence, body, fence)
}

/// A backtick fence longer than any backtick run inside `body`.
fn fence_for(body: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in body.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}

pub struct ContextBuilder<'a> {
    workflow: &'a WorkflowToml,
    store: &'a dyn ArtifactStore,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(workflow: &'a WorkflowToml, store: &'a dyn ArtifactStore) -> Self {
        Self { workflow, store }
    }

    /// Build the bundle for `role` reviewing `artifact` as `kind_name`.
    ///
    /// Every mandatory input is checked here, before any reviewer runs.
    pub fn build(
        &self,
        role: &str,
        kind_name: &str,
        artifact: &Artifact,
        request_notes: Option<&str>,
    ) -> Result<ContextBundle, ReviewError> {
        let kind = self.workflow.kinds.get(kind_name).ok_or_else(|| {
            ReviewError::Configuration(format!("unknown review kind '{}'", kind_name))
        })?;
        if kind.schemas.is_empty() {
            return Err(ReviewError::Configuration(format!(
                "review kind '{}' has no schema documents",
                kind_name
            )));
        }
        let role_config = self.workflow.roles.get(role).ok_or_else(|| {
            ReviewError::Configuration(format!("role '{}' is not configured", role))
        })?;

        let vars = [
            ("feature", artifact.feature.as_str()),
            ("kind", kind_name),
            ("role", role),
        ];
        let mut sections = Vec::new();

        let instructions = PathBuf::from(expand_placeholders(&role_config.instructions, &vars));
        sections.push(ContextSection {
            kind: SectionKind::Instructions,
            body: self.read_required(&instructions, "role instructions")?,
            source: Some(instructions),
        });

        sections.push(ContextSection {
            kind: SectionKind::Artifact,
            body: self.store.read(&artifact.path)?,
            source: Some(artifact.path.clone()),
        });

        let mut seen: Vec<PathBuf> = vec![artifact.path.clone()];
        for pattern in &kind.related {
            let pattern = expand_placeholders(pattern, &vars);
            for path in self.expand_related(&pattern) {
                if seen.contains(&path) {
                    continue;
                }
                // Optional documents that vanish between glob and read are skipped.
                if let Ok(body) = self.store.read(&path) {
                    sections.push(ContextSection {
                        kind: SectionKind::Related,
                        source: Some(path.clone()),
                        body,
                    });
                    seen.push(path);
                }
            }
        }

        for schema in &kind.schemas {
            let schema = PathBuf::from(expand_placeholders(schema, &vars));
            sections.push(ContextSection {
                kind: SectionKind::Schema,
                body: self.read_required(&schema, "schema document")?,
                source: Some(schema),
            });
        }

        if let Some(notes) = request_notes.map(str::trim).filter(|n| !n.is_empty()) {
            sections.push(ContextSection {
                kind: SectionKind::RequestNotes,
                source: None,
                body: notes.to_string(),
            });
        }

        let bundle = ContextBundle::from_sections(sections);
        debug!(
            role,
            kind = kind_name,
            feature = %artifact.feature,
            sections = bundle.sections.len(),
            digest = %bundle.digest(),
            "built review context"
        );
        Ok(bundle)
    }

    fn read_required(&self, path: &Path, what: &str) -> Result<String, ReviewError> {
        self.store.read(path).map_err(|e| match e {
            ReviewError::ArtifactNotFound { path } => {
                ReviewError::Configuration(format!("missing {}: {}", what, path.display()))
            }
            other => other,
        })
    }

    /// Root-relative files matching a related-document pattern, sorted.
    fn expand_related(&self, pattern: &str) -> Vec<PathBuf> {
        if !pattern.contains(['*', '?', '[']) {
            let path = PathBuf::from(pattern);
            return if self.store.exists(&path) {
                vec![path]
            } else {
                Vec::new()
            };
        }

        let root = self.store.root();
        let full = root.join(pattern).to_string_lossy().to_string();
        let Ok(paths) = glob::glob(&full) else {
            return Vec::new();
        };
        let mut matches: Vec<PathBuf> = paths
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .filter_map(|p| p.strip_prefix(root).ok().map(Path::to_path_buf))
            .collect();
        matches.sort();
        matches
    }
}
