//! Message file codec.
//!
//! A message file is a block of `Key: value` header lines terminated by a
//! blank line, followed by a free-text body:
//!
//! ```text
//! Message-ID: 1760000000.5f0c...
//! Date: Fri, 17 Oct 2026 09:00:00 +0000
//! From: spec-writer
//! To: spec-reviewer
//! X-Event-Type: review-request
//! X-Artifacts: specs/proposed/user-auth.md
//!
//! Please review the auth spec.
//! Context: focus on token expiry
//! ```

use crate::errors::ReviewError;
use chrono::{DateTime, Utc};
use glob::MatchOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Workflow event carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ReviewRequest,
    Approval,
    Rejection,
    ClarificationRequest,
    BlockerReport,
    StatusUpdate,
    Question,
    Answer,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::ReviewRequest,
        EventType::Approval,
        EventType::Rejection,
        EventType::ClarificationRequest,
        EventType::BlockerReport,
        EventType::StatusUpdate,
        EventType::Question,
        EventType::Answer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ReviewRequest => "review-request",
            EventType::Approval => "approval",
            EventType::Rejection => "rejection",
            EventType::ClarificationRequest => "clarification-request",
            EventType::BlockerReport => "blocker-report",
            EventType::StatusUpdate => "status-update",
            EventType::Question => "question",
            EventType::Answer => "answer",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        EventType::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid event type '{}'. Valid values: {}",
                    s,
                    EventType::ALL.map(|e| e.as_str()).join(", ")
                )
            })
    }
}

/// A decoded workflow message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub date: Option<DateTime<Utc>>,
    /// Sender role (optional)
    pub from: Option<String>,
    /// Recipient role
    pub to: String,
    pub event_type: EventType,
    /// Referenced artifacts; the first one is the subject of the message.
    pub artifacts: Vec<String>,
    pub subject: Option<String>,
    pub session_id: Option<String>,
    /// Message-ID of the message this one answers.
    #[serde(default)]
    pub in_reply_to: Option<String>,
    pub context: Option<String>,
    pub body: String,
}

impl Message {
    /// Create a new message with a fresh id and the current timestamp.
    pub fn new(event_type: EventType, to: &str, artifact: &str) -> Self {
        Self {
            id: new_message_id(),
            date: Some(Utc::now()),
            from: None,
            to: role_of(to),
            event_type,
            artifacts: vec![artifact.to_string()],
            subject: None,
            session_id: None,
            in_reply_to: None,
            context: None,
            body: String::new(),
        }
    }

    pub fn with_from(mut self, from: &str) -> Self {
        self.from = Some(role_of(from));
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }

    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_in_reply_to(mut self, message_id: &str) -> Self {
        self.in_reply_to = Some(message_id.to_string());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    /// The artifact this message is about.
    pub fn artifact(&self) -> &str {
        self.artifacts.first().map(String::as_str).unwrap_or("")
    }

    /// Serialize to the on-disk file format.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        push_header(&mut out, "Message-ID", &self.id);
        if let Some(date) = self.date {
            push_header(&mut out, "Date", &date.to_rfc2822());
        }
        if let Some(ref from) = self.from {
            push_header(&mut out, "From", from);
        }
        push_header(&mut out, "To", &self.to);
        if let Some(ref subject) = self.subject {
            push_header(&mut out, "Subject", subject);
        }
        push_header(&mut out, "X-Event-Type", self.event_type.as_str());
        push_header(&mut out, "X-Artifacts", &self.artifacts.join(", "));
        if let Some(ref session) = self.session_id {
            push_header(&mut out, "X-Session-Id", session);
        }
        if let Some(ref parent) = self.in_reply_to {
            push_header(&mut out, "In-Reply-To", parent);
        }
        if let Some(ref context) = self.context {
            push_header(&mut out, "X-Context", context);
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }

    /// Parse a message file. `identity` names the file in error reports and
    /// stands in for a missing `Message-ID` header.
    pub fn decode(identity: &str, text: &str) -> Result<Self, ReviewError> {
        let corrupt = |reason: String| ReviewError::MailboxCorruption {
            message_id: identity.to_string(),
            reason,
        };

        let mut headers: Vec<(String, String)> = Vec::new();
        let mut body_start = None;
        let mut offset = 0;

        for raw_line in text.split_inclusive('\n') {
            let line = raw_line.trim_end_matches(['\n', '\r']);
            offset += raw_line.len();

            if line.is_empty() {
                body_start = Some(offset);
                break;
            }

            if line.starts_with([' ', '\t']) {
                let Some((_, value)) = headers.last_mut() else {
                    return Err(corrupt("continuation line before any header".to_string()));
                };
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                return Err(corrupt(format!("header line without ':' : {:?}", line)));
            };
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(corrupt(format!("invalid header name {:?}", key)));
            }
            headers.push((key.to_ascii_lowercase(), value.trim().to_string()));
        }

        let Some(body_start) = body_start else {
            return Err(corrupt("header block has no blank-line terminator".to_string()));
        };
        let body = text[body_start..].to_string();

        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_empty())
        };

        let event_raw =
            header("x-event-type").ok_or_else(|| corrupt("missing X-Event-Type header".into()))?;
        let event_type = event_raw
            .parse::<EventType>()
            .map_err(|e| corrupt(e.to_string()))?;

        let to = header("to")
            .map(|v| role_of(&v))
            .filter(|v| !v.is_empty())
            .ok_or_else(|| corrupt("missing To header".into()))?;

        let artifacts: Vec<String> = header("x-artifacts")
            .or_else(|| header("x-artifact"))
            .map(|v| {
                v.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if artifacts.is_empty() {
            return Err(corrupt("missing X-Artifacts header".into()));
        }

        let date = header("date").and_then(|d| {
            DateTime::parse_from_rfc2822(&d)
                .or_else(|_| DateTime::parse_from_rfc3339(&d))
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        });

        let context = header("x-context").or_else(|| context_from_body(&body));

        Ok(Self {
            id: header("message-id").unwrap_or_else(|| identity.to_string()),
            date,
            from: header("from").map(|v| role_of(&v)).filter(|v| !v.is_empty()),
            to,
            event_type,
            artifacts,
            subject: header("subject"),
            session_id: header("x-session-id"),
            in_reply_to: header("in-reply-to"),
            context,
            body,
        })
    }
}

fn push_header(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push_str(": ");
    // Fold embedded newlines so the header block stays one logical field.
    let mut lines = value.lines();
    out.push_str(lines.next().unwrap_or(""));
    for line in lines {
        out.push_str("\n ");
        out.push_str(line);
    }
    out.push('\n');
}

fn context_from_body(body: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let trimmed = line.trim_start();
        let (label, rest) = trimmed.split_at_checked(8)?;
        if label.eq_ignore_ascii_case("context:") {
            Some(rest.trim().to_string()).filter(|c| !c.is_empty())
        } else {
            None
        }
    })
}

/// Generate a unique, filename-safe message id that sorts roughly by creation time.
pub fn new_message_id() -> String {
    format!("{}.{}", Utc::now().timestamp(), Uuid::new_v4().simple())
}

/// Extract the role from an address: `role`, `role@host` or `Name <role@host>`.
pub fn role_of(address: &str) -> String {
    let addr = address.trim();
    let inner = match (addr.find('<'), addr.rfind('>')) {
        (Some(start), Some(end)) if start < end => &addr[start + 1..end],
        _ => addr,
    };
    inner.split('@').next().unwrap_or("").trim().to_string()
}

/// Resolve a message's artifact reference to a root-relative path.
///
/// A reference naming an existing file is used as-is. Anything else is
/// treated as a glob pattern (a bare name is searched as `**/<name>`) and the
/// first matching file wins.
pub fn resolve_artifact(root: &Path, reference: &str) -> Result<PathBuf, ReviewError> {
    let reference = reference.trim();
    let not_found = || ReviewError::ArtifactNotFound {
        path: PathBuf::from(reference),
    };
    if reference.is_empty() {
        return Err(not_found());
    }

    let candidate = Path::new(reference);
    let direct = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    if direct.is_file() {
        return direct
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|_| not_found());
    }

    let pattern = if reference.contains(['*', '?', '[']) {
        reference.to_string()
    } else {
        format!("**/{}", reference)
    };
    let full_pattern = root.join(&pattern).to_string_lossy().to_string();
    let options = MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::new()
    };
    let entries = glob::glob_with(&full_pattern, options).map_err(|e| {
        ReviewError::Configuration(format!("invalid artifact pattern '{}': {}", pattern, e))
    })?;

    entries
        .filter_map(|entry| entry.ok())
        .find(|path| path.is_file())
        .and_then(|path| path.strip_prefix(root).ok().map(Path::to_path_buf))
        .ok_or_else(not_found)
}
