//! Reviewer decision parsing.
//!
//! Extracts the verdict from reviewer output. The delimited field
//! `<decision>APPROVED</decision>` / `<decision>NEEDS-CHANGES</decision>` is
//! preferred; bare `APPROVED` / `NEEDS-CHANGES` words are accepted for
//! reviewers that do not emit it. Anything unclear fails closed.

use crate::errors::ReviewError;
use crate::mailbox::EventType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static DECISION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<decision>\s*(.*?)\s*</decision>").unwrap());

static APPROVED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w-])APPROVED(?:[^\w-]|$)").unwrap());

static NEEDS_CHANGES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w-])NEEDS-CHANGES(?:[^\w-]|$)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "NEEDS-CHANGES")]
    NeedsChanges,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "APPROVED",
            Verdict::NeedsChanges => "NEEDS-CHANGES",
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved)
    }

    /// Event type of the response sent back to the requester.
    pub fn response_event(&self) -> EventType {
        match self {
            Verdict::Approved => EventType::Approval,
            Verdict::NeedsChanges => EventType::Rejection,
        }
    }

    fn from_field(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace(['_', ' '], "-").as_str() {
            "APPROVED" => Some(Verdict::Approved),
            "NEEDS-CHANGES" => Some(Verdict::NeedsChanges),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// `<decision>...</decision>` field
    Delimited,
    /// Bare keyword in the output
    Keyword,
    /// No usable signal; failed closed
    Default,
    /// Set without consulting a reviewer (integrity violation)
    Forced,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Delimited => "decision field",
            DecisionSource::Keyword => "keyword",
            DecisionSource::Default => "default (fail closed)",
            DecisionSource::Forced => "integrity check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub source: DecisionSource,
    /// Why the output could not be read unambiguously
    pub ambiguity: Option<String>,
}

impl Decision {
    /// A verdict reached without a reviewer.
    pub fn forced(verdict: Verdict) -> Self {
        Self {
            verdict,
            source: DecisionSource::Forced,
            ambiguity: None,
        }
    }

    fn ambiguous(reason: String) -> Self {
        Self {
            verdict: Verdict::NeedsChanges,
            source: DecisionSource::Default,
            ambiguity: Some(reason),
        }
    }

    /// The ambiguity as an error value, for recording.
    pub fn ambiguity_error(&self) -> Option<ReviewError> {
        self.ambiguity.clone().map(ReviewError::DecisionParse)
    }
}

/// Interpret reviewer output. Pure.
pub fn parse(output: &str) -> Decision {
    let fields: Vec<&str> = DECISION_REGEX
        .captures_iter(output)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect();

    if !fields.is_empty() {
        let verdicts: Vec<Option<Verdict>> = fields.iter().map(|f| Verdict::from_field(f)).collect();
        return match verdicts.first().copied().flatten() {
            Some(first) if verdicts.iter().all(|v| *v == Some(first)) => Decision {
                verdict: first,
                source: DecisionSource::Delimited,
                ambiguity: None,
            },
            _ => Decision::ambiguous(format!(
                "conflicting or unrecognized decision fields: {}",
                fields.join(", ")
            )),
        };
    }

    let approved = APPROVED_REGEX.is_match(output);
    let needs_changes = NEEDS_CHANGES_REGEX.is_match(output);
    match (approved, needs_changes) {
        (true, false) => Decision {
            verdict: Verdict::Approved,
            source: DecisionSource::Keyword,
            ambiguity: None,
        },
        (false, true) => Decision {
            verdict: Verdict::NeedsChanges,
            source: DecisionSource::Keyword,
            ambiguity: None,
        },
        (true, true) => Decision::ambiguous(
            "output contains both APPROVED and NEEDS-CHANGES".to_string(),
        ),
        (false, false) => {
            Decision::ambiguous("output contains no decision marker".to_string())
        }
    }
}
