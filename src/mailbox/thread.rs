//! Conversation views across role mailboxes.

use super::store::{Mailbox, StoredMessage};
use crate::errors::ReviewError;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

static RELATIVE_SINCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)([dhm])$").unwrap());

/// Parse a `--since` value: a relative age (`7d`, `24h`, `30m`), a calendar
/// date (`2025-11-01`, midnight UTC) or an RFC 3339 timestamp.
pub fn parse_since(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ReviewError> {
    let raw = raw.trim();
    let invalid = || {
        ReviewError::Configuration(format!(
            "Invalid since value: {}. Use format like '7d', '24h', or '2025-11-01'",
            raw
        ))
    };

    if let Some(caps) = RELATIVE_SINCE.captures(raw) {
        let amount: i64 = caps[1].parse().map_err(|_| invalid())?;
        let age = match &caps[2] {
            "d" => Duration::try_days(amount),
            "h" => Duration::try_hours(amount),
            _ => Duration::try_minutes(amount),
        }
        .ok_or_else(invalid)?;
        return now.checked_sub_signed(age).ok_or_else(invalid);
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .ok_or_else(invalid);
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid())
}

/// Collect the conversation around `key`, oldest first.
///
/// The seed is looked up in `role`'s mailbox by file identity, `Message-ID`
/// or session id. The thread then grows across every mailbox under `root`:
/// a message joins when its `Message-ID` or `In-Reply-To` touches a known id,
/// or when it shares a session id with a thread member.
pub fn collect_thread(
    root: &Path,
    role: &str,
    key: &str,
) -> Result<Vec<StoredMessage>, ReviewError> {
    let key = key.trim();
    let home = Mailbox::new(root, role);
    let seeds: Vec<StoredMessage> = match home.read(key)? {
        Some(found) => vec![found],
        None => home
            .messages()?
            .into_iter()
            .filter(|m| m.message.session_id.as_deref() == Some(key))
            .collect(),
    };
    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    let mut pool = Vec::new();
    for mailbox in mailboxes(root)? {
        pool.extend(mailbox.messages()?);
    }

    let mut ids = HashSet::new();
    let mut sessions = HashSet::new();
    for seed in &seeds {
        absorb(seed, &mut ids, &mut sessions);
    }

    let mut thread: Vec<StoredMessage> = Vec::new();
    loop {
        let (joined, rest): (Vec<_>, Vec<_>) =
            pool.into_iter().partition(|m| belongs(m, &ids, &sessions));
        if joined.is_empty() {
            break;
        }
        for member in &joined {
            absorb(member, &mut ids, &mut sessions);
        }
        thread.extend(joined);
        pool = rest;
    }

    // Dates only carry whole seconds; a reply never sorts before its parent.
    let depths: HashMap<String, usize> = thread
        .iter()
        .map(|m| (m.message.id.clone(), reply_depth(m, &thread)))
        .collect();
    thread.sort_by(|a, b| {
        a.message
            .date
            .cmp(&b.message.date)
            .then_with(|| depths.get(&a.message.id).cmp(&depths.get(&b.message.id)))
            .then_with(|| a.identity.cmp(&b.identity))
    });
    Ok(thread)
}

/// Number of `In-Reply-To` hops from `m` back to a message outside `thread`.
fn reply_depth(m: &StoredMessage, thread: &[StoredMessage]) -> usize {
    let mut depth = 0;
    let mut parent = m.message.in_reply_to.as_deref();
    while let Some(id) = parent
        && depth < thread.len()
    {
        let Some(found) = thread.iter().find(|t| t.message.id == id) else {
            break;
        };
        depth += 1;
        parent = found.message.in_reply_to.as_deref();
    }
    depth
}

fn absorb(m: &StoredMessage, ids: &mut HashSet<String>, sessions: &mut HashSet<String>) {
    ids.insert(m.message.id.clone());
    if let Some(ref parent) = m.message.in_reply_to {
        ids.insert(parent.clone());
    }
    if let Some(ref session) = m.message.session_id {
        sessions.insert(session.clone());
    }
}

fn belongs(m: &StoredMessage, ids: &HashSet<String>, sessions: &HashSet<String>) -> bool {
    ids.contains(&m.message.id)
        || m.message.in_reply_to.as_ref().is_some_and(|p| ids.contains(p))
        || m.message.session_id.as_ref().is_some_and(|s| sessions.contains(s))
}

/// Every role directory under the mailbox root.
fn mailboxes(root: &Path) -> Result<Vec<Mailbox>, ReviewError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ReviewError::io(root, e)),
    };
    let mut roles = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ReviewError::io(root, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') && entry.path().is_dir() {
            roles.push(name);
        }
    }
    roles.sort();
    Ok(roles.iter().map(|role| Mailbox::new(root, role)).collect())
}
