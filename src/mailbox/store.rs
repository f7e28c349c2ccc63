//! Per-role mailbox directories.
//!
//! Each role owns `<mailbox_root>/<role>/{tmp,unseen,seen}`. Senders write a
//! message into `tmp/` and rename it into `unseen/`, so a reader never sees a
//! half-written file. Draining renames `unseen/<id>` to `seen/<id>:2,`, and
//! marking a message processed appends the `P` flag to its name.

use super::message::{EventType, Message};
use crate::errors::ReviewError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Flag appended to the filename of a processed message.
pub const PROCESSED_FLAG: char = 'P';

const INFO_SEPARATOR: &str = ":2,";

/// A decoded message together with where it lives in the mailbox.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Stable identity: the filename without flags.
    pub identity: String,
    pub path: PathBuf,
    pub flags: String,
    pub message: Message,
}

impl StoredMessage {
    pub fn is_processed(&self) -> bool {
        self.flags.contains(PROCESSED_FLAG)
    }

    /// Whether a drain has moved this message out of `unseen/`.
    pub fn is_seen(&self) -> bool {
        self.path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|dir| dir == "seen")
    }

    pub fn summary(&self) -> MessageSummary {
        let msg = &self.message;
        MessageSummary {
            identity: self.identity.clone(),
            event_type: msg.event_type,
            from: msg.from.clone(),
            to: msg.to.clone(),
            artifact: msg.artifact().to_string(),
            subject: msg.subject.clone(),
            date: msg.date,
            message_id: msg.id.clone(),
            session_id: msg.session_id.clone(),
            in_reply_to: msg.in_reply_to.clone(),
            seen: self.is_seen(),
            processed: self.is_processed(),
        }
    }
}

/// Result of scanning `seen/`: decodable messages plus the files that failed
/// to decode. Corrupt files are left in place.
#[derive(Debug, Default)]
pub struct Scan {
    pub messages: Vec<StoredMessage>,
    pub corrupt: Vec<ReviewError>,
}

/// Filters for `Mailbox::list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub event_type: Option<EventType>,
    /// Substring match against any referenced artifact
    pub artifact: Option<String>,
    pub from: Option<String>,
    /// `Some(false)` lists only unprocessed messages
    pub processed: Option<bool>,
    /// Only messages dated at or after this instant. Undated messages are excluded.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// One row of `Mailbox::list`.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub identity: String,
    pub event_type: EventType,
    pub from: Option<String>,
    pub to: String,
    pub artifact: String,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// Moved out of `unseen/` by a drain
    pub seen: bool,
    pub processed: bool,
}

/// The mailbox of one role.
#[derive(Debug, Clone)]
pub struct Mailbox {
    role: String,
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(root: &Path, role: &str) -> Self {
        Self {
            role: role.to_string(),
            dir: root.join(role),
        }
    }

    /// Open a role's mailbox, creating its directories if needed.
    pub fn open(root: &Path, role: &str) -> Result<Self, ReviewError> {
        let mailbox = Self::new(root, role);
        mailbox.ensure_dirs()?;
        Ok(mailbox)
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dirs(&self) -> Result<(), ReviewError> {
        for sub in ["tmp", "unseen", "seen"] {
            let path = self.dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| ReviewError::io(&path, e))?;
        }
        Ok(())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.dir.join("tmp")
    }

    fn unseen_dir(&self) -> PathBuf {
        self.dir.join("unseen")
    }

    fn seen_dir(&self) -> PathBuf {
        self.dir.join("seen")
    }

    /// Deliver a message into this mailbox. Returns the identity it is stored under.
    pub fn deliver(&self, message: &Message) -> Result<String, ReviewError> {
        self.ensure_dirs()?;
        let identity = file_identity(&message.id);
        let tmp_path = self.tmp_dir().join(&identity);
        let final_path = self.unseen_dir().join(&identity);

        if self.find_seen(&identity)?.is_some() {
            return Err(ReviewError::io(
                &final_path,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("message {} was already delivered", identity),
                ),
            ));
        }

        fs::write(&tmp_path, message.encode()).map_err(|e| ReviewError::io(&tmp_path, e))?;
        // Linking fails if the name is taken, so a duplicate never replaces a pending message.
        let linked = fs::hard_link(&tmp_path, &final_path);
        let _ = fs::remove_file(&tmp_path);
        linked.map_err(|e| ReviewError::io(&final_path, e))?;

        debug!(role = %self.role, id = %identity, event = %message.event_type, "delivered message");
        Ok(identity)
    }

    /// Move every message in `unseen/` to `seen/` with an empty flag set.
    /// Returns the identities moved. A file that cannot be moved stays in
    /// `unseen/` and is retried on the next drain.
    pub fn drain(&self) -> Result<Vec<String>, ReviewError> {
        let mut moved = Vec::new();
        for (name, path) in list_files(&self.unseen_dir())? {
            let (identity, _) = split_flags(&name);
            let target = self
                .seen_dir()
                .join(format!("{}{}", identity, INFO_SEPARATOR));
            match fs::rename(&path, &target) {
                Ok(()) => moved.push(identity.to_string()),
                Err(e) => warn!(role = %self.role, id = %name, error = %e, "failed to drain message"),
            }
        }
        Ok(moved)
    }

    /// Decode every message in `seen/`.
    pub fn scan_seen(&self) -> Result<Scan, ReviewError> {
        let mut scan = Scan::default();
        for (name, path) in list_files(&self.seen_dir())? {
            match read_stored(&name, &path) {
                Ok(stored) => scan.messages.push(stored),
                Err(e) => scan.corrupt.push(e),
            }
        }
        Ok(scan)
    }

    /// Drained messages of the given event type that are not yet processed,
    /// in directory enumeration order.
    pub fn find_unprocessed(&self, event_types: &[EventType]) -> Result<Scan, ReviewError> {
        let scan = self.scan_seen()?;
        Ok(Scan {
            messages: scan
                .messages
                .into_iter()
                .filter(|m| !m.is_processed() && event_types.contains(&m.message.event_type))
                .collect(),
            corrupt: scan.corrupt,
        })
    }

    /// Set the processed flag on a drained message. Marking an already
    /// processed message is a no-op.
    pub fn mark_processed(&self, identity: &str) -> Result<(), ReviewError> {
        let Some((name, path)) = self.find_seen(identity)? else {
            return Err(ReviewError::io(
                self.seen_dir().join(identity),
                std::io::Error::new(std::io::ErrorKind::NotFound, "message not in seen/"),
            ));
        };
        let (_, flags) = split_flags(&name);
        if flags.contains(PROCESSED_FLAG) {
            return Ok(());
        }

        let mut new_flags: Vec<char> = flags.chars().chain([PROCESSED_FLAG]).collect();
        new_flags.sort_unstable();
        new_flags.dedup();
        let new_flags: String = new_flags.into_iter().collect();
        let target = self
            .seen_dir()
            .join(format!("{}{}{}", identity, INFO_SEPARATOR, new_flags));
        fs::rename(&path, &target).map_err(|e| ReviewError::io(&target, e))?;
        debug!(role = %self.role, id = %identity, "marked processed");
        Ok(())
    }

    pub fn is_processed(&self, identity: &str) -> Result<bool, ReviewError> {
        Ok(self
            .find_seen(identity)?
            .map(|(name, _)| split_flags(&name).1.contains(PROCESSED_FLAG))
            .unwrap_or(false))
    }

    /// Every decodable message in `unseen/` and `seen/`. Unreadable files
    /// are logged and skipped.
    pub fn messages(&self) -> Result<Vec<StoredMessage>, ReviewError> {
        let mut messages = Vec::new();
        for dir in [self.unseen_dir(), self.seen_dir()] {
            for (name, path) in list_files(&dir)? {
                match read_stored(&name, &path) {
                    Ok(stored) => messages.push(stored),
                    Err(e) => warn!(role = %self.role, error = %e, "skipping unreadable message"),
                }
            }
        }
        Ok(messages)
    }

    /// Find one message by file identity or `Message-ID`, pending or drained.
    pub fn read(&self, key: &str) -> Result<Option<StoredMessage>, ReviewError> {
        let key = key.trim();
        let wanted = file_identity(key);
        Ok(self
            .messages()?
            .into_iter()
            .find(|m| m.identity == wanted || m.message.id == key))
    }

    /// List messages in both `unseen/` and `seen/`, newest first.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<MessageSummary>, ReviewError> {
        let mut rows: Vec<MessageSummary> =
            self.messages()?.iter().map(StoredMessage::summary).collect();

        rows.retain(|row| filter.matches(row));
        rows.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.identity.cmp(&a.identity)));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn find_seen(&self, identity: &str) -> Result<Option<(String, PathBuf)>, ReviewError> {
        Ok(list_files(&self.seen_dir())?
            .into_iter()
            .find(|(name, _)| split_flags(name).0 == identity))
    }
}

impl ListFilter {
    fn matches(&self, row: &MessageSummary) -> bool {
        if let Some(event) = self.event_type
            && row.event_type != event
        {
            return false;
        }
        if let Some(ref artifact) = self.artifact
            && !row.artifact.contains(artifact.as_str())
        {
            return false;
        }
        if let Some(ref from) = self.from
            && row.from.as_deref() != Some(from.as_str())
        {
            return false;
        }
        if let Some(processed) = self.processed
            && row.processed != processed
        {
            return false;
        }
        if let Some(since) = self.since
            && !row.date.is_some_and(|date| date >= since)
        {
            return false;
        }
        true
    }
}

fn read_stored(name: &str, path: &Path) -> Result<StoredMessage, ReviewError> {
    let (identity, flags) = split_flags(name);
    let text = fs::read_to_string(path).map_err(|e| ReviewError::MailboxCorruption {
        message_id: identity.to_string(),
        reason: format!("unreadable: {}", e),
    })?;
    let message = Message::decode(identity, &text)?;
    Ok(StoredMessage {
        identity: identity.to_string(),
        path: path.to_path_buf(),
        flags: flags.to_string(),
        message,
    })
}

/// Regular files in a directory, skipping dotfiles. A missing directory is empty.
fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, ReviewError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ReviewError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ReviewError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.path().is_file() {
            continue;
        }
        files.push((name, entry.path()));
    }
    Ok(files)
}

/// Split `<identity>:2,<flags>` into its parts.
fn split_flags(name: &str) -> (&str, &str) {
    match name.split_once(INFO_SEPARATOR) {
        Some((identity, flags)) => (identity, flags),
        None => (name, ""),
    }
}

/// Make a message id safe to use as a filename.
fn file_identity(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .trim_matches(['<', '>'])
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        super::message::new_message_id()
    } else {
        cleaned
    }
}
