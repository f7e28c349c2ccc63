//! File-based mailbox between workflow roles.
//!
//! - `message` - the message file codec and artifact reference resolution
//! - `store` - per-role `tmp/unseen/seen` directories and processed flags
//! - `thread` - conversations across mailboxes and `--since` parsing

pub mod message;
pub mod store;
pub mod thread;

pub use message::{EventType, Message, new_message_id, resolve_artifact, role_of};
pub use store::{ListFilter, Mailbox, MessageSummary, Scan, StoredMessage};
pub use thread::{collect_thread, parse_since};
