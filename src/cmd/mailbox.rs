//! Mailbox commands: `reviewd send`, `reviewd list`, `reviewd read`, `reviewd thread`.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use console::style;
use std::path::Path;

use reviewd::config::Config;
use reviewd::mailbox::{
    EventType, ListFilter, Mailbox, Message, MessageSummary, StoredMessage, collect_thread,
    parse_since,
};

/// Fields of `reviewd send`.
#[derive(Debug)]
pub struct SendRequest<'a> {
    pub to: &'a str,
    pub artifact: &'a str,
    pub event: &'a str,
    pub from: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub context: Option<&'a str>,
    pub session: Option<&'a str>,
    pub body: Option<&'a str>,
}

pub fn cmd_send(repo_dir: &Path, request: &SendRequest<'_>) -> Result<()> {
    let config = Config::new(repo_dir.to_path_buf(), false)?;
    let event: EventType = request.event.parse()?;

    let mut message = Message::new(event, request.to, request.artifact);
    if let Some(from) = request.from {
        message = message.with_from(from);
    }
    if let Some(subject) = request.subject {
        message = message.with_subject(subject);
    }
    if let Some(context) = request.context {
        message = message.with_context(context);
    }
    if let Some(session) = request.session {
        message = message.with_session_id(session);
    }
    if let Some(body) = request.body {
        message = message.with_body(body);
    }

    let mailbox = Mailbox::new(&config.mailbox_root, &message.to);
    let id = mailbox
        .deliver(&message)
        .with_context(|| format!("Failed to deliver to {}", message.to))?;
    println!("Delivered {} to {} ({})", event, message.to, id);
    Ok(())
}

pub fn build_list_filter(
    event: Option<&str>,
    artifact: Option<String>,
    from: Option<String>,
    unprocessed: bool,
    since: Option<&str>,
    limit: usize,
) -> Result<ListFilter> {
    let event_type = event.map(str::parse::<EventType>).transpose()?;
    let since = since.map(|raw| parse_since(raw, Utc::now())).transpose()?;
    Ok(ListFilter {
        event_type,
        artifact,
        from,
        processed: unprocessed.then_some(false),
        since,
        limit: Some(limit),
    })
}

pub fn cmd_list(repo_dir: &Path, role: &str, filter: &ListFilter, json: bool) -> Result<()> {
    let config = Config::new(repo_dir.to_path_buf(), false)?;
    let rows = Mailbox::new(&config.mailbox_root, role).list(filter)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No messages for {}", role);
        return Ok(());
    }

    println!();
    println!(
        "{:<20} {:<22} {:<18} {:<10} Artifact",
        "Date", "Event", "From", "State"
    );
    println!(
        "{:<20} {:<22} {:<18} {:<10} --------",
        "----", "-----", "----", "-----"
    );
    for row in &rows {
        println!(
            "{:<20} {:<22} {:<18} {:<10} {}",
            format_date(row),
            row.event_type.as_str(),
            row.from.as_deref().unwrap_or("-"),
            state_label(row),
            row.artifact
        );
    }
    println!();
    Ok(())
}

pub fn cmd_read(repo_dir: &Path, role: &str, id: &str, json: bool) -> Result<()> {
    let config = Config::new(repo_dir.to_path_buf(), false)?;
    let Some(stored) = Mailbox::new(&config.mailbox_root, role).read(id)? else {
        bail!("No message '{}' in {}'s mailbox", id, role);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&stored.message)?);
        return Ok(());
    }
    print_message(&stored);
    Ok(())
}

pub fn cmd_thread(repo_dir: &Path, role: &str, key: &str, json: bool) -> Result<()> {
    let config = Config::new(repo_dir.to_path_buf(), false)?;
    let thread = collect_thread(&config.mailbox_root, role, key)?;
    if thread.is_empty() {
        bail!("No message or session '{}' in {}'s mailbox", key, role);
    }

    if json {
        let messages: Vec<&Message> = thread.iter().map(|m| &m.message).collect();
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }

    println!("Thread with {} message(s):", thread.len());
    for stored in &thread {
        println!();
        print_message(stored);
    }
    Ok(())
}

fn print_message(stored: &StoredMessage) {
    let row = stored.summary();
    let msg = &stored.message;
    println!("{} {}", style("Message-ID:").bold(), msg.id);
    println!("{} {}", style("Date:").bold(), format_date(&row));
    println!("{} {}", style("From:").bold(), msg.from.as_deref().unwrap_or("-"));
    println!("{} {}", style("To:").bold(), msg.to);
    println!("{} {}", style("Event:").bold(), msg.event_type);
    println!("{} {}", style("Artifacts:").bold(), msg.artifacts.join(", "));
    if let Some(ref subject) = msg.subject {
        println!("{} {}", style("Subject:").bold(), subject);
    }
    if let Some(ref session) = msg.session_id {
        println!("{} {}", style("Session:").bold(), session);
    }
    if let Some(ref parent) = msg.in_reply_to {
        println!("{} {}", style("In-Reply-To:").bold(), parent);
    }
    println!("{} {}", style("State:").bold(), state_label(&row));
    if !msg.body.trim().is_empty() {
        println!();
        println!("{}", msg.body.trim_end());
    }
}

fn format_date(row: &MessageSummary) -> String {
    row.date
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn state_label(row: &MessageSummary) -> String {
    if row.processed {
        style("processed").dim().to_string()
    } else if row.seen {
        style("pending").yellow().to_string()
    } else {
        style("new").green().to_string()
    }
}
