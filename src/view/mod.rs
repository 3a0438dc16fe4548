//! Plain-text presentation derived from [`SessionView`].

pub mod auth;

use crate::db::models::{Conversation, Sender};
use crate::session::{SessionView, TranscriptEntry};
use chrono::{DateTime, Local, Utc};
use std::fmt::Write as _;

pub const MAX_INPUT_CHARS: usize = 1000;
pub const SUGGESTIONS: [&str; 3] = [
    "What can you help me with?",
    "Tell me a joke",
    "Explain quantum physics",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputRejected {
    #[error("message is empty")]
    Empty,
    #[error("wait for the current reply to finish")]
    Busy,
    #[error("message is {count} characters; the limit is 1000")]
    TooLong { count: usize },
}

/// Applies the input box rules and returns the text to send.
pub fn prepare_input(raw: &str, pending: bool) -> Result<String, InputRejected> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(InputRejected::Empty);
    }
    if pending {
        return Err(InputRejected::Busy);
    }
    let count = text.chars().count();
    if count > MAX_INPUT_CHARS {
        return Err(InputRejected::TooLong { count });
    }
    Ok(text.to_string())
}

/// `"812/1000"`, flagged once past 80% of the limit.
pub fn char_counter(text: &str) -> String {
    let count = text.chars().count();
    let flag = if count > MAX_INPUT_CHARS {
        " (too long)"
    } else if count * 10 > MAX_INPUT_CHARS * 8 {
        " (almost full)"
    } else {
        ""
    };
    format!("{}/{}{}", count, MAX_INPUT_CHARS, flag)
}

/// The counter, only once the text is past 80% of the limit.
pub fn counter_warning(text: &str) -> Option<String> {
    let count = text.chars().count();
    (count * 10 > MAX_INPUT_CHARS * 8).then(|| char_counter(text))
}

/// `HH:MM` within a day, "Yesterday" within two, otherwise the date.
pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(at);
    let local = at.with_timezone(&Local);
    if age.num_hours() < 24 {
        local.format("%H:%M").to_string()
    } else if age.num_hours() < 48 {
        "Yesterday".to_string()
    } else {
        local.format("%Y-%m-%d").to_string()
    }
}

fn conversation_title(conversation: &Conversation) -> &str {
    if conversation.title.trim().is_empty() {
        "New Chat"
    } else {
        &conversation.title
    }
}

pub fn render_conversation_list(view: &SessionView, now: DateTime<Utc>) -> String {
    if view.conversations.is_empty() {
        return "No chat history yet\nStart a new conversation to see it here\n".to_string();
    }
    let mut out = format!("Chat History ({} chats)\n", view.conversations.len());
    for (index, conversation) in view.conversations.iter().enumerate() {
        let marker = if view.active_conversation_id.as_deref() == Some(conversation.id.as_str()) {
            '*'
        } else {
            ' '
        };
        let _ = writeln!(
            out,
            "{}{:>3}. {}  ({} messages, {})",
            marker,
            index + 1,
            conversation_title(conversation),
            conversation.message_count,
            relative_time(conversation.updated_at, now)
        );
    }
    out
}

pub fn render_header(view: &SessionView) -> String {
    match view.active_conversation() {
        Some(conversation) => format!(
            "== {} ==\n{} | {} messages\n",
            conversation_title(conversation),
            conversation
                .created_at
                .with_timezone(&Local)
                .format("%A, %B %-d, %Y"),
            conversation.message_count
        ),
        None => "== New Chat ==\n".to_string(),
    }
}

pub fn render_bubble(entry: &TranscriptEntry) -> String {
    let who = match entry.sender {
        Sender::User => "You",
        Sender::Assistant => "AI",
    };
    let time = entry.timestamp.with_timezone(&Local).format("%H:%M");
    let mut out = if entry.is_error() {
        format!("[{}] {} (error):\n", time, who)
    } else {
        format!("[{}] {}:\n", time, who)
    };
    for line in entry.text.lines() {
        let _ = writeln!(out, "  {}", line);
    }
    out
}

pub fn render_transcript(view: &SessionView) -> String {
    let mut out = String::new();
    if view.transcript.is_empty() {
        out.push_str("Welcome to AI Chatbot!\n");
        out.push_str("I'm here to help you with any questions. Just type your message below and I'll respond.\n");
        out.push_str("Try one of these:\n");
        for suggestion in SUGGESTIONS {
            let _ = writeln!(out, "  - {}", suggestion);
        }
    } else {
        for entry in &view.transcript {
            out.push_str(&render_bubble(entry));
        }
    }
    if view.pending {
        out.push_str("AI is typing...\n");
    }
    out
}

pub fn render_user_line(view: &SessionView) -> String {
    let Some(user) = &view.user else {
        return "Not signed in\n".to_string();
    };
    let mut out = format!("{} <{}>", user.name, user.email);
    if let Some(stats) = &view.stats {
        let _ = write!(
            out,
            " | {} chats • {} messages",
            stats.total_conversations, stats.total_messages
        );
    }
    out.push('\n');
    out
}
