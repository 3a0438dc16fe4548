use crate::db::models::{ChatStats, Conversation, Message, Sender, User};
use crate::remote::Subscription;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Delivered by the latest snapshot.
    Confirmed,
    /// Appended locally, not yet seen in a snapshot.
    Pending,
    /// Local failure notice; never persisted.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: EntryStatus,
}

impl TranscriptEntry {
    pub fn confirmed(message: Message) -> Self {
        Self {
            id: message.id,
            sender: message.sender,
            text: message.text,
            timestamp: message.timestamp,
            status: EntryStatus::Confirmed,
        }
    }

    pub fn pending(sender: Sender, text: &str) -> Self {
        Self::local(sender, text, EntryStatus::Pending)
    }

    pub fn error(text: &str) -> Self {
        Self::local(Sender::Assistant, text, EntryStatus::Error)
    }

    fn local(sender: Sender, text: &str, status: EntryStatus) -> Self {
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            sender,
            text: text.to_string(),
            timestamp: Utc::now(),
            status,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == EntryStatus::Error
    }
}

/// Everything one signed-in session owns. Discarded wholesale on sign-out.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub user: Option<User>,
    pub active_conversation: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub conversations: Vec<Conversation>,
    pub stats: Option<ChatStats>,
    pub sends_in_flight: usize,
    /// Bumped whenever the signed-in identity changes.
    pub epoch: u64,
    pub list_feed: FeedSlot,
    pub transcript_feed: FeedSlot,
    next_token: u64,
}

/// A live feed slot. The token is claimed before subscribing so the very
/// first delivery can be matched; deliveries carrying any other token are
/// ignored.
#[derive(Debug, Default)]
pub(crate) struct FeedSlot {
    pub token: Option<u64>,
    pub handle: Option<Subscription>,
}

impl FeedSlot {
    pub fn accepts(&self, token: u64) -> bool {
        self.token == Some(token)
    }

    /// Releases the slot, returning the handle for the caller to cancel
    /// once the state lock is dropped.
    pub fn release(&mut self) -> Option<Subscription> {
        self.token = None;
        self.handle.take()
    }

    /// Stores `handle` if `token` still owns the slot; otherwise hands it
    /// back for cancellation.
    pub fn install(&mut self, token: u64, handle: Subscription) -> Option<Subscription> {
        if self.accepts(token) {
            self.handle = Some(handle);
            None
        } else {
            Some(handle)
        }
    }
}

impl SessionState {
    pub fn claim_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub fn replace_transcript(&mut self, mut messages: Vec<Message>) {
        messages.sort_by_key(|m| m.timestamp);
        self.transcript = messages.into_iter().map(TranscriptEntry::confirmed).collect();
    }

    /// Whether local entries produced for `conversation` during `epoch`
    /// belong on screen right now.
    pub fn shows(&self, epoch: u64, conversation: Option<&str>) -> bool {
        self.epoch == epoch && self.active_conversation.as_deref() == conversation
    }

    /// Drops the open conversation but keeps the conversation list.
    pub fn close_conversation(&mut self) -> Option<Subscription> {
        self.active_conversation = None;
        self.transcript.clear();
        self.transcript_feed.release()
    }

    /// Clears every piece of session data and starts a new epoch.
    pub fn reset(&mut self) -> Vec<Subscription> {
        let handles = [self.list_feed.release(), self.transcript_feed.release()]
            .into_iter()
            .flatten()
            .collect();
        let epoch = self.epoch + 1;
        let next_token = self.next_token;
        *self = SessionState {
            epoch,
            next_token,
            ..SessionState::default()
        };
        handles
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            user: self.user.clone(),
            active_conversation_id: self.active_conversation.clone(),
            transcript: self.transcript.clone(),
            conversations: self.conversations.clone(),
            stats: self.stats.clone(),
            pending: self.sends_in_flight > 0,
            listening_conversations: self.list_feed.handle.is_some(),
            listening_transcript: self.transcript_feed.handle.is_some(),
        }
    }
}

/// Render-ready copy of the session, free of live handles.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionView {
    pub user: Option<User>,
    pub active_conversation_id: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub conversations: Vec<Conversation>,
    pub stats: Option<ChatStats>,
    pub pending: bool,
    pub listening_conversations: bool,
    pub listening_transcript: bool,
}

impl SessionView {
    pub fn active_conversation(&self) -> Option<&Conversation> {
        let id = self.active_conversation_id.as_deref()?;
        self.conversations.iter().find(|c| c.id == id)
    }
}
