//! Session and conversation controller.
//!
//! Owns who is signed in, which conversation is open, what it contains and
//! the live feeds keeping those up to date. Presentation code reads
//! [`SessionView`] snapshots and waits on [`SessionController::changes`].
//!
//! Locking rule: subscription handles are never cancelled while the state
//! lock is held. A feed delivery holds its own gate while it takes the state
//! lock, so cancelling under the state lock could deadlock.

pub mod state;

use crate::db::models::{ChatStats, Conversation, Message, ProfileUpdate, Sender, User};
use crate::error::{AuthError, PersistenceError};
use crate::llm::Inference;
use crate::remote::{RemoteService, Subscription};
use state::SessionState;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use state::{EntryStatus, SessionView, TranscriptEntry};

pub const TITLE_LIMIT: usize = 50;
pub const SEND_FAILED_REPLY: &str = "Sorry, I couldn't process your request. Please try again.";

/// First `TITLE_LIMIT` characters of the message.
pub fn draft_title(text: &str) -> String {
    text.chars().take(TITLE_LIMIT).collect()
}

/// Draft title with an ellipsis when the message was cut.
pub fn conversation_title(text: &str) -> String {
    let mut title = draft_title(text);
    if text.chars().count() > TITLE_LIMIT {
        title.push_str("...");
    }
    title
}

struct Inner {
    remote: Arc<dyn RemoteService>,
    inference: Arc<dyn Inference>,
    state: Mutex<SessionState>,
    revision: watch::Sender<u64>,
    auth_watch: Mutex<Option<Subscription>>,
}

impl Inner {
    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let result = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut state)
        };
        self.revision.send_modify(|rev| *rev += 1);
        result
    }

    fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn apply_conversations(&self, token: u64, conversations: Vec<Conversation>) {
        self.update(|s| {
            if s.list_feed.accepts(token) {
                debug!(count = conversations.len(), "conversation snapshot");
                s.conversations = conversations;
            }
        });
    }

    fn apply_transcript(&self, token: u64, messages: Vec<Message>) {
        self.update(|s| {
            if s.transcript_feed.accepts(token) {
                debug!(count = messages.len(), "transcript snapshot");
                s.replace_transcript(messages);
            }
        });
    }
}

fn cancel_all(handles: impl IntoIterator<Item = Subscription>) {
    for handle in handles {
        handle.cancel();
    }
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(remote: Arc<dyn RemoteService>, inference: Arc<dyn Inference>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                remote,
                inference,
                state: Mutex::new(SessionState::default()),
                revision,
                auth_watch: Mutex::new(None),
            }),
        }
    }

    pub fn view(&self) -> SessionView {
        self.inner.read(SessionState::view)
    }

    /// Revision counter bumped after every state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    // ── Auth ──

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let user = self.inner.remote.sign_in(email, password).await.map_err(|e| {
            warn!(error = %e, "sign-in failed");
            e
        })?;
        self.establish(user.clone()).await;
        Ok(user)
    }

    pub async fn sign_up(&self, email: &str, password: &str, name: &str) -> Result<User, AuthError> {
        let user = self
            .inner
            .remote
            .sign_up(email, password, name)
            .await
            .map_err(|e| {
                warn!(error = %e, "sign-up failed");
                e
            })?;
        self.establish(user.clone()).await;
        Ok(user)
    }

    async fn establish(&self, user: User) {
        info!(user_id = %user.id, "session started");
        let (stale, epoch) = self.inner.update(|s| {
            let stale = s.reset();
            s.user = Some(user.clone());
            (stale, s.epoch)
        });
        cancel_all(stale);

        self.attach_conversation_feed(&user.id);
        self.load_stats(&user.id, epoch).await;
    }

    /// Ends the session locally no matter what the remote sign-out does.
    pub async fn sign_out(&self) {
        let stale = self.inner.update(SessionState::reset);
        cancel_all(stale);
        match self.inner.remote.sign_out().await {
            Ok(()) => info!("session ended"),
            Err(e) => warn!(error = %e, "remote sign-out failed; local session cleared anyway"),
        }
    }

    /// Follows the backend's auth state; an external sign-out clears the
    /// session just like [`sign_out`](Self::sign_out).
    pub fn watch_auth(&self) {
        let weak = self.weak();
        let handle = self
            .inner
            .remote
            .on_auth_change(Box::new(move |user: Option<User>| {
                let Some(inner) = weak.upgrade() else { return };
                if user.is_some() {
                    return;
                }
                let stale = inner.update(|s| if s.user.is_some() { s.reset() } else { Vec::new() });
                if !stale.is_empty() {
                    info!("signed out by the auth service");
                }
                cancel_all(stale);
            }));
        let previous = self
            .inner
            .auth_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<(), PersistenceError> {
        let Some(user) = self.inner.read(|s| s.user.clone()) else {
            return Ok(());
        };
        self.inner.remote.update_profile(&user.id, &update).await?;
        self.inner.update(|s| {
            if let Some(current) = s.user.as_mut().filter(|u| u.id == user.id) {
                if let Some(name) = update.name {
                    current.name = name;
                }
                if let Some(avatar) = update.avatar {
                    current.avatar = avatar;
                }
            }
        });
        Ok(())
    }

    // ── Stats ──

    async fn load_stats(&self, user_id: &str, epoch: u64) {
        match self.inner.remote.get_stats(user_id).await {
            Ok(stats) => self.store_stats(epoch, stats),
            Err(e) => warn!(error = %e, "failed to load chat stats"),
        }
    }

    fn store_stats(&self, epoch: u64, stats: ChatStats) {
        self.inner.update(|s| {
            if s.epoch == epoch {
                s.stats = Some(stats);
            }
        });
    }

    /// Re-fetches the aggregate counters on demand.
    pub async fn refresh_stats(&self) {
        let Some((user, epoch)) = self.inner.read(|s| Some((s.user.clone()?, s.epoch))) else {
            return;
        };
        self.load_stats(&user.id, epoch).await;
    }

    // ── Feeds ──

    fn attach_conversation_feed(&self, user_id: &str) {
        let (token, previous) = self.inner.update(|s| {
            let previous = s.list_feed.release();
            let token = s.claim_token();
            s.list_feed.token = Some(token);
            (token, previous)
        });
        cancel_all(previous);

        let weak = self.weak();
        let subscribed = self.inner.remote.subscribe_conversations(
            user_id,
            Box::new(move |conversations| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_conversations(token, conversations);
                }
            }),
        );
        match subscribed {
            Ok(handle) => {
                let superseded = self.inner.update(|s| s.list_feed.install(token, handle));
                cancel_all(superseded);
            }
            Err(e) => {
                warn!(error = %e, "failed to subscribe to conversations");
                self.inner.update(|s| {
                    if s.list_feed.accepts(token) {
                        s.list_feed.token = None;
                    }
                });
            }
        }
    }

    /// Subscribes the transcript to `conversation_id` under an already
    /// claimed `token`.
    fn subscribe_transcript(&self, conversation_id: &str, token: u64) {
        let weak = self.weak();
        let subscribed = self.inner.remote.subscribe_messages(
            conversation_id,
            Box::new(move |messages| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_transcript(token, messages);
                }
            }),
        );
        match subscribed {
            Ok(handle) => {
                let superseded = self.inner.update(|s| s.transcript_feed.install(token, handle));
                cancel_all(superseded);
            }
            Err(e) => {
                warn!(error = %e, conversation_id, "failed to subscribe to messages");
                self.inner.update(|s| {
                    if s.transcript_feed.accepts(token) {
                        s.transcript_feed.token = None;
                    }
                });
            }
        }
    }

    // ── Conversations ──

    /// Closes the open conversation. Leaves the conversation list alone and
    /// makes no remote calls.
    pub fn start_new_conversation(&self) {
        let previous = self.inner.update(SessionState::close_conversation);
        cancel_all(previous);
    }

    /// Opens `conversation_id`; its transcript follows the live feed.
    pub fn open_conversation(&self, conversation_id: &str) {
        let claimed = self.inner.update(|s| {
            s.user.as_ref()?;
            s.active_conversation = Some(conversation_id.to_string());
            s.transcript.clear();
            let previous = s.transcript_feed.release();
            let token = s.claim_token();
            s.transcript_feed.token = Some(token);
            Some((token, previous))
        });
        let Some((token, previous)) = claimed else {
            debug!(conversation_id, "ignoring open without a signed-in user");
            return;
        };
        cancel_all(previous);
        self.subscribe_transcript(conversation_id, token);
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), PersistenceError> {
        if let Err(e) = self.inner.remote.delete_conversation(conversation_id).await {
            warn!(error = %e, conversation_id, "failed to delete conversation");
            return Err(e);
        }
        let previous = self.inner.update(|s| {
            if s.active_conversation.as_deref() == Some(conversation_id) {
                s.close_conversation()
            } else {
                None
            }
        });
        cancel_all(previous);
        Ok(())
    }

    pub async fn rename_active_conversation(&self, title: &str) -> Result<(), PersistenceError> {
        let Some(id) = self.inner.read(|s| s.active_conversation.clone()) else {
            return Ok(());
        };
        self.inner.remote.rename_conversation(&id, title).await
    }

    // ── Messages ──

    /// Sends one user turn and records the assistant's reply.
    ///
    /// Blank text or a missing user makes this a no-op. Failures surface as
    /// an error entry in the transcript, never as an `Err`.
    pub async fn send_message(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let started = self.inner.update(|s| {
            let user = s.user.clone()?;
            s.sends_in_flight += 1;
            s.transcript.push(TranscriptEntry::pending(Sender::User, text));
            Some((user, s.active_conversation.clone(), s.epoch))
        });
        let Some((user, target, epoch)) = started else {
            return;
        };

        let mut conversation = target;
        let outcome = self.relay(&user, &mut conversation, epoch, text).await;

        self.inner.update(|s| {
            if s.epoch != epoch {
                return;
            }
            if let Err(e) = &outcome {
                warn!(error = %e, "failed to send message");
                if s.shows(epoch, conversation.as_deref()) {
                    s.transcript.push(TranscriptEntry::error(SEND_FAILED_REPLY));
                }
            }
            s.sends_in_flight = s.sends_in_flight.saturating_sub(1);
        });
    }

    async fn relay(
        &self,
        user: &User,
        conversation: &mut Option<String>,
        epoch: u64,
        text: &str,
    ) -> Result<(), PersistenceError> {
        let remote = &self.inner.remote;
        let is_new = conversation.is_none();

        let conversation_id = match conversation.clone() {
            Some(id) => {
                remote
                    .append_message(&id, &user.id, text, Sender::User)
                    .await?;
                id
            }
            None => {
                let id = remote
                    .create_conversation(&user.id, &draft_title(text), text)
                    .await?;
                let claimed = self.inner.update(|s| {
                    if !s.shows(epoch, None) {
                        return None;
                    }
                    s.active_conversation = Some(id.clone());
                    let previous = s.transcript_feed.release();
                    let token = s.claim_token();
                    s.transcript_feed.token = Some(token);
                    Some((token, previous))
                });
                *conversation = Some(id.clone());
                if let Some((token, previous)) = claimed {
                    info!(conversation_id = %id, "conversation created");
                    cancel_all(previous);
                    self.subscribe_transcript(&id, token);
                }
                id
            }
        };

        let reply = self.inner.inference.complete(text).await;
        self.inner.update(|s| {
            if s.shows(epoch, Some(&conversation_id)) {
                s.transcript.push(TranscriptEntry::pending(Sender::Assistant, &reply));
            }
        });
        remote
            .append_message(&conversation_id, &user.id, &reply, Sender::Assistant)
            .await?;

        if is_new {
            remote
                .rename_conversation(&conversation_id, &conversation_title(text))
                .await?;
        }
        Ok(())
    }
}
