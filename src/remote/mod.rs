//! Facade over the auth + document-store service.
//!
//! Every operation maps onto one action against the backing service. Live
//! feeds hand back a [`Subscription`]; once it is cancelled the callback is
//! never invoked again.

pub mod local;
pub mod subscription;

use crate::db::models::{ChatStats, Conversation, Message, ProfileUpdate, Sender, User};
use crate::error::{AuthError, PersistenceError};
use async_trait::async_trait;

pub use local::LocalRemote;
pub use subscription::Subscription;

pub type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

#[async_trait]
pub trait RemoteService: Send + Sync {
    // ── Auth ──

    async fn sign_up(&self, email: &str, password: &str, name: &str) -> Result<User, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    fn current_user(&self) -> Option<User>;

    /// Delivers the current auth state right away, then every change.
    fn on_auth_change(&self, callback: Callback<Option<User>>) -> Subscription;

    // ── Profiles ──

    async fn get_profile(&self, user_id: &str) -> Result<Option<User>, PersistenceError>;

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), PersistenceError>;

    // ── Conversations ──

    /// Creates the conversation and persists `first_message` as its first
    /// user message. Returns the new conversation id.
    async fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
        first_message: &str,
    ) -> Result<String, PersistenceError>;

    /// Most recently updated first.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, PersistenceError>;

    fn subscribe_conversations(
        &self,
        user_id: &str,
        callback: Callback<Vec<Conversation>>,
    ) -> Result<Subscription, PersistenceError>;

    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), PersistenceError>;

    /// Removes every message of the conversation, then the conversation.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), PersistenceError>;

    // ── Messages ──

    /// Oldest first.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, PersistenceError>;

    fn subscribe_messages(
        &self,
        conversation_id: &str,
        callback: Callback<Vec<Message>>,
    ) -> Result<Subscription, PersistenceError>;

    /// Appends a message, incrementing the conversation's message count and
    /// bumping its update time. Returns the new message id.
    async fn append_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        text: &str,
        sender: Sender,
    ) -> Result<String, PersistenceError>;

    // ── Stats ──

    async fn get_stats(&self, user_id: &str) -> Result<ChatStats, PersistenceError>;
}
