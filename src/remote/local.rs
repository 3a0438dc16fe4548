use super::{Callback, RemoteService, Subscription};
use crate::db::models::{ChatStats, Conversation, Message, ProfileUpdate, Sender, User};
use crate::db::Database;
use crate::error::{AuthError, PersistenceError};
use async_trait::async_trait;
use futures::Stream;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const MAX_FAILED_SIGN_INS: u32 = 5;
const MIN_PASSWORD_LEN: usize = 6;
const CHANGE_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Conversations { user_id: String },
    Messages { conversation_id: String },
}

type ChangeFilter = Box<dyn Fn(&Change) -> bool + Send + Sync>;
type SnapshotQuery<T> = Box<dyn Fn(&Database) -> rusqlite::Result<Vec<T>> + Send + Sync>;

/// Re-runs a query every time a matching change is published.
struct SnapshotFeed<T> {
    db: Arc<Database>,
    changes: broadcast::Receiver<Change>,
    filter: ChangeFilter,
    query: SnapshotQuery<T>,
    initial: Option<Vec<T>>,
}

impl<T> SnapshotFeed<T> {
    async fn next_snapshot(&mut self) -> Option<Vec<T>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.changes.recv().await {
                Ok(change) if (self.filter)(&change) => {}
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "snapshot feed lagged, re-querying");
                }
                Err(RecvError::Closed) => return None,
            }
            match (self.query)(&self.db) {
                Ok(items) => return Some(items),
                Err(e) => warn!(error = %e, "snapshot query failed, waiting for next change"),
            }
        }
    }

    fn into_stream(self) -> impl Stream<Item = Vec<T>> + Send + 'static
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut feed| async move {
            let snapshot = feed.next_snapshot().await?;
            Some((snapshot, feed))
        })
    }
}

/// Auth and document store backed by the embedded SQLite database.
pub struct LocalRemote {
    db: Arc<Database>,
    changes: broadcast::Sender<Change>,
    auth: watch::Sender<Option<User>>,
    failed_sign_ins: Mutex<HashMap<String, u32>>,
}

impl LocalRemote {
    pub fn new(db: Arc<Database>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        let (auth, _) = watch::channel(None);
        Self {
            db,
            changes,
            auth,
            failed_sign_ins: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        Ok(Self::new(Arc::new(Database::new(path)?)))
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Ok(Self::new(Arc::new(Database::open_in_memory()?)))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn publish(&self, change: Change) {
        // No receivers just means nobody is subscribed.
        let _ = self.changes.send(change);
    }

    fn publish_conversation(&self, conversation: &Conversation) {
        self.publish(Change::Messages {
            conversation_id: conversation.id.clone(),
        });
        self.publish(Change::Conversations {
            user_id: conversation.user_id.clone(),
        });
    }

    fn subscribe_feed<T>(
        &self,
        filter: ChangeFilter,
        query: SnapshotQuery<T>,
        callback: Callback<Vec<T>>,
    ) -> Result<Subscription, PersistenceError>
    where
        T: Send + 'static,
    {
        // Subscribe before the initial query so no change slips in between.
        let changes = self.changes.subscribe();
        let initial = query(&self.db)?;
        let feed = SnapshotFeed {
            db: Arc::clone(&self.db),
            changes,
            filter,
            query,
            initial: Some(initial),
        };
        Ok(Subscription::spawn(feed.into_stream(), callback))
    }

    fn record_failed_sign_in(&self, email: &str) {
        let mut failed = self
            .failed_sign_ins
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *failed.entry(email.to_string()).or_default() += 1;
    }

    fn failed_sign_ins(&self, email: &str) -> u32 {
        self.failed_sign_ins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(email)
            .copied()
            .unwrap_or(0)
    }

    fn clear_failed_sign_ins(&self, email: &str) {
        self.failed_sign_ins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(email);
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn avatar_url(name: &str) -> String {
    format!(
        "https://api.dicebear.com/7.x/initials/svg?seed={}",
        urlencoding::encode(name)
    )
}

#[async_trait]
impl RemoteService for LocalRemote {
    async fn sign_up(&self, email: &str, password: &str, name: &str) -> Result<User, AuthError> {
        let email = normalize_email(email);
        if !User::is_valid_email(&email) {
            return Err(AuthError::InvalidEmail);
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        if self.db.email_exists(&email).map_err(PersistenceError::from)? {
            return Err(AuthError::EmailAlreadyInUse);
        }

        let name = match name.trim() {
            "" => email.split('@').next().unwrap_or_default().to_string(),
            trimmed => trimmed.to_string(),
        };
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let user = self
            .db
            .insert_user(
                &email,
                &name,
                &avatar_url(&name),
                &hash_password(&salt, password),
                &salt,
            )
            .map_err(PersistenceError::from)?;

        info!(user_id = %user.id, "user signed up");
        self.auth.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email = normalize_email(email);
        if self.failed_sign_ins(&email) >= MAX_FAILED_SIGN_INS {
            return Err(AuthError::TooManyAttempts);
        }

        let Some(credentials) = self
            .db
            .find_credentials(&email)
            .map_err(PersistenceError::from)?
        else {
            // Unknown emails are not tracked.
            return Err(AuthError::UserNotFound);
        };

        if hash_password(&credentials.salt, password) != credentials.password_hash {
            self.record_failed_sign_in(&email);
            return Err(AuthError::InvalidCredentials);
        }

        self.clear_failed_sign_ins(&email);
        if let Err(e) = self.db.touch_last_seen(&credentials.user.id) {
            warn!(error = %e, "failed to record last seen");
        }
        info!(user_id = %credentials.user.id, "user signed in");
        self.auth.send_replace(Some(credentials.user.clone()));
        Ok(credentials.user)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if let Some(user) = self.auth.send_replace(None) {
            info!(user_id = %user.id, "user signed out");
        }
        Ok(())
    }

    fn current_user(&self) -> Option<User> {
        self.auth.borrow().clone()
    }

    fn on_auth_change(&self, callback: Callback<Option<User>>) -> Subscription {
        let rx = self.auth.subscribe();
        let states = futures::stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let user = rx.borrow_and_update().clone();
            Some((user, (rx, false)))
        });
        Subscription::spawn(states, callback)
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<User>, PersistenceError> {
        Ok(self.db.get_user(user_id)?)
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<(), PersistenceError> {
        if !self.db.update_user(user_id, update)? {
            return Err(PersistenceError::NotFound(format!("user {}", user_id)));
        }
        let refreshed = self.db.get_user(user_id)?;
        self.auth.send_if_modified(|current| match (current.as_mut(), refreshed) {
            (Some(current), Some(refreshed)) if current.id == refreshed.id => {
                *current = refreshed;
                true
            }
            _ => false,
        });
        Ok(())
    }

    async fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
        first_message: &str,
    ) -> Result<String, PersistenceError> {
        let conversation = self.db.create_conversation(user_id, title, first_message)?;
        debug!(conversation_id = %conversation.id, "conversation created");
        self.publish_conversation(&conversation);
        Ok(conversation.id)
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, PersistenceError> {
        Ok(self.db.list_conversations(user_id)?)
    }

    fn subscribe_conversations(
        &self,
        user_id: &str,
        callback: Callback<Vec<Conversation>>,
    ) -> Result<Subscription, PersistenceError> {
        let owner = user_id.to_string();
        let query_owner = owner.clone();
        self.subscribe_feed(
            Box::new(move |change| {
                matches!(change, Change::Conversations { user_id } if *user_id == owner)
            }),
            Box::new(move |db| db.list_conversations(&query_owner)),
            callback,
        )
    }

    async fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), PersistenceError> {
        if !self.db.update_conversation_title(conversation_id, title)? {
            return Err(PersistenceError::NotFound(format!(
                "conversation {}",
                conversation_id
            )));
        }
        if let Some(conversation) = self.db.get_conversation(conversation_id)? {
            self.publish(Change::Conversations {
                user_id: conversation.user_id,
            });
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), PersistenceError> {
        let Some(conversation) = self.db.get_conversation(conversation_id)? else {
            return Ok(());
        };
        self.db.delete_conversation(conversation_id)?;
        debug!(conversation_id, "conversation deleted");
        self.publish_conversation(&conversation);
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, PersistenceError> {
        Ok(self.db.get_messages(conversation_id)?)
    }

    fn subscribe_messages(
        &self,
        conversation_id: &str,
        callback: Callback<Vec<Message>>,
    ) -> Result<Subscription, PersistenceError> {
        let target = conversation_id.to_string();
        let query_target = target.clone();
        self.subscribe_feed(
            Box::new(move |change| {
                matches!(change, Change::Messages { conversation_id } if *conversation_id == target)
            }),
            Box::new(move |db| db.get_messages(&query_target)),
            callback,
        )
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        text: &str,
        sender: Sender,
    ) -> Result<String, PersistenceError> {
        let message = self
            .db
            .add_message(conversation_id, user_id, sender, text)?
            .ok_or_else(|| PersistenceError::NotFound(format!("conversation {}", conversation_id)))?;
        if let Some(conversation) = self.db.get_conversation(conversation_id)? {
            self.publish_conversation(&conversation);
        }
        Ok(message.id)
    }

    async fn get_stats(&self, user_id: &str) -> Result<ChatStats, PersistenceError> {
        Ok(ChatStats::from_counts(&self.db.message_counts(user_id)?))
    }
}
