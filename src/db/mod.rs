pub mod models;

use chrono::{DateTime, Utc};
use models::{Conversation, Message, ProfileUpdate, Sender, User};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const CONVERSATION_COLUMNS: &str =
    "id, user_id, title, message_count, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, user_id, sender, text, timestamp";
const USER_COLUMNS: &str = "id, email, name, avatar";

/// Stored password material for one account.
pub struct Credentials {
    pub user: User,
    pub password_hash: String,
    pub salt: String,
}

pub struct Database {
    conn: Mutex<Connection>,
    last_timestamp: AtomicI64,
}

impl Database {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
            last_timestamp: AtomicI64::new(0),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unix milliseconds, strictly increasing per database handle so that
    /// snapshot ordering by time never ties. Taken while the connection is
    /// held so commit order and time order agree.
    fn next_timestamp(&self, _held: &Connection) -> i64 {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                avatar TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );
            CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, updated_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                sender TEXT NOT NULL CHECK (sender IN ('user', 'assistant')),
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, timestamp);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        if let Ok(Some(max)) = conn.query_row(
            "SELECT MAX(m) FROM (
                SELECT MAX(timestamp) AS m FROM messages
                UNION ALL SELECT MAX(updated_at) FROM chats
             )",
            [],
            |row| row.get::<_, Option<i64>>(0),
        ) {
            self.last_timestamp.store(max, Ordering::SeqCst);
        }
        Ok(())
    }

    // ── Users ──

    pub fn insert_user(
        &self,
        email: &str,
        name: &str,
        avatar: &str,
        password_hash: &str,
        salt: &str,
    ) -> Result<User> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn();
        let now = self.next_timestamp(&conn);
        conn.execute(
            "INSERT INTO users (id, email, name, avatar, password_hash, salt, created_at, last_seen, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)",
            params![id, email, name, avatar, password_hash, salt, now],
        )?;
        Ok(User {
            id,
            email: email.to_string(),
            name: name.to_string(),
            avatar: avatar.to_string(),
        })
    }

    pub fn email_exists(&self, email: &str) -> Result<bool> {
        self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1)",
            params![email],
            |row| row.get(0),
        )
    }

    pub fn find_credentials(&self, email: &str) -> Result<Option<Credentials>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {}, password_hash, salt FROM users WHERE email = ?1",
                    USER_COLUMNS
                ),
                params![email],
                |row| {
                    Ok(Credentials {
                        user: user_from_row(row)?,
                        password_hash: row.get(4)?,
                        salt: row.get(5)?,
                    })
                },
            )
            .optional()
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                user_from_row,
            )
            .optional()
    }

    pub fn touch_last_seen(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        let now = self.next_timestamp(&conn);
        conn.execute(
            "UPDATE users SET last_seen = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// Returns false when no such user exists.
    pub fn update_user(&self, id: &str, update: &ProfileUpdate) -> Result<bool> {
        let conn = self.conn();
        let now = self.next_timestamp(&conn);
        let changed = conn.execute(
            "UPDATE users SET name = COALESCE(?1, name), avatar = COALESCE(?2, avatar), updated_at = ?3
             WHERE id = ?4",
            params![update.name, update.avatar, now, id],
        )?;
        Ok(changed > 0)
    }

    // ── Conversations ──

    /// Creates the conversation together with its first user message.
    pub fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
        first_message: &str,
    ) -> Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.conn();
        let now = self.next_timestamp(&conn);
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chats (id, user_id, title, message_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)",
            params![id, user_id, title, now],
        )?;
        tx.execute(
            "INSERT INTO messages (id, chat_id, user_id, sender, text, timestamp)
             VALUES (?1, ?2, ?3, 'user', ?4, ?5)",
            params![uuid::Uuid::new_v4().to_string(), id, user_id, first_message, now],
        )?;
        let conv = tx.query_row(
            &format!("SELECT {} FROM chats WHERE id = ?1", CONVERSATION_COLUMNS),
            params![id],
            conversation_from_row,
        )?;
        tx.commit()?;
        Ok(conv)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM chats WHERE id = ?1", CONVERSATION_COLUMNS),
                params![id],
                conversation_from_row,
            )
            .optional()
    }

    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chats WHERE user_id = ?1 ORDER BY updated_at DESC, rowid DESC",
            CONVERSATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], conversation_from_row)?;
        rows.collect()
    }

    pub fn message_counts(&self, user_id: &str) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT message_count FROM chats WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        rows.collect()
    }

    /// Deletes the conversation's messages, then the conversation itself.
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![id])?;
        tx.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
        tx.commit()
    }

    /// Returns false when no such conversation exists.
    pub fn update_conversation_title(&self, id: &str, title: &str) -> Result<bool> {
        let conn = self.conn();
        let now = self.next_timestamp(&conn);
        let changed = conn.execute(
            "UPDATE chats SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now, id],
        )?;
        Ok(changed > 0)
    }

    // ── Messages ──

    /// Appends a message and bumps the owning conversation's counter and
    /// update time in the same transaction.
    pub fn add_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        sender: Sender,
        text: &str,
    ) -> Result<Option<Message>> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.conn();
        let now = self.next_timestamp(&conn);
        let tx = conn.transaction()?;
        let touched = tx.execute(
            "UPDATE chats SET message_count = message_count + 1, updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;
        if touched == 0 {
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO messages (id, chat_id, user_id, sender, text, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, conversation_id, user_id, sender.as_str(), text, now],
        )?;
        tx.commit()?;
        Ok(Some(Message {
            id,
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            sender,
            text: text.to_string(),
            timestamp: timestamp(now),
        }))
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE chat_id = ?1 ORDER BY timestamp ASC, rowid ASC",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![conversation_id], message_from_row)?;
        rows.collect()
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn user_from_row(row: &Row<'_>) -> Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        avatar: row.get(3)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        message_count: row.get(3)?,
        created_at: timestamp(row.get(4)?),
        updated_at: timestamp(row.get(5)?),
    })
}

fn message_from_row(row: &Row<'_>) -> Result<Message> {
    let sender: String = row.get(3)?;
    let sender = sender
        .parse::<Sender>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        sender,
        text: row.get(4)?,
        timestamp: timestamp(row.get(5)?),
    })
}
