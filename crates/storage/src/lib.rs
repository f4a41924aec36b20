use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{fs, path::Path, str::FromStr};

use shared::domain::{ChatId, MessageId, MessageKind, UserId};

pub mod offline;

pub use offline::OfflineQueue;

/// The append-only message store plus the chat-membership lookup it feeds
/// the delivery pipeline. Backed by the shared SQLite database every server
/// instance points at.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub sequence_number: i64,
    pub client_msg_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message that just became read for some user, with enough context to
/// route the read receipt back to its sender.
#[derive(Debug, Clone)]
pub struct NewlyRead {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
}

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, content, kind, file_url, sequence_number, client_msg_id, created_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every in-memory SQLite connection is its own database, so a
        // multi-connection pool would run migrations against one connection
        // and queries against another.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // ---- seeding surface, owned by chat management outside the pipeline ----

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn create_chat(&self, name: &str, creator: UserId) -> Result<ChatId> {
        let rec = sqlx::query("INSERT INTO chats (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        let chat_id = ChatId(rec.get::<i64, _>(0));
        self.add_chat_member(chat_id, creator).await?;
        Ok(chat_id)
    }

    pub async fn add_chat_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_members (chat_id, user_id) VALUES (?, ?)
             ON CONFLICT(chat_id, user_id) DO NOTHING",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn chat_exists(&self, chat_id: ChatId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Fan-out set for a chat.
    pub async fn members_of_chat(&self, chat_id: ChatId) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM chat_members WHERE chat_id = ? ORDER BY user_id")
            .bind(chat_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    // ---- the message store ----

    /// Persists a message and allocates the chat's next sequence number.
    ///
    /// The sequence bump is the first write in the transaction, so appends
    /// to the same chat serialize on the chat row and two commits can never
    /// observe the same number. A resubmission carrying a known
    /// (chat, sender, client_msg_id) rolls the bump back and returns the
    /// previously stored row with `deduplicated = true`, so retries consume
    /// no sequence numbers and leave no gaps.
    pub async fn append_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        content: &str,
        kind: MessageKind,
        file_url: Option<&str>,
        client_msg_id: Option<&str>,
    ) -> Result<(StoredMessage, bool)> {
        let mut tx = self.pool.begin().await?;

        let seq_row = sqlx::query(
            "UPDATE chats
             SET last_sequence = last_sequence + 1, message_count = message_count + 1
             WHERE id = ?
             RETURNING last_sequence",
        )
        .bind(chat_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(seq_row) = seq_row else {
            bail!("chat {} does not exist", chat_id.0);
        };
        let sequence_number = seq_row.get::<i64, _>(0);

        let member = sqlx::query("SELECT 1 FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id.0)
            .bind(sender_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if member.is_none() {
            tx.rollback().await?;
            bail!("user {} is not a member of chat {}", sender_id.0, chat_id.0);
        }

        if let Some(token) = client_msg_id {
            let existing = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ? AND sender_id = ? AND client_msg_id = ?"
            ))
            .bind(chat_id.0)
            .bind(sender_id.0)
            .bind(token)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = existing {
                // Undoes the sequence bump and the counter increment.
                tx.rollback().await?;
                return Ok((row_to_message(&row), true));
            }
        }

        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (chat_id, sender_id, content, kind, file_url, sequence_number, client_msg_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(chat_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(kind.as_str())
        .bind(file_url)
        .bind(sequence_number)
        .bind(client_msg_id)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));
        tx.commit().await?;

        Ok((
            StoredMessage {
                message_id,
                chat_id,
                sender_id,
                content: content.to_string(),
                kind,
                file_url: file_url.map(str::to_string),
                sequence_number,
                client_msg_id: client_msg_id.map(str::to_string),
                created_at,
            },
            false,
        ))
    }

    pub async fn find_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    /// Pages history backwards by message id; the returned page itself is
    /// ascending, oldest first.
    pub async fn list_chat_messages(
        &self,
        chat_id: ChatId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = if let Some(before_id) = before {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ? AND id < ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(chat_id.0)
            .bind(before_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(chat_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Cached counter maintained by `append_message`; a deduplicated retry
    /// does not move it.
    pub async fn message_count(&self, chat_id: ChatId) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT message_count FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?
            .unwrap_or(0);
        Ok(count)
    }

    // ---- read state, appended as separate facts ----

    /// Records the read at most once; returns whether this call recorded it.
    pub async fn mark_read(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks every message in the chat not sent by the reader; idempotent.
    /// Returns only the messages this call newly marked. A single
    /// `INSERT ... SELECT ... RETURNING` statement does the marking, so the
    /// bulk read serializes against concurrent appends on SQLite's write
    /// lock instead of reading first and aborting on the lock upgrade.
    pub async fn mark_chat_read(&self, chat_id: ChatId, user_id: UserId) -> Result<Vec<NewlyRead>> {
        let inserted = sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at)
             SELECT m.id, ?, ? FROM messages m
             WHERE m.chat_id = ? AND m.sender_id <> ?
               AND NOT EXISTS (
                 SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = ?
               )
             RETURNING message_id",
        )
        .bind(user_id.0)
        .bind(Utc::now())
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        if inserted.is_empty() {
            return Ok(Vec::new());
        }

        // The store is append-only, so a sender lookup after the insert
        // sees every message the insert marked.
        let senders: std::collections::HashMap<i64, i64> =
            sqlx::query("SELECT id, sender_id FROM messages WHERE chat_id = ?")
                .bind(chat_id.0)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| (row.get::<i64, _>(0), row.get::<i64, _>(1)))
                .collect();

        let mut newly_read: Vec<NewlyRead> = inserted
            .iter()
            .filter_map(|row| {
                let message_id = row.get::<i64, _>(0);
                senders.get(&message_id).map(|sender_id| NewlyRead {
                    message_id: MessageId(message_id),
                    chat_id,
                    sender_id: UserId(*sender_id),
                })
            })
            .collect();
        newly_read.sort_by_key(|item| item.message_id.0);
        Ok(newly_read)
    }

    pub async fn read_at(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT read_at FROM message_reads WHERE message_id = ? AND user_id = ?")
            .bind(message_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<DateTime<Utc>, _>(0)))
    }

    pub async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages m
             WHERE m.chat_id = ? AND m.sender_id <> ?
               AND NOT EXISTS (
                 SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = ?
               )",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn row_to_message(row: &SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(row.get::<i64, _>(0)),
        chat_id: ChatId(row.get::<i64, _>(1)),
        sender_id: UserId(row.get::<i64, _>(2)),
        content: row.get::<String, _>(3),
        // Stored kinds are written through `as_str`, so this only falls
        // back on a hand-edited row.
        kind: MessageKind::parse(&row.get::<String, _>(4)).unwrap_or_default(),
        file_url: row.get::<Option<String>, _>(5),
        sequence_number: row.get::<i64, _>(6),
        client_msg_id: row.get::<Option<String>, _>(7),
        created_at: row.get::<DateTime<Utc>, _>(8),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() || path.contains(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory for '{database_url}'"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
