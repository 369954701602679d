//! Database layer for the Courier relay server using SQLite
//!
//! Holds accounts (with their storage ledger), messages, and webhook
//! registrations. Message sequence numbers come from the AUTOINCREMENT
//! rowid, so they strictly increase across the whole store. Every mutation
//! that creates or deletes a message adjusts the sender's ledger inside the
//! same transaction.

use crate::models::{Account, MessageRecord, MessageType, NewMessage};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current time as epoch seconds
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();

        let pool = if path.to_str() == Some(":memory:") {
            // A pooled in-memory database only works with a single pinned
            // connection; each extra connection would see its own empty db.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
                .context("Failed to open in-memory SQLite database")?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .connect_with(options)
                .await
                .with_context(|| format!("Failed to open SQLite database at {:?}", path))?
        };

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create or update the schema
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY NOT NULL,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                api_key TEXT NOT NULL UNIQUE,
                storage_used INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                last_activity INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                message_type TEXT NOT NULL,
                text_content TEXT,
                file_id TEXT,
                original_name TEXT,
                stored_name TEXT,
                file_path TEXT,
                file_size INTEGER,
                mime_type TEXT,
                content_hash TEXT,
                reply_to_message_id TEXT,
                reply_to_sender_id TEXT,
                reply_to_text TEXT,
                sender_id TEXT NOT NULL,
                sender_username TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                is_delivered INTEGER NOT NULL DEFAULT 0,
                read_count INTEGER NOT NULL DEFAULT 0,
                webhook_sent INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (sender_id) REFERENCES users (user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_receiver_seq ON messages (receiver_id, seq)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages (sent_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_file_id ON messages (file_id)")
            .execute(&self.pool)
            .await?;

        self.create_webhooks_table().await?;

        Ok(())
    }

    // ── Account operations ──

    /// Insert a new account; the api_key is generated here and returned
    /// exactly once through the created row.
    pub async fn create_account(
        &self,
        user_id: &str,
        username: &str,
        email: &str,
    ) -> Result<Account> {
        let api_key = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let created_at = now();

        sqlx::query(
            "INSERT INTO users (user_id, username, email, api_key, storage_used, message_count, is_active, created_at, last_activity) VALUES (?, ?, ?, ?, 0, 0, 1, ?, ?)",
        )
        .bind(user_id)
        .bind(username)
        .bind(email)
        .bind(&api_key)
        .bind(created_at as i64)
        .bind(created_at as i64)
        .execute(&self.pool)
        .await
        .context("Failed to create account")?;

        self.get_account(user_id)
            .await?
            .ok_or_else(|| anyhow!("Account vanished after insert"))
    }

    /// Whether any account already uses this user_id, username, or email
    pub async fn identity_exists(
        &self,
        user_id: &str,
        username: &str,
        email: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users WHERE user_id = ? OR username = ? OR email = ?",
        )
        .bind(user_id)
        .bind(username)
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check identity")?;

        Ok(count > 0)
    }

    pub async fn get_account(&self, user_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query account")?;

        row.as_ref().map(parse_account).transpose()
    }

    /// Point lookup restricted to active accounts (receiver checks)
    pub async fn get_active_account(&self, user_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM users WHERE user_id = ? AND is_active = 1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query account")?;

        row.as_ref().map(parse_account).transpose()
    }

    /// Resolve an API key to its active account
    pub async fn get_account_by_api_key(&self, api_key: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM users WHERE api_key = ? AND is_active = 1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query account by API key")?;

        row.as_ref().map(parse_account).transpose()
    }

    pub async fn touch_activity(&self, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET last_activity = ? WHERE user_id = ?")
            .bind(now() as i64)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to update last_activity")?;
        Ok(())
    }

    /// Accounts whose ledger is over the given storage cap
    pub async fn accounts_over_cap(&self, cap: i64) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM users WHERE storage_used > ?")
            .bind(cap)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query accounts over cap")?;

        rows.iter().map(parse_account).collect()
    }

    /// Store-wide attachment bytes, recomputed from the messages table rather
    /// than the ledger so ledger drift cannot hide an over-cap store.
    pub async fn total_file_storage(&self) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(file_size), 0) FROM messages WHERE file_size IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute total storage")?;

        Ok(total)
    }

    // ── Message operations ──

    /// Persist a message and bill the sender's ledger in one transaction
    ///
    /// Returns the assigned sequence number and the persisted timestamp.
    pub async fn append_message(
        &self,
        new: &NewMessage,
        retention_secs: u64,
    ) -> Result<(i64, u64)> {
        let sent_at = now();
        let expires_at = sent_at + retention_secs;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, message_type, text_content,
                file_id, original_name, stored_name, file_path, file_size, mime_type, content_hash,
                reply_to_message_id, reply_to_sender_id, reply_to_text,
                sender_id, sender_username, receiver_id,
                sent_at, expires_at, is_delivered, read_count, webhook_sent
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0)
            "#,
        )
        .bind(&new.message_id)
        .bind(new.message_type.as_str())
        .bind(&new.text_content)
        .bind(&new.file_id)
        .bind(&new.original_name)
        .bind(&new.stored_name)
        .bind(&new.file_path)
        .bind(new.file_size)
        .bind(&new.mime_type)
        .bind(&new.content_hash)
        .bind(&new.reply_to_message_id)
        .bind(&new.reply_to_sender_id)
        .bind(&new.reply_to_text)
        .bind(&new.sender_id)
        .bind(&new.sender_username)
        .bind(&new.receiver_id)
        .bind(sent_at as i64)
        .bind(expires_at as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to insert message")?;

        let seq = result.last_insert_rowid();

        adjust_ledger(&mut tx, &new.sender_id, new.file_size.unwrap_or(0), 1).await?;

        tx.commit().await.context("Failed to commit message")?;

        Ok((seq, sent_at))
    }

    /// Delete a message and credit the sender's ledger in one transaction
    ///
    /// Returns false when the row was already gone (a concurrent deletion is
    /// treated as success and must not touch the ledger again).
    pub async fn delete_message_with_ledger(
        &self,
        seq: i64,
        sender_id: &str,
        file_size: i64,
    ) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let result = sqlx::query("DELETE FROM messages WHERE seq = ?")
            .bind(seq)
            .execute(&mut *tx)
            .await
            .context("Failed to delete message")?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        adjust_ledger(&mut tx, sender_id, -file_size, -1).await?;

        tx.commit().await.context("Failed to commit deletion")?;

        Ok(true)
    }

    /// Point lookup by opaque message id; absent is not an error
    pub async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query message")?;

        row.as_ref().map(parse_message).transpose()
    }

    pub async fn get_message_by_file_id(&self, file_id: &str) -> Result<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query message by file id")?;

        row.as_ref().map(parse_message).transpose()
    }

    /// Messages for a receiver with `seq > since`, ascending by seq
    ///
    /// `since = None` means no lower bound: the receiver's full stored
    /// history, which intentionally re-delivers already-seen messages.
    pub async fn messages_for_receiver_after(
        &self,
        receiver_id: &str,
        since: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let query = if let Some(since_seq) = since {
            sqlx::query(
                "SELECT * FROM messages WHERE receiver_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
            )
            .bind(receiver_id)
            .bind(since_seq)
            .bind(limit)
        } else {
            sqlx::query("SELECT * FROM messages WHERE receiver_id = ? ORDER BY seq ASC LIMIT ?")
                .bind(receiver_id)
                .bind(limit)
        };

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to query receiver messages")?;

        rows.iter().map(parse_message).collect()
    }

    /// Both directions of a conversation pair, newest first, paginated
    pub async fn conversation_messages(
        &self,
        user_a: &str,
        user_b: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?)
            ORDER BY sent_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .bind(user_b)
        .bind(user_a)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query conversation")?;

        rows.iter().map(parse_message).collect()
    }

    /// Messages sent before the cutoff, for the expiry sweep
    pub async fn messages_older_than(&self, cutoff: u64) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE sent_at < ?")
            .bind(cutoff as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query expired messages")?;

        rows.iter().map(parse_message).collect()
    }

    /// File-bearing messages oldest-sent-first, optionally for one sender;
    /// feeds cap eviction.
    pub async fn file_messages_oldest_first(
        &self,
        sender_id: Option<&str>,
    ) -> Result<Vec<MessageRecord>> {
        let query = if let Some(sender) = sender_id {
            sqlx::query(
                "SELECT * FROM messages WHERE file_size IS NOT NULL AND sender_id = ? ORDER BY sent_at ASC",
            )
            .bind(sender)
        } else {
            sqlx::query("SELECT * FROM messages WHERE file_size IS NOT NULL ORDER BY sent_at ASC")
        };

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to query file messages")?;

        rows.iter().map(parse_message).collect()
    }

    /// Flip delivery state for the given rows: still-undelivered ones are
    /// marked delivered with their read counter bumped once.
    pub async fn mark_delivered(&self, seqs: &[i64]) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; seqs.len()].join(", ");
        let sql = format!(
            "UPDATE messages SET is_delivered = 1, read_count = read_count + 1 WHERE is_delivered = 0 AND seq IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for seq in seqs {
            query = query.bind(*seq);
        }
        query
            .execute(&self.pool)
            .await
            .context("Failed to mark messages delivered")?;

        Ok(())
    }

    pub async fn increment_read_count(&self, seq: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET read_count = read_count + 1 WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await
            .context("Failed to increment read count")?;
        Ok(())
    }
}

/// The one ledger mutation path: clamped at zero on both counters so a
/// duplicate credit cannot drive them negative.
async fn adjust_ledger(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
    storage_delta: i64,
    count_delta: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE users SET storage_used = MAX(0, storage_used + ?), message_count = MAX(0, message_count + ?) WHERE user_id = ?",
    )
    .bind(storage_delta)
    .bind(count_delta)
    .bind(user_id)
    .execute(&mut **tx)
    .await
    .context("Failed to adjust ledger")?;

    Ok(())
}

fn parse_account(row: &SqliteRow) -> Result<Account> {
    Ok(Account {
        user_id: row.get("user_id"),
        username: row.get("username"),
        email: row.get("email"),
        api_key: row.get("api_key"),
        storage_used: row.get("storage_used"),
        message_count: row.get("message_count"),
        is_active: row.get("is_active"),
        created_at: row.get::<i64, _>("created_at") as u64,
        last_activity: row.get::<i64, _>("last_activity") as u64,
    })
}

fn parse_message(row: &SqliteRow) -> Result<MessageRecord> {
    let type_str: String = row.get("message_type");
    let message_type = MessageType::from_str(&type_str)
        .ok_or_else(|| anyhow!("Unknown message type: {}", type_str))?;

    Ok(MessageRecord {
        seq: row.get("seq"),
        message_id: row.get("message_id"),
        message_type,
        text_content: row.get("text_content"),
        file_id: row.get("file_id"),
        original_name: row.get("original_name"),
        stored_name: row.get("stored_name"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        mime_type: row.get("mime_type"),
        content_hash: row.get("content_hash"),
        reply_to_message_id: row.get("reply_to_message_id"),
        reply_to_sender_id: row.get("reply_to_sender_id"),
        reply_to_text: row.get("reply_to_text"),
        sender_id: row.get("sender_id"),
        sender_username: row.get("sender_username"),
        receiver_id: row.get("receiver_id"),
        sent_at: row.get::<i64, _>("sent_at") as u64,
        expires_at: row.get::<i64, _>("expires_at") as u64,
        is_delivered: row.get("is_delivered"),
        read_count: row.get("read_count"),
        webhook_sent: row.get("webhook_sent"),
    })
}
