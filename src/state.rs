//! State management for the Courier relay server
//!
//! `AppState` owns the database, the attachment store, and the per-receiver
//! wakeup channels the long-poll path blocks on. All business operations
//! live here; handlers stay thin.

use crate::db::Database;
use crate::error::ApiError;
use crate::files::{FileConfig, FileStore};
use crate::models::{
    message_preview, Account, MessageRecord, MessageType, MessageView, NewMessage,
};
use crate::validation::{allowed_file, sanitize_filename};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const WAKEUP_CHANNEL_CAPACITY: usize = 16;

/// Storage and retention ceilings; tests shrink these
#[derive(Debug, Clone)]
pub struct StorageLimits {
    /// Per-account storage cap in bytes (default: 100MiB)
    pub max_user_storage: u64,
    /// Store-wide storage cap in bytes (default: 700MiB)
    pub max_total_storage: u64,
    /// How long a message lives before the expiry sweep removes it
    pub retention_window: Duration,
    /// Default page size for getUpdates
    pub poll_limit: i64,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_user_storage: 100 * 1024 * 1024,
            max_total_storage: 700 * 1024 * 1024,
            retention_window: Duration::from_secs(24 * 60 * 60),
            poll_limit: 50,
        }
    }
}

/// Outcome of a send operation
#[derive(Debug)]
pub struct SendReceipt {
    pub message_id: String,
    pub file_id: Option<String>,
    pub update_id: i64,
    pub sent_at: u64,
    /// Wire projection of the stored message, for the webhook payload
    pub view: MessageView,
}

/// Application state shared across handlers
pub struct AppState {
    pub db: Database,
    pub files: FileStore,
    pub limits: StorageLimits,
    /// Per-receiver wakeup channels; the send path signals these so
    /// long-pollers re-check immediately instead of on a fixed cadence
    wakeups: RwLock<HashMap<String, broadcast::Sender<()>>>,
    pub start_time: u64,
}

pub type SharedState = Arc<AppState>;

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("db", &"<Database>")
            .field("limits", &self.limits)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    pub async fn new(
        db_path: &str,
        file_config: FileConfig,
        limits: StorageLimits,
    ) -> Result<Self> {
        let db = Database::new(db_path).await?;
        let files = FileStore::new(file_config);
        files.init().await?;

        Ok(Self {
            db,
            files,
            limits,
            wakeups: RwLock::new(HashMap::new()),
            start_time: crate::db::now(),
        })
    }

    /// In-memory database with default limits (for testing)
    pub async fn new_in_memory(storage_dir: std::path::PathBuf) -> Result<Self> {
        let file_config = FileConfig {
            storage_dir,
            ..FileConfig::default()
        };
        Self::new(":memory:", file_config, StorageLimits::default()).await
    }

    pub fn uptime(&self) -> u64 {
        crate::db::now().saturating_sub(self.start_time)
    }

    // ── Authentication ──

    /// Resolve an API key to its active account and touch its activity stamp
    pub async fn authenticate(&self, api_key: &str) -> Result<Account, ApiError> {
        let account = self
            .db
            .get_account_by_api_key(api_key)
            .await?
            .ok_or_else(|| ApiError::Unauthenticated("Invalid API Key".into()))?;

        self.db.touch_activity(&account.user_id).await?;
        Ok(account)
    }

    // ── Accounts ──

    pub async fn register_account(
        &self,
        user_id: &str,
        username: &str,
        email: &str,
    ) -> Result<Account, ApiError> {
        if self.db.identity_exists(user_id, username, email).await? {
            return Err(ApiError::DuplicateIdentity(
                "User ID, username or email already exists".into(),
            ));
        }

        let account = self.db.create_account(user_id, username, email).await?;
        Ok(account)
    }

    // ── Sending ──

    pub async fn send_text(
        &self,
        sender: &Account,
        receiver_id: &str,
        text: &str,
        reply_to_message_id: Option<String>,
    ) -> Result<SendReceipt, ApiError> {
        self.require_active_receiver(receiver_id).await?;

        let (reply_to_sender_id, reply_to_text) =
            self.capture_reply_preview(reply_to_message_id.as_deref()).await?;

        let message_type = if reply_to_message_id.is_some() {
            MessageType::Reply
        } else {
            MessageType::Text
        };

        let new = NewMessage {
            message_id: opaque_token(),
            message_type,
            text_content: Some(text.to_string()),
            file_id: None,
            original_name: None,
            stored_name: None,
            file_path: None,
            file_size: None,
            mime_type: None,
            content_hash: None,
            reply_to_message_id,
            reply_to_sender_id,
            reply_to_text,
            sender_id: sender.user_id.clone(),
            sender_username: sender.username.clone(),
            receiver_id: receiver_id.to_string(),
        };

        self.append_and_receipt(new).await
    }

    pub async fn send_file(
        &self,
        sender: &Account,
        receiver_id: &str,
        file_name: &str,
        data: &[u8],
        mime_type: Option<String>,
        caption: Option<String>,
        reply_to_message_id: Option<String>,
    ) -> Result<SendReceipt, ApiError> {
        let file_size = data.len() as u64;

        if file_size > self.files.max_file_size() {
            return Err(ApiError::QuotaExceeded(format!(
                "File size exceeds {}MB limit",
                self.files.max_file_size() / (1024 * 1024)
            )));
        }

        // Exactly-at-cap is allowed; one byte over is not
        if sender.storage_used as u64 + file_size > self.limits.max_user_storage {
            return Err(ApiError::QuotaExceeded("Storage limit exceeded".into()));
        }

        if !allowed_file(file_name) {
            return Err(ApiError::TypeNotAllowed("File type not allowed".into()));
        }

        self.require_active_receiver(receiver_id).await?;

        let (reply_to_sender_id, reply_to_text) =
            self.capture_reply_preview(reply_to_message_id.as_deref()).await?;

        let file_id = opaque_token();
        let sanitized = sanitize_filename(file_name);
        let stored_name = format!("{}_{}", file_id, sanitized);

        let (file_path, content_hash) = self
            .files
            .store(&stored_name, data)
            .await
            .map_err(ApiError::Store)?;

        let new = NewMessage {
            message_id: opaque_token(),
            message_type: MessageType::File,
            text_content: caption.filter(|c| !c.is_empty()),
            file_id: Some(file_id),
            original_name: Some(sanitized),
            stored_name: Some(stored_name),
            file_path: Some(file_path.clone()),
            file_size: Some(file_size as i64),
            mime_type,
            content_hash: Some(content_hash),
            reply_to_message_id,
            reply_to_sender_id,
            reply_to_text,
            sender_id: sender.user_id.clone(),
            sender_username: sender.username.clone(),
            receiver_id: receiver_id.to_string(),
        };

        match self.append_and_receipt(new).await {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                // Message never made it into the store; drop the orphan blob
                // so the send leaves no residue.
                let _ = self.files.remove(&file_path).await;
                Err(err)
            }
        }
    }

    async fn append_and_receipt(&self, new: NewMessage) -> Result<SendReceipt, ApiError> {
        let message_id = new.message_id.clone();
        let file_id = new.file_id.clone();

        let (seq, sent_at) = self
            .db
            .append_message(&new, self.limits.retention_window.as_secs())
            .await?;

        let record = self
            .db
            .get_message(&message_id)
            .await?
            .ok_or_else(|| ApiError::Store(anyhow::anyhow!("Message vanished after insert")))?;

        Ok(SendReceipt {
            message_id,
            file_id,
            update_id: seq,
            sent_at,
            view: record.to_view(),
        })
    }

    async fn require_active_receiver(&self, receiver_id: &str) -> Result<(), ApiError> {
        self.db
            .get_active_account(receiver_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Receiver user not found".into()))?;
        Ok(())
    }

    /// Snapshot the reply target's sender and a text preview. The target
    /// being gone is not an error; the preview fields just stay empty.
    async fn capture_reply_preview(
        &self,
        reply_to_message_id: Option<&str>,
    ) -> Result<(Option<String>, Option<String>), ApiError> {
        let Some(target_id) = reply_to_message_id else {
            return Ok((None, None));
        };

        match self.db.get_message(target_id).await? {
            Some(target) => Ok((Some(target.sender_id.clone()), message_preview(&target))),
            None => Ok((None, None)),
        }
    }

    // ── Polling ──

    /// Cursor-based update retrieval
    ///
    /// `offset = None` replays the receiver's full stored history (bounded by
    /// `limit`); `offset = N` returns only messages with `seq > N`. Returned
    /// messages that were not yet delivered are marked delivered with their
    /// read counter bumped, committed before this returns. With
    /// `timeout_secs > 0` the call waits for a send-path wakeup until the
    /// deadline when nothing is immediately available.
    pub async fn get_updates(
        &self,
        account: &Account,
        offset: Option<i64>,
        limit: i64,
        timeout_secs: u64,
    ) -> Result<(Vec<MessageView>, i64), ApiError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        let rows = loop {
            let rows = self
                .db
                .messages_for_receiver_after(&account.user_id, offset, limit)
                .await?;
            if !rows.is_empty() || timeout_secs == 0 {
                break rows;
            }

            let mut wakeup = self.subscribe_updates(&account.user_id).await;

            // Re-check after subscribing: a send that landed between the
            // query above and the subscription would otherwise be missed
            // until the deadline.
            let rows = self
                .db
                .messages_for_receiver_after(&account.user_id, offset, limit)
                .await?;
            if !rows.is_empty() {
                break rows;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break Vec::new(),
                _ = wakeup.recv() => {}
            }
        };

        // Serialize before flipping delivery state: the response reflects the
        // state the poll observed, matching a first delivery's
        // is_delivered=false.
        let updates: Vec<MessageView> = rows.iter().map(MessageRecord::to_view).collect();

        let undelivered: Vec<i64> = rows
            .iter()
            .filter(|r| !r.is_delivered)
            .map(|r| r.seq)
            .collect();
        self.db.mark_delivered(&undelivered).await?;

        let next_offset = match rows.last() {
            Some(last) => last.seq + 1,
            None => offset.unwrap_or(0),
        };

        Ok((updates, next_offset))
    }

    pub async fn subscribe_updates(&self, user_id: &str) -> broadcast::Receiver<()> {
        let wakeups = self.wakeups.read().await;
        if let Some(tx) = wakeups.get(user_id) {
            return tx.subscribe();
        }
        drop(wakeups);

        let mut wakeups = self.wakeups.write().await;
        let tx = wakeups
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(WAKEUP_CHANNEL_CAPACITY).0);
        tx.subscribe()
    }

    /// Wake any long-pollers waiting on this receiver
    pub async fn notify_new_message(&self, receiver_id: &str) {
        let wakeups = self.wakeups.read().await;
        if let Some(tx) = wakeups.get(receiver_id) {
            let _ = tx.send(());
        }
    }

    // ── History & files ──

    pub async fn chat_history(
        &self,
        account: &Account,
        other_user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageView>, ApiError> {
        let rows = self
            .db
            .conversation_messages(&account.user_id, other_user_id, limit, offset)
            .await?;

        Ok(rows.iter().map(MessageRecord::to_view).collect())
    }

    /// Fetch a file's bytes; only the owning message's sender or receiver
    /// may download it. Bumps the message's read counter.
    pub async fn download_file(
        &self,
        account: &Account,
        file_id: &str,
    ) -> Result<(Vec<u8>, Option<String>, String), ApiError> {
        let record = self
            .db
            .get_message_by_file_id(file_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("File not found".into()))?;

        if record.sender_id != account.user_id && record.receiver_id != account.user_id {
            return Err(ApiError::AccessDenied("Access denied".into()));
        }

        let Some(file_path) = record.file_path.as_deref() else {
            return Err(ApiError::NotFound("File not found on server".into()));
        };

        if !self.files.exists(file_path) {
            return Err(ApiError::NotFound("File not found on server".into()));
        }

        let data = self.files.read(file_path).await.map_err(ApiError::Store)?;
        self.db.increment_read_count(record.seq).await?;

        Ok((
            data,
            record.mime_type.clone(),
            record.original_name.clone().unwrap_or_default(),
        ))
    }
}

/// Opaque 32-hex-char identifier for messages and files
pub fn opaque_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_state(temp_dir: &TempDir) -> AppState {
        AppState::new_in_memory(temp_dir.path().to_path_buf())
            .await
            .unwrap()
    }

    async fn register_pair(state: &AppState) -> (Account, Account) {
        let alice = state
            .register_account("alice", "Alice", "alice@example.com")
            .await
            .unwrap();
        let bob = state
            .register_account("bob", "Bob", "bob@example.com")
            .await
            .unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;

        state
            .register_account("alice", "Alice", "alice@example.com")
            .await
            .unwrap();

        let err = state
            .register_account("alice", "Other", "other@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::DuplicateIdentity(_)));

        let err = state
            .register_account("other", "Alice", "other@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::DuplicateIdentity(_)));
    }

    #[tokio::test]
    async fn test_send_and_poll_cursor_chain() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;
        let (alice, bob) = register_pair(&state).await;

        let r1 = state.send_text(&alice, "bob", "one", None).await.unwrap();
        let r2 = state.send_text(&alice, "bob", "two", None).await.unwrap();
        assert!(r2.update_id > r1.update_id);

        // First poll without an offset sees everything
        let (updates, next) = state.get_updates(&bob, None, 50, 0).await.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(next, r2.update_id + 1);
        assert!(!updates[0].is_delivered); // state as observed by this poll

        // Resuming from the cursor sees nothing and keeps the cursor
        let (updates, next2) = state.get_updates(&bob, Some(next), 50, 0).await.unwrap();
        assert!(updates.is_empty());
        assert_eq!(next2, next);

        // A new message shows up alone
        let r3 = state.send_text(&alice, "bob", "three", None).await.unwrap();
        let (updates, next3) = state.get_updates(&bob, Some(next), 50, 0).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update_id, r3.update_id);
        assert_eq!(next3, r3.update_id + 1);
    }

    #[tokio::test]
    async fn test_poll_without_offset_replays_history() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;
        let (alice, bob) = register_pair(&state).await;

        state.send_text(&alice, "bob", "hello", None).await.unwrap();

        let (first, _) = state.get_updates(&bob, None, 50, 0).await.unwrap();
        let (second, _) = state.get_updates(&bob, None, 50, 0).await.unwrap();

        // Omitting the offset intentionally re-delivers
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].message_id, second[0].message_id);

        // ...but delivery state only flipped once
        assert!(!first[0].is_delivered);
        assert!(second[0].is_delivered);
        assert_eq!(second[0].read_count, 1);
    }

    #[tokio::test]
    async fn test_poll_empty_store_returns_zero_offset() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;
        let (_, bob) = register_pair(&state).await;

        let (updates, next) = state.get_updates(&bob, None, 50, 0).await.unwrap();
        assert!(updates.is_empty());
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_send() {
        let temp_dir = TempDir::new().unwrap();
        let state = Arc::new(test_state(&temp_dir).await);
        let (alice, bob) = register_pair(&state).await;

        let poller = {
            let state = state.clone();
            tokio::spawn(async move { state.get_updates(&bob, None, 50, 5).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        state.send_text(&alice, "bob", "wake up", None).await.unwrap();
        state.notify_new_message("bob").await;

        let (updates, _) = poller.await.unwrap().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].text.as_deref(), Some("wake up"));
    }

    #[tokio::test]
    async fn test_concurrent_sends_get_distinct_ordered_sequences() {
        let temp_dir = TempDir::new().unwrap();
        let state = Arc::new(test_state(&temp_dir).await);
        let (alice, bob) = register_pair(&state).await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let state = state.clone();
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                state
                    .send_text(&alice, "bob", &format!("msg {}", i), None)
                    .await
                    .unwrap()
                    .update_id
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 10); // no two sends share a sequence number

        // Delivery order follows assigned sequence, not completion order
        let (updates, _) = state.get_updates(&bob, None, 50, 0).await.unwrap();
        assert_eq!(updates.len(), 10);
        let polled: Vec<i64> = updates.iter().map(|u| u.update_id).collect();
        assert!(polled.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_send_to_unknown_receiver() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;
        let (alice, _) = register_pair(&state).await;

        let err = state
            .send_text(&alice, "nobody", "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reply_to_deleted_message_has_empty_preview() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;
        let (alice, bob) = register_pair(&state).await;

        let original = state.send_text(&bob, "alice", "original", None).await.unwrap();
        state
            .db
            .delete_message_with_ledger(original.update_id, "bob", 0)
            .await
            .unwrap();

        let reply = state
            .send_text(&alice, "bob", "answer", Some(original.message_id.clone()))
            .await
            .unwrap();

        assert_eq!(reply.view.message_type, "reply");
        let preview = reply.view.reply_to.unwrap();
        assert_eq!(preview.message_id, original.message_id);
        assert!(preview.sender_id.is_none());
        assert!(preview.text_preview.is_none());
    }

    #[tokio::test]
    async fn test_file_quota_boundary() {
        let temp_dir = TempDir::new().unwrap();
        let file_config = FileConfig {
            storage_dir: temp_dir.path().to_path_buf(),
            max_file_size: 50,
        };
        let limits = StorageLimits {
            max_user_storage: 100,
            ..StorageLimits::default()
        };
        let state = AppState::new(":memory:", file_config, limits).await.unwrap();
        let (alice, _) = register_pair(&state).await;

        // 40 + 40 + 20 lands exactly on the cap and must succeed
        for size in [40usize, 40, 20] {
            state
                .send_file(&alice, "bob", "chunk.zip", &vec![0u8; size], None, None, None)
                .await
                .unwrap();
        }

        // Re-fetch so the pre-check sees the up-to-date ledger, the way a
        // fresh authenticated request would
        let alice = state.db.get_account("alice").await.unwrap().unwrap();
        assert_eq!(alice.storage_used, 100);

        // One byte over the cap is rejected
        let err = state
            .send_file(&alice, "bob", "extra.zip", &[0u8; 1], None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::QuotaExceeded(_)));

        // A single file over the per-file limit is rejected up front
        let bob = state.db.get_account("bob").await.unwrap().unwrap();
        let err = state
            .send_file(&bob, "alice", "huge.zip", &vec![0u8; 51], None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_file_type_allow_list() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;
        let (alice, _) = register_pair(&state).await;

        let err = state
            .send_file(&alice, "bob", "malware.exe", b"MZ", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::TypeNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_download_access_control() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;
        let (alice, bob) = register_pair(&state).await;
        let eve = state
            .register_account("eve", "Eve", "eve@example.com")
            .await
            .unwrap();

        let receipt = state
            .send_file(&alice, "bob", "note.txt", b"secret", None, None, None)
            .await
            .unwrap();
        let file_id = receipt.file_id.unwrap();

        // Both participants may download
        let (data, _, name) = state.download_file(&alice, &file_id).await.unwrap();
        assert_eq!(data, b"secret");
        assert_eq!(name, "note.txt");
        state.download_file(&bob, &file_id).await.unwrap();

        // A third party may not
        let err = state.download_file(&eve, &file_id).await.unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied(_)));

        let err = state.download_file(&alice, "missing").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_file_caption_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let state = test_state(&temp_dir).await;
        let (alice, bob) = register_pair(&state).await;

        state
            .send_file(
                &alice,
                "bob",
                "cat.png",
                b"png bytes",
                Some("image/png".into()),
                Some("my cat".into()),
                None,
            )
            .await
            .unwrap();

        let (updates, _) = state.get_updates(&bob, None, 50, 0).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].caption.as_deref(), Some("my cat"));
        let file = updates[0].file.as_ref().unwrap();
        assert_eq!(file.original_name, "cat.png");
        assert_eq!(file.mime_type.as_deref(), Some("image/png"));
    }
}
