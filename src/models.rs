//! Data models for the Courier relay server

use serde::{Deserialize, Serialize};

/// Account registered with the relay
///
/// `storage_used` and `message_count` form the per-account ledger: they track
/// the sum of stored file sizes and the number of stored messages sent by
/// this account, and are adjusted transactionally with message creation and
/// deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub username: String,
    pub email: String,
    /// Opaque bearer credential, generated at registration (64 hex chars)
    pub api_key: String,
    pub storage_used: i64,
    pub message_count: i64,
    pub is_active: bool,
    pub created_at: u64,
    pub last_activity: u64,
}

/// Message kind: plain text, file transfer, or a reply to an earlier message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    File,
    Reply,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::File => "file",
            MessageType::Reply => "reply",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageType::Text),
            "file" => Some(MessageType::File),
            "reply" => Some(MessageType::Reply),
            _ => None,
        }
    }
}

/// A stored message row
///
/// `seq` is assigned by the store (AUTOINCREMENT) and strictly increases
/// across the whole store; it is the cursor key polled clients compare
/// against. `message_id` is the opaque public identifier.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub seq: i64,
    pub message_id: String,
    pub message_type: MessageType,
    pub text_content: Option<String>,

    pub file_id: Option<String>,
    pub original_name: Option<String>,
    pub stored_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub content_hash: Option<String>,

    pub reply_to_message_id: Option<String>,
    pub reply_to_sender_id: Option<String>,
    /// Preview of the replied-to message, captured once at send time
    pub reply_to_text: Option<String>,

    pub sender_id: String,
    pub sender_username: String,
    pub receiver_id: String,

    pub sent_at: u64,
    pub expires_at: u64,

    pub is_delivered: bool,
    pub read_count: i64,
    pub webhook_sent: bool,
}

/// Input to `Database::append_message`; the store assigns `seq`, `sent_at`
/// and `expires_at`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub message_type: MessageType,
    pub text_content: Option<String>,

    pub file_id: Option<String>,
    pub original_name: Option<String>,
    pub stored_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub content_hash: Option<String>,

    pub reply_to_message_id: Option<String>,
    pub reply_to_sender_id: Option<String>,
    pub reply_to_text: Option<String>,

    pub sender_id: String,
    pub sender_username: String,
    pub receiver_id: String,
}

// ── Wire projection ──

/// File metadata section of a message payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub original_name: String,
    pub file_size: i64,
    pub mime_type: Option<String>,
}

/// Reply linkage section of a message payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: String,
    pub sender_id: Option<String>,
    pub text_preview: Option<String>,
}

/// Message as serialized to clients (poll, history, webhook payloads)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    /// The store-assigned sequence number; pollers resume from here
    pub update_id: i64,
    pub message_id: String,
    pub message_type: String,
    pub sender_id: String,
    pub sender_username: String,
    pub receiver_id: String,
    pub sent_at: u64,
    pub expires_at: u64,
    pub is_delivered: bool,
    pub read_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

impl MessageRecord {
    /// Project the row into its wire shape.
    ///
    /// Text and reply messages carry `text`; file messages carry `file` plus
    /// an optional `caption`; only reply messages expose the `reply_to`
    /// section. The reply preview is truncated to 100 characters.
    pub fn to_view(&self) -> MessageView {
        let mut view = MessageView {
            update_id: self.seq,
            message_id: self.message_id.clone(),
            message_type: self.message_type.as_str().to_string(),
            sender_id: self.sender_id.clone(),
            sender_username: self.sender_username.clone(),
            receiver_id: self.receiver_id.clone(),
            sent_at: self.sent_at,
            expires_at: self.expires_at,
            is_delivered: self.is_delivered,
            read_count: self.read_count,
            text: None,
            file: None,
            caption: None,
            reply_to: None,
        };

        match self.message_type {
            MessageType::Text | MessageType::Reply => {
                view.text = self.text_content.clone();
            }
            MessageType::File => {
                view.file = Some(FileInfo {
                    file_id: self.file_id.clone().unwrap_or_default(),
                    original_name: self.original_name.clone().unwrap_or_default(),
                    file_size: self.file_size.unwrap_or(0),
                    mime_type: self.mime_type.clone(),
                });
                if let Some(caption) = &self.text_content {
                    if !caption.is_empty() {
                        view.caption = Some(caption.clone());
                    }
                }
            }
        }

        if self.message_type == MessageType::Reply {
            if let Some(reply_id) = &self.reply_to_message_id {
                view.reply_to = Some(ReplyPreview {
                    message_id: reply_id.clone(),
                    sender_id: self.reply_to_sender_id.clone(),
                    text_preview: self.reply_to_text.as_deref().map(truncate_preview),
                });
            }
        }

        view
    }
}

/// Preview text a reply captures from its target at send time
pub fn message_preview(record: &MessageRecord) -> Option<String> {
    match record.message_type {
        MessageType::Text | MessageType::Reply => record.text_content.clone(),
        MessageType::File => {
            let name = record.original_name.as_deref().unwrap_or_default();
            match record.text_content.as_deref().filter(|c| !c.is_empty()) {
                Some(caption) => Some(format!("📎 {} - {}", name, caption)),
                None => Some(format!("📎 {}", name)),
            }
        }
    }
}

fn truncate_preview(text: &str) -> String {
    if text.chars().count() > 100 {
        let head: String = text.chars().take(100).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

// ── Request / response DTOs ──

/// Registration request
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub user_id: String,
    pub username: String,
    pub email: String,
}

/// Registration response; the only place the api_key is handed out
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: String,
    pub user: Account,
}

/// Text message send request
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: String,
    pub text: String,
    pub reply_to_message_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub update_id: i64,
    pub sent_at: u64,
}

/// File send request; `data` is the raw file content, base64-encoded
#[derive(Debug, Deserialize)]
pub struct SendFileRequest {
    pub receiver_id: String,
    pub file_name: String,
    pub data: String,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    pub reply_to_message_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendFileResponse {
    pub message_id: String,
    pub file_id: String,
    pub update_id: i64,
    pub sent_at: u64,
}

/// Poll response: updates in ascending sequence order plus the cursor to
/// resume from
#[derive(Debug, Serialize)]
pub struct UpdatesResponse {
    pub updates: Vec<MessageView>,
    pub next_offset: i64,
}

#[derive(Debug, Serialize)]
pub struct ChatHistoryResponse {
    pub messages: Vec<MessageView>,
    pub count: usize,
}

/// Webhook registration request
#[derive(Debug, Deserialize)]
pub struct SetWebhookRequest {
    pub url: String,
    pub secret_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StorageInfo {
    pub used_bytes: i64,
    pub limit_bytes: u64,
    pub used_percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: Account,
    pub storage_info: StorageInfo,
}

/// Generic error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}
