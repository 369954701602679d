//! Outbound webhook support
//!
//! Each account may register at most one endpoint URL; setting a new one
//! replaces the old. Every stored message triggers a single best-effort POST
//! to the receiver's endpoint. Delivery is never retried and never blocks or
//! fails the send that triggered it.

use crate::db::{now, Database};
use crate::models::MessageView;
use crate::state::SharedState;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, warn};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = "courier-relay/1.0";

/// A per-account webhook registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub user_id: String,
    pub webhook_url: String,
    pub secret_token: Option<String>,
    pub is_active: bool,
    pub created_at: u64,
    pub last_triggered: Option<u64>,
}

/// Envelope POSTed to registered endpoints
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: String,
    pub data: MessageView,
}

// ── Database operations ──

impl Database {
    /// Create the webhooks table (called from run_migrations)
    pub(crate) async fn create_webhooks_table(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                user_id TEXT PRIMARY KEY NOT NULL,
                webhook_url TEXT NOT NULL,
                secret_token TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                last_triggered INTEGER,
                FOREIGN KEY (user_id) REFERENCES users (user_id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Register (or replace) the account's webhook endpoint
    pub async fn set_webhook(
        &self,
        user_id: &str,
        url: &str,
        secret_token: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO webhooks (user_id, webhook_url, secret_token, is_active, created_at, last_triggered) VALUES (?, ?, ?, 1, ?, NULL)",
        )
        .bind(user_id)
        .bind(url)
        .bind(secret_token)
        .bind(now() as i64)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_active_webhook(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Option<WebhookRegistration>> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE user_id = ? AND is_active = 1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|row| WebhookRegistration {
            user_id: row.get("user_id"),
            webhook_url: row.get("webhook_url"),
            secret_token: row.get("secret_token"),
            is_active: row.get("is_active"),
            created_at: row.get::<i64, _>("created_at") as u64,
            last_triggered: row
                .get::<Option<i64>, _>("last_triggered")
                .map(|t| t as u64),
        }))
    }

    pub async fn touch_webhook_triggered(&self, user_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE webhooks SET last_triggered = ? WHERE user_id = ?")
            .bind(now() as i64)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_webhook_sent(&self, message_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE messages SET webhook_sent = 1 WHERE message_id = ?")
            .bind(message_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

// ── Event delivery ──

/// Notify the receiver's webhook of a new message, off the request path.
///
/// Spawned and never awaited: the send that triggered it has already
/// committed and returns regardless of what happens here.
pub fn dispatch_new_message(state: SharedState, receiver_id: String, message: MessageView) {
    tokio::spawn(async move {
        if let Err(e) = deliver_new_message(&state, &receiver_id, message).await {
            warn!("Webhook delivery for user {} failed: {:#}", receiver_id, e);
        }
    });
}

async fn deliver_new_message(
    state: &SharedState,
    receiver_id: &str,
    message: MessageView,
) -> anyhow::Result<()> {
    let Some(webhook) = state.db.get_active_webhook(receiver_id).await? else {
        // No registration is a no-op, not an error
        return Ok(());
    };

    let message_id = message.message_id.clone();
    let payload = WebhookPayload {
        event: "new_message".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        data: message,
    };

    let client = reqwest::Client::new();
    let mut request = client
        .post(&webhook.webhook_url)
        .header("Content-Type", "application/json")
        .header("User-Agent", USER_AGENT)
        .json(&payload)
        .timeout(DELIVERY_TIMEOUT);

    if let Some(secret) = &webhook.secret_token {
        request = request.header("X-Secret-Token", secret);
    }

    // Single attempt, never retried; a flaky endpoint gets the next
    // message's notification instead of a replay of this one.
    let response = request.send().await?;

    if response.status().is_success() {
        state.db.mark_webhook_sent(&message_id).await?;
        state.db.touch_webhook_triggered(receiver_id).await?;
        debug!("Webhook delivered for user {}", receiver_id);
    } else {
        warn!(
            "Webhook for user {} got status {}: {}",
            receiver_id,
            response.status(),
            webhook.webhook_url
        );
    }

    Ok(())
}
