//! Retention and eviction engine
//!
//! A single background task periodically (1) expires messages past the
//! retention window, (2) evicts oldest file-bearing messages while the store
//! is over the global cap, and (3) does the same per account over its own
//! cap. Every deletion removes the backing blob (a blob that is already gone
//! is fine), then deletes the record and credits the sender's ledger in one
//! transaction. A failed cycle is logged and retried after a backoff; the
//! loop itself never exits until shutdown.

use crate::db::now;
use crate::state::{AppState, SharedState};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Scheduling knobs for the engine
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Pause between successful cycles (default: 300s)
    pub interval: Duration,
    /// Pause before retrying after a failed cycle (default: 60s)
    pub retry_backoff: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(60),
        }
    }
}

/// What one cycle deleted
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub expired: usize,
    pub evicted_global: usize,
    pub evicted_per_user: usize,
}

impl CycleStats {
    pub fn total(&self) -> usize {
        self.expired + self.evicted_global + self.evicted_per_user
    }
}

/// Start the engine as a task owned by the caller; dropping or firing the
/// shutdown sender stops it after the current pause.
pub fn start(
    state: SharedState,
    config: RetentionConfig,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Retention engine started (interval {:?}, window {:?})",
            config.interval, state.limits.retention_window
        );

        loop {
            let pause = match run_cycle(&state).await {
                Ok(stats) => {
                    if stats.total() > 0 {
                        info!(
                            "Retention cycle: {} expired, {} evicted for global cap, {} for per-user caps",
                            stats.expired, stats.evicted_global, stats.evicted_per_user
                        );
                    }
                    config.interval
                }
                Err(e) => {
                    error!("Retention cycle failed, retrying after backoff: {:#}", e);
                    config.retry_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = &mut shutdown => {
                    info!("Retention engine stopping");
                    return;
                }
            }
        }
    })
}

/// One full retention pass: expiry sweep, then global cap, then per-user
/// caps. Public so tests can drive cycles deterministically.
pub async fn run_cycle(state: &AppState) -> Result<CycleStats> {
    let mut stats = CycleStats::default();

    stats.expired = expire_old_messages(state).await?;
    stats.evicted_global = enforce_global_cap(state).await?;
    stats.evicted_per_user = enforce_user_caps(state).await?;

    Ok(stats)
}

/// Delete every message past the retention window
async fn expire_old_messages(state: &AppState) -> Result<usize> {
    let cutoff = now().saturating_sub(state.limits.retention_window.as_secs());
    let expired = state.db.messages_older_than(cutoff).await?;

    let mut deleted = 0;
    for message in &expired {
        if delete_message(state, message).await? {
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// While the store-wide attachment total is over the global cap, evict the
/// oldest file-bearing messages regardless of sender.
async fn enforce_global_cap(state: &AppState) -> Result<usize> {
    let total = state.db.total_file_storage().await?;
    let cap = state.limits.max_total_storage as i64;
    if total <= cap {
        return Ok(0);
    }

    let candidates = state.db.file_messages_oldest_first(None).await?;
    let mut freed: i64 = 0;
    let mut deleted = 0;

    for message in &candidates {
        if total - freed <= cap {
            break;
        }
        if delete_message(state, message).await? {
            freed += message.file_size.unwrap_or(0);
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// For each account over its own cap, evict its oldest file-bearing
/// messages until it fits again.
async fn enforce_user_caps(state: &AppState) -> Result<usize> {
    let cap = state.limits.max_user_storage as i64;
    let over = state.db.accounts_over_cap(cap).await?;

    let mut deleted = 0;
    for account in &over {
        let candidates = state
            .db
            .file_messages_oldest_first(Some(&account.user_id))
            .await?;
        let mut freed: i64 = 0;

        for message in &candidates {
            if account.storage_used - freed <= cap {
                break;
            }
            if delete_message(state, message).await? {
                freed += message.file_size.unwrap_or(0);
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}

/// Remove a message's blob, then its record + ledger entry in one
/// transaction. A record a concurrent sweep already deleted counts as done.
async fn delete_message(state: &AppState, message: &crate::models::MessageRecord) -> Result<bool> {
    if let Some(path) = message.file_path.as_deref() {
        if let Err(e) = state.files.remove(path).await {
            warn!(
                "Failed to remove blob for message {}: {:#}",
                message.message_id, e
            );
        }
    }

    state
        .db
        .delete_message_with_ledger(message.seq, &message.sender_id, message.file_size.unwrap_or(0))
        .await
}
