//! HTTP handlers for the Courier relay server
//!
//! Handlers stay thin: resolve the caller's API key, validate the request
//! shape, call into `AppState`, and map the result to JSON.

use crate::error::ApiError;
use crate::models::{
    Account, ChatHistoryResponse, HealthResponse, MeResponse, RegisterRequest, RegisterResponse,
    SendFileRequest, SendFileResponse, SendMessageRequest, SendMessageResponse, SetWebhookRequest,
    StorageInfo, UpdatesResponse,
};
use crate::state::SharedState;
use crate::validation::{validate_email, validate_user_id, validate_username};
use crate::webhook;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use base64::Engine;
use std::collections::HashMap;
use tracing::info;

/// Extract the API key from the X-API-Key header, falling back to an
/// `api_key` query parameter
fn extract_api_key<'a>(
    headers: &'a HeaderMap,
    params: &'a HashMap<String, String>,
) -> Option<&'a str> {
    if let Some(value) = headers.get("X-API-Key") {
        if let Ok(key) = value.to_str() {
            return Some(key);
        }
    }
    params.get("api_key").map(String::as_str)
}

async fn authenticate(
    state: &SharedState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<Account, ApiError> {
    let api_key = extract_api_key(headers, params)
        .ok_or_else(|| ApiError::Unauthenticated("API Key required".into()))?;
    state.authenticate(api_key).await
}

fn parse_param<T: std::str::FromStr>(params: &HashMap<String, String>, key: &str) -> Option<T> {
    params.get(key).and_then(|v| v.parse().ok())
}

/// Health check endpoint
pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime(),
    })
}

/// Account registration (POST /api/users/register)
pub async fn register_handler(
    State(state): State<SharedState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    validate_user_id(&request.user_id).map_err(ApiError::Validation)?;
    validate_username(&request.username).map_err(ApiError::Validation)?;
    validate_email(&request.email).map_err(ApiError::Validation)?;

    let account = state
        .register_account(&request.user_id, &request.username, &request.email)
        .await?;

    info!("Registered new user: {}", account.user_id);

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully".into(),
            user: account,
        }),
    ))
}

/// Send a text (or reply) message (POST /api/sendMessage)
pub async fn send_message_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let sender = authenticate(&state, &headers, &params).await?;

    if request.receiver_id.is_empty() {
        return Err(ApiError::Validation("Receiver ID is required".into()));
    }
    if request.text.is_empty() {
        return Err(ApiError::Validation("Message text is required".into()));
    }

    let receipt = state
        .send_text(
            &sender,
            &request.receiver_id,
            &request.text,
            request.reply_to_message_id.clone(),
        )
        .await?;

    state.notify_new_message(&request.receiver_id).await;
    webhook::dispatch_new_message(state.clone(), request.receiver_id.clone(), receipt.view.clone());

    Ok(Json(SendMessageResponse {
        message_id: receipt.message_id,
        update_id: receipt.update_id,
        sent_at: receipt.sent_at,
    }))
}

/// Send a file message (POST /api/sendFile); bytes arrive base64-encoded
pub async fn send_file_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<SendFileRequest>,
) -> Result<Json<SendFileResponse>, ApiError> {
    let sender = authenticate(&state, &headers, &params).await?;

    if request.receiver_id.is_empty() {
        return Err(ApiError::Validation("Receiver ID is required".into()));
    }
    if request.file_name.is_empty() {
        return Err(ApiError::Validation("No file selected".into()));
    }

    let data = base64::engine::general_purpose::STANDARD
        .decode(&request.data)
        .map_err(|_| ApiError::Validation("File data is not valid base64".into()))?;

    let receipt = state
        .send_file(
            &sender,
            &request.receiver_id,
            &request.file_name,
            &data,
            request.mime_type.clone(),
            request.caption.clone(),
            request.reply_to_message_id.clone(),
        )
        .await?;

    state.notify_new_message(&request.receiver_id).await;
    webhook::dispatch_new_message(state.clone(), request.receiver_id.clone(), receipt.view.clone());

    Ok(Json(SendFileResponse {
        file_id: receipt.file_id.unwrap_or_default(),
        message_id: receipt.message_id,
        update_id: receipt.update_id,
        sent_at: receipt.sent_at,
    }))
}

/// Cursor-based update retrieval (GET /api/getUpdates?offset=&limit=&timeout=)
pub async fn get_updates_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<UpdatesResponse>, ApiError> {
    let account = authenticate(&state, &headers, &params).await?;

    let offset: Option<i64> = parse_param(&params, "offset");
    let limit: i64 = parse_param(&params, "limit").unwrap_or(state.limits.poll_limit);
    let timeout: u64 = parse_param(&params, "timeout").unwrap_or(0);

    let (updates, next_offset) = state.get_updates(&account, offset, limit, timeout).await?;

    Ok(Json(UpdatesResponse {
        updates,
        next_offset,
    }))
}

/// Conversation history with one other user (GET /api/getChatHistory)
pub async fn chat_history_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ChatHistoryResponse>, ApiError> {
    let account = authenticate(&state, &headers, &params).await?;

    let other_user_id = params
        .get("user_id")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Validation("User ID is required".into()))?;
    let limit: i64 = parse_param(&params, "limit").unwrap_or(50);
    let offset: i64 = parse_param(&params, "offset").unwrap_or(0);

    let messages = state
        .chat_history(&account, other_user_id, limit, offset)
        .await?;
    let count = messages.len();

    Ok(Json(ChatHistoryResponse { messages, count }))
}

/// Download a file attachment (GET /api/files/download/:file_id)
pub async fn download_file_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(file_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<([(header::HeaderName, String); 2], Vec<u8>), ApiError> {
    let account = authenticate(&state, &headers, &params).await?;

    let (data, mime_type, original_name) = state.download_file(&account, &file_id).await?;

    Ok((
        [
            (
                header::CONTENT_TYPE,
                mime_type.unwrap_or_else(|| "application/octet-stream".into()),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", original_name),
            ),
        ],
        data,
    ))
}

/// Register (or replace) the caller's webhook (POST /api/setWebhook)
pub async fn set_webhook_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<SetWebhookRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account = authenticate(&state, &headers, &params).await?;

    if request.url.is_empty() {
        return Err(ApiError::Validation("Webhook URL is required".into()));
    }

    state
        .db
        .set_webhook(
            &account.user_id,
            &request.url,
            request.secret_token.as_deref(),
        )
        .await?;

    info!("Webhook set for user {}", account.user_id);

    Ok(Json(serde_json::json!({
        "message": "Webhook set successfully"
    })))
}

/// Caller's account and storage usage (GET /api/getMe)
pub async fn get_me_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<MeResponse>, ApiError> {
    let account = authenticate(&state, &headers, &params).await?;

    let limit_bytes = state.limits.max_user_storage;
    let used_percentage = if limit_bytes > 0 {
        (account.storage_used as f64 / limit_bytes as f64 * 10_000.0).round() / 100.0
    } else {
        0.0
    };

    Ok(Json(MeResponse {
        storage_info: StorageInfo {
            used_bytes: account.storage_used,
            limit_bytes,
            used_percentage,
        },
        user: account,
    }))
}
