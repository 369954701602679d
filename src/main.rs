//! # Courier Relay Server
//!
//! Store-and-forward messaging relay: accounts exchange text and file
//! messages addressed by user id and drain them with cursor-based polling.
//! A background engine enforces retention and storage quotas; new messages
//! fan out to per-user webhooks best-effort.

mod db;
mod error;
mod files;
mod handlers;
mod models;
mod retention;
mod state;
mod validation;
mod webhook;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use files::FileConfig;
use handlers::{
    chat_history_handler, download_file_handler, get_me_handler, get_updates_handler,
    health_handler, register_handler, send_file_handler, send_message_handler,
    set_webhook_handler,
};
use retention::RetentionConfig;
use state::{AppState, SharedState, StorageLimits};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server bind address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Database file path
    #[arg(short = 'd', long, default_value = "courier.db")]
    database: String,

    /// Directory for file attachments
    #[arg(long, default_value = "./courier_files")]
    storage_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Starting Courier Relay Server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Bind address: {}:{}", args.host, args.port);
    info!("Initializing database: {}", args.database);

    let file_config = FileConfig {
        storage_dir: args.storage_dir,
        ..FileConfig::default()
    };
    let app_state = AppState::new(&args.database, file_config, StorageLimits::default()).await?;
    let state: SharedState = Arc::new(app_state);

    // Retention engine owned by this scope; firing (or dropping) the sender
    // stops the loop
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let retention_task = retention::start(state.clone(), RetentionConfig::default(), shutdown_rx);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/users/register", post(register_handler))
        .route("/api/sendMessage", post(send_message_handler))
        .route("/api/sendFile", post(send_file_handler))
        .route("/api/getUpdates", get(get_updates_handler))
        .route("/api/getChatHistory", get(chat_history_handler))
        .route("/api/files/download/:file_id", get(download_file_handler))
        .route("/api/setWebhook", post(set_webhook_handler))
        .route("/api/getMe", get(get_me_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .allow_origin(Any),
                ),
        );

    println!("Courier Relay Server starting on {}:{}", args.host, args.port);
    println!();
    println!("Endpoints:");
    println!("  GET    /health                      - Health check");
    println!("  POST   /api/users/register          - Account registration");
    println!("  POST   /api/sendMessage             - Send text message (X-API-Key)");
    println!("  POST   /api/sendFile                - Send file message (X-API-Key)");
    println!("  GET    /api/getUpdates              - Poll updates (?offset=&limit=&timeout=)");
    println!("  GET    /api/getChatHistory          - Conversation history (?user_id=&limit=&offset=)");
    println!("  GET    /api/files/download/:file_id - Download attachment");
    println!("  POST   /api/setWebhook              - Register webhook endpoint");
    println!("  GET    /api/getMe                   - Account and storage info");
    println!();

    let listener = tokio::net::TcpListener::bind(&format!("{}:{}", args.host, args.port)).await?;
    info!("Server successfully bound to {}:{}", args.host, args.port);

    axum::serve(listener, app).await?;

    info!("Shutting down server...");
    let _ = shutdown_tx.send(());
    let _ = retention_task.await;

    Ok(())
}
