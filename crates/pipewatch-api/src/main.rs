//! pipewatch-api - HTTP API server for the pipewatch event relay

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipewatch_api::{app, parse_allowed_origins, AppState};
use pipewatch_core::StreamHub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   RUST_LOG    - standard env filter (default: "pipewatch_api=debug,tower_http=debug")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pipewatch_api=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("pipewatch-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false), // no ANSI in files
                )
                .init();
        }
        Some(guard)
    } else if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
        None
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    // Get configuration from environment
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let webhook_secret = std::env::var("WEBHOOK_SIGNATURE_SECRET")
        .ok()
        .filter(|secret| !secret.is_empty());
    if webhook_secret.is_none() {
        tracing::warn!(
            "WEBHOOK_SIGNATURE_SECRET not set; webhook ingestion will respond 503 until configured"
        );
    }

    let allowed_origins =
        parse_allowed_origins(&std::env::var("CORS_ALLOWED_ORIGINS").unwrap_or_default());
    info!("CORS allowed origins: {:?}", allowed_origins);

    // The relay engine: one hub shared by ingestion and every subscriber
    let hub = Arc::new(StreamHub::new());
    let state = AppState::new(hub, webhook_secret);

    let router = app(state, allowed_origins);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("pipewatch-api listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
