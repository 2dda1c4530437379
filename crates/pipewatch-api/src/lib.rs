//! pipewatch-api - HTTP boundary for the pipewatch event relay.
//!
//! Two routes matter: the authenticated webhook that ingests pipeline events,
//! and the WebSocket endpoint that streams them to dashboard observers. The
//! relay engine itself lives in [`pipewatch_core`]; this crate only adapts it
//! to axum (signature verification, upgrade handling, the per-session loop).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use pipewatch_core::{Connection, Error, EventSink, FilterKey, PipelineEvent, StreamHub};

/// Header carrying the HMAC-SHA256 signature of the webhook body.
pub const SIGNATURE_HEADER: &str = "x-pipewatch-signature";

/// Webhook bodies carry a single event; cap well above any realistic payload.
const MAX_EVENT_BODY_BYTES: usize = 1024 * 1024;

/// A stuck peer counts as a failed send, not a stalled relay.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// REQUEST ID (UUIDv7)
// =============================================================================

/// Generates time-ordered UUIDv7 request correlation IDs.
#[derive(Clone, Default)]
pub struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

// =============================================================================
// APP STATE & ROUTER
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    /// The relay engine, constructed once at startup and shared by the
    /// ingestion handler and every subscriber session.
    pub hub: Arc<StreamHub>,
    /// Shared secret for webhook signatures. `None` means ingestion is
    /// unavailable (503) until configured.
    pub webhook_secret: Option<String>,
    /// Live WebSocket connection count, for lifecycle logging.
    pub ws_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(hub: Arc<StreamHub>, webhook_secret: Option<String>) -> Self {
        Self {
            hub,
            webhook_secret,
            ws_connections: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Parse the comma-separated `CORS_ALLOWED_ORIGINS` value into header values,
/// skipping anything that does not parse. Empty input falls back to the local
/// dashboard default.
pub fn parse_allowed_origins(origins_str: &str) -> Vec<HeaderValue> {
    if origins_str.trim().is_empty() {
        return vec![HeaderValue::from_static("http://localhost:3000")];
    }

    origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}

/// Build the application router.
pub fn app(state: AppState, allowed_origins: Vec<HeaderValue>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(SIGNATURE_HEADER),
        ]);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/v1/pipeline/events/webhook",
            post(receive_pipeline_event),
        )
        .route("/api/v1/pipeline/events/ws", get(ws_handler))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7::default()))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_EVENT_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pipewatch-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// WEBHOOK INGESTION
// =============================================================================

/// Verify an `sha256=<hex>` signature header against the raw request body.
///
/// Comparison happens inside the HMAC verifier, so it is constant-time.
pub fn signature_is_valid(secret: &str, signature_header: &str, body: &[u8]) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(received) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&received).is_ok()
}

/// `POST /api/v1/pipeline/events/webhook`
///
/// The worker pipeline pushes one event per request, signed with the shared
/// secret. Delivery outcome is invisible to the pusher: once the event is
/// accepted the response is 202 regardless of how many subscribers exist or
/// how their sends go.
async fn receive_pipeline_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let Some(secret) = state.webhook_secret.as_deref() else {
        return Err(ApiError::ServiceUnavailable(
            "Webhook signature secret is not configured.".to_string(),
        ));
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing webhook signature.".to_string()))?;

    if !signature_is_valid(secret, signature, &body) {
        return Err(ApiError::Unauthorized(
            "Invalid webhook signature.".to_string(),
        ));
    }

    let event: PipelineEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid event payload: {e}")))?;

    state.hub.publish(event).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"message": "Webhook event accepted"})),
    ))
}

// =============================================================================
// WEBSOCKET SUBSCRIBERS
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    /// Artifact to observe in realtime; omit to receive all events.
    artifact: Option<String>,
    /// When true, skips the initial backlog of recent events.
    #[serde(default)]
    skip_snapshot: bool,
}

/// `GET /api/v1/pipeline/events/ws?artifact=<name>&skipSnapshot=<bool>`
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_session(socket, state, params))
}

async fn handle_ws_session(socket: WebSocket, state: AppState, params: WsQuery) {
    let filter = FilterKey::normalize(params.artifact.as_deref());

    let count = state.ws_connections.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(active = count, channel = %filter, "WebSocket connection opened");

    match run_ws_session(socket, &state, filter, params.skip_snapshot).await {
        Ok(()) => {
            tracing::info!("Client disconnected from events websocket");
        }
        Err(err) if err.is_transport() => {
            tracing::info!(error = %err, "Client connection lost");
        }
        Err(err) => {
            tracing::warn!(error = %err, "Unexpected error in websocket session");
        }
    }

    let count = state.ws_connections.fetch_sub(1, Ordering::Relaxed) - 1;
    tracing::info!(active = count, "WebSocket connection closed");
}

/// The per-subscriber session loop.
///
/// Registers the connection, optionally replays the backlog, then idles as a
/// passive dispatch target. Inbound frames are consumed and discarded; they
/// only serve to detect the peer closing the channel. The registration guard
/// deregisters the connection on every exit path, including cancellation.
async fn run_ws_session(
    socket: WebSocket,
    state: &AppState,
    filter: FilterKey,
    skip_snapshot: bool,
) -> pipewatch_core::Result<()> {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(WsSink::new(sender));
    let connection = Connection::new(sink.clone());
    let _registration = state.hub.clone().register(filter.clone(), connection);

    if !skip_snapshot {
        for event in state.hub.snapshot(&filter) {
            sink.send_json(&event.to_wire()?).await?;
        }
    }

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => return Err(Error::Transport(err.to_string())),
        }
    }
    Ok(())
}

/// [`EventSink`] over the write half of an axum WebSocket.
struct WsSink {
    sender: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender: tokio::sync::Mutex::new(sender),
        }
    }
}

#[async_trait::async_trait]
impl EventSink for WsSink {
    async fn send_json(&self, payload: &serde_json::Value) -> pipewatch_core::Result<()> {
        let text = serde_json::to_string(payload)?;
        let mut sender = self.sender.lock().await;
        match tokio::time::timeout(WS_SEND_TIMEOUT, sender.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::Transport(err.to_string())),
            Err(_) => Err(Error::Transport("websocket send timed out".to_string())),
        }
    }
}

// =============================================================================
// ERROR HANDLING
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
