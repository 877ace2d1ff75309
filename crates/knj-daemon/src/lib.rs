// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "HTTP/WebSocket API surface for Knjižba."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Request/response endpoints for documents, bookings, approval, export,
//! law search, and audit reads; WebSockets for streaming chat and live
//! pipeline events. The middleware stack gates everything: request ids,
//! request logs, and a session layer that authenticates the bearer token
//! and enforces the per-user rate limit before anything can reach the
//! inference orchestrator. Only login and the liveness probe are public.

mod events;
mod middleware;
mod ocr;

pub use events::{EventBus, PipelineEvent};
pub use middleware::{
    request_id, request_logger, RequestId, SessionGate, SessionGateLayer, SessionGateService,
};
pub use ocr::OrchestratorOcr;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{Path as AxPath, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::NaiveDate;
use knj_approval::{ApprovalGateway, BookingPatch};
use knj_audit::AuditLog;
use knj_auth::{AuthError, AuthService, Session};
use knj_config::ServerConfig;
use knj_core::{BookingStatus, DocClass};
use knj_error::{ErrorCode, KnjError};
use knj_export::ExportService;
use knj_infer::{
    CancelReason, InferKind, InferOutcome, InferRequest, Orchestrator, TokenEvent,
};
use knj_memory::MemoryStore;
use knj_pipeline::{BookingFilter, Pipeline};
use knj_rag::RagIndex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared state behind every handler.
pub struct AppState {
    /// Loaded configuration.
    pub config: ServerConfig,
    /// Session and quota service.
    pub auth: Arc<AuthService>,
    /// Booking pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Approval gateway.
    pub approval: Arc<ApprovalGateway>,
    /// ERP exporter.
    pub export: Arc<ExportService>,
    /// Legal retrieval index.
    pub rag: Arc<RagIndex>,
    /// Audit log.
    pub audit: Arc<AuditLog>,
    /// Inference orchestrator.
    pub orchestrator: Arc<Orchestrator>,
    /// Memory store.
    pub memory: Arc<MemoryStore>,
    /// Live pipeline event bus.
    pub events: EventBus,
}

/// API error envelope: stable code, message, context.
#[derive(Debug)]
pub struct ApiError(pub KnjError);

impl From<KnjError> for ApiError {
    fn from(err: KnjError) -> Self {
        Self(err)
    }
}

impl From<&AuthError> for ApiError {
    fn from(err: &AuthError) -> Self {
        let code = match err {
            AuthError::Failed => ErrorCode::AuthFailed,
            AuthError::Locked { .. } => ErrorCode::AuthLocked,
            AuthError::InvalidSession => ErrorCode::SessionInvalid,
            AuthError::QuotaExceeded | AuthError::StreamLimit => ErrorCode::QuotaExceeded,
            _ => ErrorCode::Internal,
        };
        let mut knj = KnjError::new(code, err.to_string());
        if let AuthError::Locked { retry_after_secs } = err {
            knj = knj.with_retry_after(*retry_after_secs);
        }
        Self(knj)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(serde_json::json!({ "error": self.0 }))).into_response()
    }
}

/// Build the router with all routes and middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/auth/login", post(cmd_login))
        .route("/documents", post(cmd_upload))
        .route("/bookings", get(cmd_list_bookings))
        .route("/bookings/{id}", get(cmd_get_booking))
        .route("/bookings/{id}/approve", post(cmd_approve))
        .route("/bookings/{id}/reject", post(cmd_reject))
        .route("/bookings/{id}/correct", post(cmd_correct))
        .route("/export/{client_id}", post(cmd_export))
        .route("/laws/search", get(cmd_laws_search))
        .route("/audit", get(cmd_audit))
        .route("/chat", get(cmd_chat_ws))
        .route("/events", get(cmd_events_ws))
        .route("/admin/corpus/quarantine", get(cmd_quarantine))
        .route("/admin/corpus/{id}/confirm", post(cmd_confirm_corpus))
        .layer(SessionGate::new(Arc::clone(&state.auth)).into_layer())
        .layer(axum::middleware::from_fn(request_logger))
        .layer(axum::middleware::from_fn(request_id))
        // The operator UI is served from another local port. CORS sits
        // outermost so preflight requests never hit the session gate.
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health & auth
// ---------------------------------------------------------------------------

async fn cmd_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "contract_version": knj_core::CONTRACT_VERSION,
        "model": state.orchestrator.primary_id().await,
        "queue_depth": state.orchestrator.queue_depth(),
        "ingest_paused": state.pipeline.is_paused(),
    }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    role: String,
    expires_at: String,
}

async fn cmd_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let session = state
        .auth
        .login(&req.username, &req.password)
        .map_err(|e| ApiError::from(&e))?;
    Ok(Json(LoginResponse {
        token: session.token,
        role: session.role.to_string(),
        expires_at: session.expires_at.to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Documents & bookings
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct UploadResponse {
    blob_id: String,
    booking_id: Uuid,
}

async fn cmd_upload(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    if !session.role.can_decide() {
        return Err(ApiError(KnjError::new(
            ErrorCode::Forbidden,
            "document upload requires the accountant role",
        )));
    }

    let client_id = header_value(&headers, "x-client-id")
        .ok_or_else(|| bad_input("missing x-client-id header"))?;
    let media_type = header_value(&headers, "content-type")
        .ok_or_else(|| bad_input("missing content-type header"))?;
    let doc_class: DocClass = header_value(&headers, "x-doc-class")
        .and_then(|raw| serde_json::from_value(serde_json::Value::String(raw)).ok())
        .ok_or_else(|| bad_input("missing or unknown x-doc-class header"))?;

    if !state.config.accepted_doc_classes.contains(&doc_class) {
        return Err(ApiError(KnjError::new(
            ErrorCode::InputUnsupported,
            format!("document class {doc_class} is not accepted"),
        )));
    }
    if body.is_empty() {
        return Err(bad_input("empty document body"));
    }

    let (blob_id, booking_id) = state
        .pipeline
        .ingest(&client_id, &body, &media_type, doc_class)
        .map_err(|e| ApiError(KnjError::from(&e)))?;

    // Drive the booking in the background unless backpressure is on.
    if !state.pipeline.is_paused() {
        let pipeline = Arc::clone(&state.pipeline);
        let events = state.events.clone();
        let client = client_id.clone();
        tokio::spawn(async move {
            match pipeline.run(booking_id).await {
                Ok(status) => events.publish(PipelineEvent {
                    booking_id,
                    client_id: client,
                    status,
                }),
                Err(err) => warn!(booking = %booking_id, error = %err, "pipeline run failed"),
            }
        });
    }

    Ok(Json(UploadResponse {
        blob_id: blob_id.0,
        booking_id,
    }))
}

#[derive(Debug, Deserialize)]
struct BookingListQuery {
    status: Option<String>,
    client: Option<String>,
}

async fn cmd_list_bookings(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(query): Query<BookingListQuery>,
) -> Result<Response, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            serde_json::from_value::<BookingStatus>(serde_json::Value::String(raw.to_string()))
                .map_err(|_| bad_input(format!("unknown status '{raw}'")))?,
        ),
    };
    let filter = BookingFilter {
        status,
        client_id: query.client,
    };
    let summaries = state
        .approval
        .list(&filter, &session)
        .map_err(|e| ApiError(KnjError::from(&e)))?;
    Ok(Json(summaries).into_response())
}

async fn cmd_get_booking(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    AxPath(id): AxPath<Uuid>,
) -> Result<Response, ApiError> {
    let detail = state
        .approval
        .get(id, &session)
        .map_err(|e| ApiError(KnjError::from(&e)))?;
    Ok(Json(detail).into_response())
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    booking_id: Uuid,
    status: BookingStatus,
}

async fn cmd_approve(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    AxPath(id): AxPath<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state
        .approval
        .approve(id, &session)
        .await
        .map_err(|e| ApiError(KnjError::from(&e)))?;
    publish_booking_event(&state, id, status);
    Ok(Json(StatusResponse {
        booking_id: id,
        status,
    }))
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    reason: String,
}

async fn cmd_reject(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    AxPath(id): AxPath<Uuid>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state
        .approval
        .reject(id, &session, &req.reason)
        .await
        .map_err(|e| ApiError(KnjError::from(&e)))?;
    publish_booking_event(&state, id, status);
    Ok(Json(StatusResponse {
        booking_id: id,
        status,
    }))
}

#[derive(Debug, Serialize)]
struct CorrectResponse {
    new_booking_id: Uuid,
}

async fn cmd_correct(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    AxPath(id): AxPath<Uuid>,
    Json(patch): Json<BookingPatch>,
) -> Result<Json<CorrectResponse>, ApiError> {
    let new_booking_id = state
        .approval
        .correct(id, patch, &session)
        .await
        .map_err(|e| ApiError(KnjError::from(&e)))?;
    Ok(Json(CorrectResponse { new_booking_id }))
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExportRequest {
    target: String,
}

async fn cmd_export(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    AxPath(client_id): AxPath<String>,
    Json(req): Json<ExportRequest>,
) -> Result<Response, ApiError> {
    if !session.role.can_decide() {
        return Err(ApiError(KnjError::new(
            ErrorCode::Forbidden,
            "export requires the accountant role",
        )));
    }
    let receipts = state
        .export
        .export_client(&client_id, &req.target)
        .await
        .map_err(|e| ApiError(KnjError::from(&e)))?;
    Ok(Json(receipts).into_response())
}

// ---------------------------------------------------------------------------
// Law search & audit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LawSearchQuery {
    q: String,
    as_of: NaiveDate,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LawHit {
    citation: String,
    law_code: String,
    article: u32,
    score: f64,
    excerpt: String,
}

async fn cmd_laws_search(
    State(state): State<Arc<AppState>>,
    Extension(_session): Extension<Session>,
    Query(query): Query<LawSearchQuery>,
) -> Result<Response, ApiError> {
    let hits = state
        .rag
        .search(&query.q, query.as_of, query.top_k.unwrap_or(5))
        .await
        .map_err(|e| ApiError(KnjError::internal(e.to_string())))?;
    let out: Vec<LawHit> = hits
        .into_iter()
        .map(|hit| LawHit {
            citation: hit.citation.to_string(),
            law_code: hit.chunk.law_code.clone(),
            article: hit.chunk.article,
            score: hit.score,
            excerpt: hit.chunk.text.chars().take(240).collect(),
        })
        .collect();
    Ok(Json(out).into_response())
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    from: u64,
    to: u64,
}

async fn cmd_audit(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(query): Query<AuditQuery>,
) -> Result<Response, ApiError> {
    if !session.role.can_administer() {
        return Err(ApiError(KnjError::new(
            ErrorCode::Forbidden,
            "audit reads require the admin role",
        )));
    }
    let events = state
        .audit
        .events(query.from, query.to)
        .map_err(|e| ApiError(KnjError::internal(e.to_string())))?;
    Ok(Json(events).into_response())
}

// ---------------------------------------------------------------------------
// Corpus administration
// ---------------------------------------------------------------------------

async fn cmd_quarantine(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Response, ApiError> {
    if !session.role.can_administer() {
        return Err(ApiError(KnjError::new(
            ErrorCode::Forbidden,
            "quarantine reads require the admin role",
        )));
    }
    let chunks = state
        .rag
        .quarantined()
        .map_err(|e| ApiError(KnjError::internal(e.to_string())))?;
    Ok(Json(chunks).into_response())
}

async fn cmd_confirm_corpus(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    AxPath(id): AxPath<i64>,
) -> Result<Response, ApiError> {
    if !session.role.can_administer() {
        return Err(ApiError(KnjError::new(
            ErrorCode::Forbidden,
            "corpus confirmation requires the admin role",
        )));
    }
    state
        .rag
        .confirm(id, &format!("user:{}", session.username))
        .await
        .map_err(|e| ApiError(KnjError::internal(e.to_string())))?;
    Ok(Json(serde_json::json!({ "confirmed": id })).into_response())
}

// ---------------------------------------------------------------------------
// WebSockets
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatStart {
    prompt: String,
    #[serde(default)]
    client_id: Option<String>,
}

async fn cmd_chat_ws(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    Ok(ws.on_upgrade(move |socket| chat_session(state, session, socket)))
}

async fn chat_session(state: Arc<AppState>, session: Session, mut socket: WebSocket) {
    // Concurrent-stream quota, released when the socket closes.
    let _stream_guard = match state.auth.acquire_stream(&session.username) {
        Ok(guard) => guard,
        Err(err) => {
            let _ = send_ws_error(&mut socket, &ApiError::from(&err).0).await;
            return;
        }
    };

    let Some(Ok(Message::Text(first))) = socket.recv().await else {
        return;
    };
    let Ok(start) = serde_json::from_str::<ChatStart>(&first) else {
        let _ = send_ws_error(
            &mut socket,
            &KnjError::new(ErrorCode::InputInvalid, "expected {prompt, client_id?}"),
        )
        .await;
        return;
    };

    let context = match &start.client_id {
        Some(client) => state
            .memory
            .recent_journal(client, 5)
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.to_string())
            .collect(),
        None => vec![],
    };

    let request = InferRequest {
        kind: InferKind::Chat,
        user: session.username.clone(),
        system_prompt: CHAT_SYSTEM_PROMPT.to_string(),
        prompt: start.prompt,
        context,
        image: None,
        deadline: Duration::from_secs(120),
    };

    let outcome = match state.orchestrator.infer(request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = send_ws_error(&mut socket, &infer_error(&err)).await;
            return;
        }
    };
    let InferOutcome::Stream { mut tokens, cancel } = outcome else {
        let _ = send_ws_error(
            &mut socket,
            &KnjError::internal("chat did not return a stream"),
        )
        .await;
        return;
    };

    loop {
        tokio::select! {
            event = tokens.recv() => {
                let Some(event) = event else { break };
                let frame = match event {
                    TokenEvent::Token(token) => serde_json::json!({ "token": token }),
                    TokenEvent::Done(usage) => serde_json::json!({ "done": usage }),
                    TokenEvent::Cancelled => serde_json::json!({ "cancelled": true }),
                };
                if socket
                    .send(Message::Text(frame.to_string().into()))
                    .await
                    .is_err()
                {
                    // Client went away: release the slot promptly.
                    cancel.cancel(CancelReason::ClientGone);
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        cancel.cancel(CancelReason::ClientGone);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn cmd_events_ws(
    State(state): State<Arc<AppState>>,
    Extension(_session): Extension<Session>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let mut rx = state.events.subscribe();
    Ok(ws.on_upgrade(move |mut socket| async move {
        while let Ok(event) = rx.recv().await {
            let Ok(frame) = serde_json::to_string(&event) else {
                continue;
            };
            if socket.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const CHAT_SYSTEM_PROMPT: &str = "You are the bookkeeping office assistant. Answer questions \
    about documents and bookings. You give procedural information, never legal advice, and you \
    never approve bookings yourself.";

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

fn bad_input(message: impl Into<String>) -> ApiError {
    ApiError(KnjError::new(ErrorCode::InputInvalid, message))
}

fn infer_error(err: &knj_infer::InferError) -> KnjError {
    use knj_infer::InferError as E;
    match err {
        E::Overloaded { retry_after_secs } => {
            KnjError::new(ErrorCode::Overloaded, err.to_string())
                .with_retry_after(*retry_after_secs)
        }
        E::PromptTooLarge { .. } => KnjError::new(ErrorCode::InputInvalid, err.to_string()),
        E::Cancelled(_) => KnjError::new(ErrorCode::Cancelled, err.to_string()),
        E::VisionUnavailable(_) => KnjError::new(ErrorCode::VisionUnavailable, err.to_string()),
        E::Failed { .. } => KnjError::new(ErrorCode::InferenceFailed, err.to_string()),
    }
}

async fn send_ws_error(socket: &mut WebSocket, err: &KnjError) -> Result<(), axum::Error> {
    socket
        .send(Message::Text(
            serde_json::json!({ "error": err }).to_string().into(),
        ))
        .await
}

fn publish_booking_event(state: &AppState, booking_id: Uuid, status: BookingStatus) {
    let client_id = state
        .pipeline
        .store()
        .get(booking_id)
        .map(|b| b.client_id)
        .unwrap_or_default();
    state.events.publish(PipelineEvent {
        booking_id,
        client_id,
        status,
    });
    info!(booking = %booking_id, %status, "event published");
}
