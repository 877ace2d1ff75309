// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the HTTP API: request ids, structured request
//! logs, and the bearer-session / rate-limit gate.

use crate::ApiError;
use axum::{
    body::Body,
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use knj_auth::{AuthService, Session};
use knj_error::{ErrorCode, KnjError};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Generates a [`RequestId`] per request and echoes it in the
/// `X-Request-Id` response header.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

// ---------------------------------------------------------------------------
// RequestLogger
// ---------------------------------------------------------------------------

/// Logs method, path, status, and duration with structured fields.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

// ---------------------------------------------------------------------------
// SessionGate
// ---------------------------------------------------------------------------

/// Endpoints reachable without a session: login and the liveness probe.
const PUBLIC_PATHS: &[&str] = &["/health", "/auth/login"];

/// Bearer-session and per-user rate-limit enforcement.
///
/// Applied once over the whole router. Every other request must carry a
/// valid token (the `Authorization` header, or a `token` query parameter
/// for browser WebSocket clients); the resolved [`Session`] is inserted
/// as a request extension for handlers to consume. Rate limiting runs
/// here, before anything can reach the inference orchestrator.
#[derive(Clone)]
pub struct SessionGate {
    auth: Arc<AuthService>,
}

impl SessionGate {
    /// Build a gate over the auth service.
    #[must_use]
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self { auth }
    }

    /// Create a Tower [`Layer`](tower::Layer) from this gate.
    #[must_use]
    pub fn into_layer(self) -> SessionGateLayer {
        SessionGateLayer(self)
    }

    /// Resolve and rate-check the caller, or produce the error response.
    fn admit(&self, req: &Request) -> Result<Session, Response> {
        let token = bearer_token(req.headers())
            .or_else(|| query_token(req.uri()))
            .ok_or_else(|| {
                ApiError(KnjError::new(ErrorCode::SessionInvalid, "missing bearer token"))
                    .into_response()
            })?;
        let session = self
            .auth
            .authenticate(&token)
            .map_err(|e| ApiError::from(&e).into_response())?;
        self.auth
            .check_rate(&session.username)
            .map_err(|e| ApiError::from(&e).into_response())?;
        Ok(session)
    }
}

/// Tower [`Layer`] that wraps services with [`SessionGate`] enforcement.
#[derive(Clone)]
pub struct SessionGateLayer(SessionGate);

impl<S: Clone> tower::Layer<S> for SessionGateLayer {
    type Service = SessionGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionGateService {
            gate: self.0.clone(),
            inner,
        }
    }
}

/// Tower [`Service`] that authenticates the request before forwarding to
/// the inner service.
#[derive(Clone)]
pub struct SessionGateService<S> {
    gate: SessionGate,
    inner: S,
}

impl<S> tower::Service<Request<Body>> for SessionGateService<S>
where
    S: tower::Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if PUBLIC_PATHS.contains(&req.uri().path()) {
                return inner.call(req).await;
            }
            match gate.admit(&req) {
                Ok(session) => {
                    req.extensions_mut().insert(session);
                    inner.call(req).await
                }
                Err(response) => Ok(response),
            }
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// `?token=` fallback for WebSocket clients that cannot set headers.
fn query_token(uri: &Uri) -> Option<String> {
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}
