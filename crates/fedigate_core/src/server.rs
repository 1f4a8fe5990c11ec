/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::audit::new_request_id;
use crate::config::InboxConfig;
use crate::domain_blocks::{normalize_domain, BlockScope};
use crate::error::{InboxError, Stage};
use crate::pipeline::{reject, InboxPipeline, PipelineOutcome, Rejection};
use crate::request::{client_ip, InboundHttpRequest};
use crate::store::{now_ms, InboxDb};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    middleware::{from_fn, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use fedigate_protocol::{DomainBlockRequest, DomainBlockResponse, InboxAck, InboxRejection};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};

const MAX_API_BODY: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<InboxPipeline>,
    db: InboxDb,
    api_tokens: Arc<HashMap<String, String>>,
    admins: Arc<HashSet<String>>,
    max_body: usize,
    trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(cfg: &InboxConfig, pipeline: Arc<InboxPipeline>, db: InboxDb) -> Self {
        Self {
            pipeline,
            db,
            api_tokens: Arc::new(cfg.api_tokens.clone()),
            admins: Arc::new(cfg.admin_principals.iter().cloned().collect()),
            max_body: cfg.max_json_size,
            trust_proxy_headers: cfg.trust_proxy_headers,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/inbox", post(shared_inbox))
        .route("/users/:name/inbox", post(user_inbox))
        .route("/api/v1/domain_blocks", post(domain_blocks_api))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // bodies are read with our own cap so oversize maps to a stable code
        .layer(DefaultBodyLimit::disable())
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                info_span!("http", method = %req.method(), uri = %req.uri())
            }),
        )
        .layer(from_fn(add_security_headers))
        .with_state(state)
}

async fn shared_inbox(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    handle_inbox(state, peer, method, uri, headers, body, None).await
}

async fn user_inbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    handle_inbox(state, peer, method, uri, headers, body, Some(name)).await
}

async fn handle_inbox(
    state: AppState,
    peer: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    acting_user: Option<String>,
) -> Response {
    let received_at_ms = now_ms();
    let body = match read_capped(body, state.max_body).await {
        Ok(b) => b,
        Err(e) => {
            let rejection = reject(body_read_stage(&e), e, new_request_id(), None);
            return rejection_response(&rejection);
        }
    };
    let remote_addr = client_ip(state.trust_proxy_headers, peer.as_ref().map(|c| &c.0), &headers);
    let req = InboundHttpRequest {
        method,
        uri,
        headers,
        remote_addr,
        body,
        received_at_ms,
    };
    match state.pipeline.process(&req, acting_user.as_deref()).await {
        Ok(PipelineOutcome::Dispatched { request_id, .. }) => accepted(&request_id),
        Ok(PipelineOutcome::Discarded { trace_id, .. }) => accepted(&trace_id),
        Err(rejection) => rejection_response(&rejection),
    }
}

async fn domain_blocks_api(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    let trace_id = new_request_id();
    match update_domain_block(&state, &headers, body).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => {
            warn!(trace_id = %trace_id, code = e.code(), "domain block request rejected: {e}");
            error_response(&e, &trace_id)
        }
    }
}

async fn update_domain_block(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<DomainBlockResponse, InboxError> {
    let principal = bearer_token(headers)
        .and_then(|t| state.api_tokens.get(&t).cloned())
        .ok_or(InboxError::Unauthenticated)?;
    let body = read_capped(body, MAX_API_BODY).await?;
    let req: DomainBlockRequest =
        serde_json::from_slice(&body).map_err(|e| InboxError::MalformedPayload(e.to_string()))?;

    let scope = if req.instance {
        if !state.admins.contains(&principal) {
            return Err(InboxError::Forbidden);
        }
        BlockScope::Instance
    } else {
        BlockScope::User(principal.clone())
    };
    let domain = normalize_domain(&req.domain)?;
    let blocked = state
        .pipeline
        .blocks()
        .set_blocked(&domain, &scope, req.block)
        .await
        .map_err(|e| InboxError::StoreUnavailable(format!("{e:#}")))?;
    info!(principal = %principal, domain = %domain, scope = %scope.storage_key(), blocked, "domain block request applied");
    Ok(DomainBlockResponse { domain, blocked })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let db = state.db.clone();
    match tokio::task::spawn_blocking(move || db.health_check()).await {
        Ok(Ok(())) => (StatusCode::OK, "ready"),
        Ok(Err(e)) => {
            warn!("readiness check failed: {e:#}");
            (StatusCode::SERVICE_UNAVAILABLE, "db not ready")
        }
        Err(e) => {
            warn!("readiness check task failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "db not ready")
        }
    }
}

async fn add_security_headers(req: axum::http::Request<Body>, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.entry("X-Content-Type-Options").or_insert(HeaderValue::from_static("nosniff"));
    headers.entry("X-Frame-Options").or_insert(HeaderValue::from_static("DENY"));
    headers.entry("Referrer-Policy").or_insert(HeaderValue::from_static("no-referrer"));
    headers
        .entry("Permissions-Policy")
        .or_insert(HeaderValue::from_static("geolocation=(), microphone=(), camera=()"));
    resp
}

/// Reads at most `max` bytes; the declared `Content-Length` is ignored.
async fn read_capped(body: Body, max: usize) -> Result<Bytes, InboxError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| InboxError::MalformedPayload(format!("body read failed: {e}")))?;
        let size = buf.len().saturating_add(chunk.len());
        if size > max {
            return Err(InboxError::PayloadTooLarge { size, max });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// An oversized body fails the structural check; a broken read means the
/// request was never fully received.
fn body_read_stage(e: &InboxError) -> Stage {
    match e {
        InboxError::PayloadTooLarge { .. } => Stage::StructurallyValid,
        _ => Stage::Received,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let v = headers.get("Authorization")?.to_str().ok()?.trim();
    let v = v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer "))?;
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

fn accepted(request_id: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(InboxAck {
            status: "accepted".to_string(),
            request_id: request_id.to_string(),
        }),
    )
        .into_response()
}

fn rejection_response(rejection: &Rejection) -> Response {
    if rejection.error.is_acknowledged() {
        return accepted(rejection.correlation_id());
    }
    error_response(&rejection.error, rejection.correlation_id())
}

fn error_response(error: &InboxError, request_id: &str) -> Response {
    (
        error.status(),
        Json(InboxRejection {
            error: error.code().to_string(),
            request_id: request_id.to_string(),
        }),
    )
        .into_response()
}
