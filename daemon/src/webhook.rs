//! Webhook ingress (C5, spec §4.5): authenticated HTTP endpoint feeding
//! the notification pipeline (C4).

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Serialize;
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;

use crate::notifications::NotificationPipeline;

const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct WebhookState {
    pub pipeline: Arc<NotificationPipeline>,
    pub secret: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<bool>,
}

pub fn router(state: WebhookState) -> Router {
    let path = state.path.clone();
    Router::new()
        .route(&path, post(handle_webhook))
        .fallback(fallback)
        .layer(RequestBodyLimitLayer::new(DEFAULT_MAX_BODY_BYTES))
        .with_state(Arc::new(state))
}

/// Constant-time comparison to avoid a timing side-channel on the shared secret.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

fn authorize(headers: &HeaderMap, expected: &str) -> bool {
    if let Some(bearer) = headers.get("authorization").and_then(|v| v.to_str().ok()).and_then(|v| v.strip_prefix("Bearer ")) {
        if constant_time_eq(bearer, expected) {
            return true;
        }
    }
    if let Some(secret) = headers.get("x-bridge-secret").and_then(|v| v.to_str().ok()) {
        if constant_time_eq(secret, expected) {
            return true;
        }
    }
    false
}

async fn handle_webhook(State(state): State<Arc<WebhookState>>, headers: HeaderMap, method: Method, body: axum::body::Bytes) -> Response {
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, Json(IngestResponse { ok: false, notification_id: None, duplicate: None })).into_response();
    }

    if !authorize(&headers, &state.secret) {
        return (StatusCode::UNAUTHORIZED, Json(IngestResponse { ok: false, notification_id: None, duplicate: None })).into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(IngestResponse { ok: false, notification_id: None, duplicate: None })).into_response();
        }
    };

    let source_account = headers.get("x-source-account").and_then(|v| v.to_str().ok());
    let source_event_id = headers.get("x-event-id").and_then(|v| v.to_str().ok());
    let received_at_ms = chrono::Utc::now().timestamp_millis();

    match state.pipeline.ingest("webhook", &payload, source_account, source_event_id, received_at_ms) {
        Ok(outcome) => (
            StatusCode::OK,
            Json(IngestResponse { ok: true, notification_id: Some(outcome.notification_id), duplicate: Some(!outcome.inserted) }),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "webhook ingest failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(IngestResponse { ok: false, notification_id: None, duplicate: None })).into_response()
        }
    }
}

/// 404 for any method/path not matched by the configured route.
pub async fn fallback() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(IngestResponse { ok: false, notification_id: None, duplicate: None }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("matching-secret", "matching-secret"));
    }

    #[test]
    fn authorize_accepts_bearer_or_bridge_secret_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer topsecret".parse().unwrap());
        assert!(authorize(&headers, "topsecret"));

        let mut headers = HeaderMap::new();
        headers.insert("x-bridge-secret", "topsecret".parse().unwrap());
        assert!(authorize(&headers, "topsecret"));

        let headers = HeaderMap::new();
        assert!(!authorize(&headers, "topsecret"));
    }
}
