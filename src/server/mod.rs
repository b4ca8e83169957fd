//! HTTP front door: bearer-authenticated extraction plus health reporting.

mod ssrf;

pub use ssrf::{validate_embed_url, ValidationError};

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::browser::{BrowserPool, ExtractError, ManifestExtractor, Priority};

#[derive(Clone)]
pub struct AppState {
    pub extractor: Arc<ManifestExtractor>,
    pub pool: Arc<BrowserPool>,
    pub secret: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/extract", post(extract))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractRequest {
    #[serde(default)]
    embed_url: Option<String>,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    priority: Priority,
}

fn default_timeout() -> u64 {
    30_000
}

#[derive(Debug, Serialize)]
struct ExtractSuccess {
    success: bool,
    url: String,
    #[serde(rename = "m3u8Url")]
    m3u8_url: String,
    headers: ReplayHeaders,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookies: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReplayHeaders {
    #[serde(rename = "Referer")]
    referer: String,
    #[serde(rename = "Origin")]
    origin: String,
    #[serde(rename = "User-Agent")]
    user_agent: String,
}

async fn extract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExtractRequest>,
) -> Response {
    let Some(secret) = state.secret.as_deref() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "extraction secret not configured",
        );
    };
    if !bearer_matches(&headers, secret) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid authorization");
    }
    let Some(raw_url) = request.embed_url.as_deref() else {
        return error_response(StatusCode::BAD_REQUEST, "embedUrl is required");
    };
    let embed_url = match validate_embed_url(raw_url) {
        Ok(url) => url,
        Err(err) => {
            debug!(url = raw_url, error = %err, "rejected embed url");
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    match state
        .extractor
        .extract(embed_url.as_str(), request.timeout, request.priority)
        .await
    {
        Ok(capture) => Json(ExtractSuccess {
            success: true,
            url: capture.manifest_url.clone(),
            m3u8_url: capture.manifest_url,
            headers: ReplayHeaders {
                referer: capture.referer,
                origin: capture.origin,
                user_agent: capture.user_agent,
            },
            cookies: capture.cookies,
        })
        .into_response(),
        Err(ExtractError::Timeout(_)) => (
            StatusCode::OK,
            Json(json!({ "success": false, "error": "m3u8 extraction failed" })),
        )
            .into_response(),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let status = state.pool.status();
    let body = json!({
        "status": if status.circuit_open { "degraded" } else { "ok" },
        "timestamp": Utc::now().to_rfc3339(),
        "memory": { "rssBytes": process_memory_bytes() },
        "queue": { "pending": status.pending, "active": status.active },
        "browser": {
            "circuitBreaker": {
                "open": status.circuit_open,
                "consecutiveFailures": status.consecutive_failures,
                "reopenInMs": status.reopen_in.as_millis() as u64,
            }
        }
    });
    let code = if status.circuit_open {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body)).into_response()
}

fn process_memory_bytes() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = sysinfo::System::new();
    system.refresh_all();
    system
        .process(pid)
        .map(|process| process.memory())
        .unwrap_or(0)
}

fn bearer_matches(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == secret)
        .unwrap_or(false)
}

fn error_response(code: StatusCode, message: &str) -> Response {
    (
        code,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = value {
            headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn bearer_token_must_match_exactly() {
        assert!(bearer_matches(&header_map(Some("Bearer s3cret")), "s3cret"));
        assert!(!bearer_matches(&header_map(Some("Bearer wrong")), "s3cret"));
        assert!(!bearer_matches(&header_map(Some("s3cret")), "s3cret"));
        assert!(!bearer_matches(&header_map(None), "s3cret"));
    }
}
