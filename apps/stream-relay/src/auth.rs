use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{routes::ApiError, state::AppState};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests whose `X-API-Key` does not match the configured key.
/// Without a configured key nothing is let through.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !key_matches(state.api_key.as_deref(), request.headers()) {
        warn!(path = %request.uri().path(), "rejected request with missing or invalid api key");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

fn key_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    let Some(presented) = headers.get(API_KEY_HEADER) else {
        return false;
    };
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
