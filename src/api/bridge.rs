use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::relay::orchestrator::{self, BridgeError, ThirdPartyRequest};
use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining_seconds: Option<u64>,
}

/// POST /api/bridge — the `call_third_party` agent tool.
///
/// Requires `Authorization: Bearer <token>` matching the configured
/// api.token. Body is a `ThirdPartyRequest`:
///
/// ```json
/// {
///   "phone": "3129990000",
///   "message": "Table confirmed for 7pm",
///   "room_id": "phone:+13312998167"
/// }
/// ```
pub async fn handle_bridge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ThirdPartyRequest>,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&headers, &state.config.api.token) {
        return resp;
    }

    tracing::info!(phone = %req.phone, room = ?req.room_id, "Third-party bridge requested");

    match orchestrator::call_third_party(&state, req).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => {
            let status = match &e {
                BridgeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                BridgeError::NoActiveCall => StatusCode::PRECONDITION_FAILED,
                _ => StatusCode::BAD_REQUEST,
            };
            let remaining_seconds = match &e {
                BridgeError::RateLimited { remaining_secs } => Some(*remaining_secs),
                _ => None,
            };
            tracing::warn!("Bridge rejected: {e}");
            (
                status,
                Json(ErrorResponse {
                    error: e.to_string(),
                    remaining_seconds,
                }),
            )
                .into_response()
        }
    }
}

#[allow(clippy::result_large_err)]
pub fn check_auth(
    headers: &HeaderMap,
    expected_token: &str,
) -> Result<(), axum::response::Response> {
    if expected_token.is_empty() {
        tracing::warn!("API token not configured — rejecting request");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "API token not configured".to_string(),
                remaining_seconds: None,
            }),
        )
            .into_response());
    }

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected_token => Ok(()),
        _ => {
            tracing::warn!("Unauthorized API request");
            Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing bearer token".to_string(),
                    remaining_seconds: None,
                }),
            )
                .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_rejects_everything() {
        let headers = HeaderMap::new();
        assert!(check_auth(&headers, "").is_err());
    }

    #[test]
    fn matching_bearer_token_passes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer s3cret".parse().unwrap());
        assert!(check_auth(&headers, "s3cret").is_ok());
        assert!(check_auth(&headers, "other").is_err());
    }
}
