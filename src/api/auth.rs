// =============================================================================
// Bearer Token Authentication
// =============================================================================
//
// All mutating endpoints require `Authorization: Bearer <token>`; the
// subscription stream passes the same token as a `?token=` query parameter
// because browsers cannot set headers on WebSocket upgrades. The expected
// token comes from `SPREADSCAN_ADMIN_TOKEN`, re-read per request so rotation
// needs no restart, and compared in constant time.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const TOKEN_ENV: &str = "SPREADSCAN_ADMIN_TOKEN";

/// Constant-time byte comparison: every byte of both slices is examined even
/// after a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn expected_token() -> Option<String> {
    match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.is_empty() => Some(token),
        _ => None,
    }
}

/// Validate a bare token string (WebSocket query-param path).
pub fn validate_token(token: &str) -> bool {
    match expected_token() {
        Some(expected) => constant_time_eq(token.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor yielding the validated bearer token. On failure the request
/// is rejected with 403 before the handler body runs.
pub struct AuthBearer(pub String);

pub struct AuthRejection(&'static str);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({ "error": self.0, "kind": "auth" })),
        )
            .into_response()
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(expected) = expected_token() else {
            warn!("{TOKEN_ENV} is not set — rejecting all authenticated requests");
            return Err(AuthRejection("server authentication not configured"));
        };

        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
                Ok(AuthBearer(token.to_string()))
            }
            Some(_) => {
                warn!("invalid admin token presented");
                Err(AuthRejection("invalid authorization token"))
            }
            None => {
                warn!("missing or malformed Authorization header");
                Err(AuthRejection("missing or invalid authorization token"))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
