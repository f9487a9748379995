//! Owner identity

use super::handlers::AppError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// Header carrying the caller's identity
pub const OWNER_HEADER: &str = "x-user-id";

/// Authenticated owner of the request
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| OwnerId(v.to_string()))
            .ok_or_else(|| AppError::Unauthorized(format!("missing {OWNER_HEADER} header")))
    }
}
