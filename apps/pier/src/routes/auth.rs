use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use super::ApiError;
use crate::state::AppState;

/// Guards operator routes. Without a configured token every caller passes.
#[derive(Clone, Debug)]
pub struct OperatorAuth;

#[async_trait]
impl FromRequestParts<AppState> for OperatorAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.operator_token() else {
            return Ok(OperatorAuth);
        };
        match extract_token(&parts.headers) {
            Some(token) if token == expected => Ok(OperatorAuth),
            _ => Err(ApiError::Unauthorized),
        }
    }
}

fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
}
