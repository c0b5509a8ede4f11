use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{assets, tokens};

/// Admission for agent RPCs: the bearer must be an agent token bound to a
/// managed asset, or a join token that has not expired yet (agents only hold
/// a join token while bootstrapping).
pub async fn require_agent_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> ApiResult<Response> {
    let token = extract_bearer(req.headers())?;

    if assets::get_asset_by_token(&state.db, &token).await.is_ok() {
        return Ok(next.run(req).await);
    }

    if tokens::check_join_token(&state.db, &token).await? {
        return Ok(next.run(req).await);
    }

    Err(AppError::unauthenticated("invalid token"))
}

pub fn extract_bearer(headers: &HeaderMap) -> ApiResult<String> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::unauthenticated("missing authorization header"))?;

    let value = value
        .to_str()
        .map_err(|_| AppError::unauthenticated("invalid authorization header"))?;

    let prefix = "Bearer ";
    if !value.starts_with(prefix) {
        return Err(AppError::unauthenticated(
            "invalid authorization header scheme",
        ));
    }

    Ok(value[prefix.len()..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_bearer_accepts_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token-123"));

        let token = extract_bearer(&headers).expect("token should parse");
        assert_eq!(token, "token-123");
    }

    #[test]
    fn extract_bearer_rejects_missing_header() {
        let err = extract_bearer(&HeaderMap::new()).expect_err("missing header");
        assert_eq!(err.code, "unauthenticated");
    }

    #[test]
    fn extract_bearer_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        let err = extract_bearer(&headers).expect_err("wrong scheme");
        assert_eq!(err.code, "unauthenticated");
        assert!(err.message.contains("scheme"));
    }
}
