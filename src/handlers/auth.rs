//! Bearer-token guard for the `/files` routes.

use crate::errors::AppError;
use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// The token clients must present. `None` accepts any non-empty bearer.
#[derive(Clone, Default)]
pub struct AuthState {
    pub api_token: Option<Arc<str>>,
}

impl AuthState {
    pub fn new(api_token: Option<String>) -> Self {
        Self {
            api_token: api_token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}

/// Extract the credential from an `Authorization: Bearer <token>` header.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

pub async fn require_bearer(
    State(auth): State<AuthState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let given = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    match (given, auth.api_token.as_deref()) {
        (None, _) => Err(AppError::unauthorized()),
        (Some(given), Some(expected)) if given != expected => Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "Invalid authentication credentials",
        )),
        _ => Ok(next.run(req).await),
    }
}
