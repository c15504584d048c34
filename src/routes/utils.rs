use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use super::auth::AuthService;
use crate::error::{ExchangeError, ExchangeResult};
use crate::offline::Outcome;

#[inline]
pub fn validate_auth_token(headers: &HeaderMap, service: &AuthService) -> ExchangeResult<Uuid> {
    let jwt_header_token = match headers.get(AUTHORIZATION).map(|token| token.to_str()) {
        Some(Ok(token)) => token,
        _ => return Err(ExchangeError::Unauthenticated),
    };
    let token = jwt_header_token
        .strip_prefix("Bearer ")
        .unwrap_or(jwt_header_token)
        .trim();
    service.verify_token(token)
}

#[inline]
pub fn check_password(password: &str) -> ExchangeResult<()> {
    let rule = |message: &str| Err(ExchangeError::Validation(message.to_string()));
    if password.len() < 8 {
        return rule("Password must be at least 8 characters");
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        return rule("Password must contain at least one uppercase letter");
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return rule("Password must contain at least one lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return rule("Password must contain at least one digit");
    }
    if !password.chars().any(|c| !c.is_alphanumeric()) {
        return rule("Password must contain at least one special character");
    }
    Ok(())
}

// the server never queues, but a deferred outcome still maps to 202
pub fn outcome_response<T: Serialize>(outcome: Outcome<T>, status: StatusCode) -> Response {
    match outcome {
        Outcome::Confirmed(value) => (status, Json(value)).into_response(),
        Outcome::Queued(action) => (StatusCode::ACCEPTED, Json(action)).into_response(),
    }
}
