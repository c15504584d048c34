use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{utils::validate_auth_token, AppState};
use crate::error::ExchangeError;

#[derive(Debug, Serialize, Deserialize)]
pub struct DepositRequest {
    pub currency: String,
    pub amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub full_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KycRequest {
    pub document: serde_json::Value,
}

async fn list_wallets(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = validate_auth_token(&headers, &state.auth)?;
    let wallets = state.backend.wallets(user_id).await?;
    Ok(Json(wallets))
}

async fn get_wallet(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(currency): Path<String>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = validate_auth_token(&headers, &state.auth)?;
    let code = state.registry.lookup(&currency)?.code.clone();
    let wallet = state
        .backend
        .wallet(user_id, &code)
        .await?
        .ok_or(ExchangeError::NotFound(format!("{code} wallet")))?;
    Ok(Json(wallet))
}

async fn deposit(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(payload): Json<DepositRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = validate_auth_token(&headers, &state.auth)?;
    if payload.amount <= Decimal::ZERO {
        return Err(ExchangeError::InvalidAmount);
    }
    let code = state.registry.require_active(&payload.currency)?.code.clone();

    let transaction = state.backend.deposit(user_id, &code, payload.amount).await?;
    tracing::info!(
        "Deposited {} {code} for user {user_id} ({})",
        payload.amount,
        transaction.reference
    );
    Ok((StatusCode::CREATED, Json(transaction)))
}

async fn update_profile(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(payload): Json<ProfileRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = validate_auth_token(&headers, &state.auth)?;
    let full_name = payload.full_name.trim();
    if full_name.is_empty() {
        return Err(ExchangeError::Validation("Full name must not be empty".to_string()));
    }

    state.backend.update_profile(user_id, full_name).await?;
    tracing::info!("User updated successfully: {}", user_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_kyc(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(payload): Json<KycRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = validate_auth_token(&headers, &state.auth)?;
    if !payload.document.is_object() {
        return Err(ExchangeError::Validation("KYC document must be an object".to_string()));
    }

    state.backend.submit_kyc(user_id, &payload.document).await?;
    tracing::info!("KYC document received for user {}", user_id);
    Ok(StatusCode::ACCEPTED)
}

pub fn wallet_routes(state: AppState) -> Router {
    Router::new()
        .route("/wallets", get(list_wallets))
        .route("/wallets/deposit", post(deposit))
        .route("/wallets/:currency", get(get_wallet))
        .route("/profile", put(update_profile))
        .route("/kyc", post(submit_kyc))
        .with_state(state)
}
