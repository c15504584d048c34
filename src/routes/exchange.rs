use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{utils, AppState};
use crate::db::currency::Currency;
use crate::error::ExchangeError;
use crate::exchange::rates::RateTable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatesView {
    pub base: String,
    pub rates: RateTable,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    pub amount: Decimal,
    pub from_currency: String,
    pub to_currency: String,
}

async fn list_currencies(State(state): State<AppState>) -> Json<Vec<Currency>> {
    Json(state.registry.list_active().cloned().collect())
}

async fn get_rates(
    State(state): State<AppState>,
    Path(base): Path<String>,
) -> Result<impl IntoResponse, ExchangeError> {
    let base = state.registry.lookup(&base)?.code.clone();
    let snapshot = state.rates.snapshot(&base).await;
    tracing::info!("Serving {} rates for {base} ({:?})", snapshot.rates.len(), snapshot.origin);
    Ok(Json(RatesView {
        base: snapshot.base,
        rates: snapshot.rates,
        updated_at: snapshot.fetched_at,
    }))
}

async fn get_african_rates(
    State(state): State<AppState>,
    Path(base): Path<String>,
) -> Result<impl IntoResponse, ExchangeError> {
    let base = state.registry.lookup(&base)?.code.clone();
    let rates = state.rates.african_rates(&base).await;
    Ok(Json(RatesView {
        base,
        rates,
        updated_at: Utc::now(),
    }))
}

async fn get_pair_rate(
    State(state): State<AppState>,
    Path((from, to)): Path<(String, String)>,
) -> Result<impl IntoResponse, ExchangeError> {
    let from = state.registry.lookup(&from)?.code.clone();
    let to = state.registry.lookup(&to)?.code.clone();
    let rate = state.rates.quote(&from, &to).await?;
    Ok(Json(rate))
}

async fn quote(
    State(state): State<AppState>,
    Json(req): Json<ExchangeRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    state.registry.require_active(&req.from_currency)?;
    state.registry.require_active(&req.to_currency)?;
    let quote = state
        .calculator
        .calculate(req.amount, &req.from_currency, &req.to_currency)
        .await?;
    Ok(Json(quote))
}

async fn execute(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<ExchangeRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = utils::validate_auth_token(&headers, &state.auth)?;
    let outcome = state
        .offers
        .execute_exchange_with_id(
            req.transaction_id.unwrap_or_else(Uuid::new_v4),
            user_id,
            req.amount,
            &req.from_currency,
            &req.to_currency,
        )
        .await?;
    Ok(utils::outcome_response(outcome, StatusCode::CREATED))
}

pub fn exchange_routes(state: AppState) -> Router {
    Router::new()
        .route("/currencies", get(list_currencies))
        .route("/rates/:base", get(get_rates))
        .route("/rates/:base/african", get(get_african_rates))
        .route("/rates/:base/:target", get(get_pair_rate))
        .route("/exchange/quote", post(quote))
        .route("/exchange/execute", post(execute))
        .with_state(state)
}
