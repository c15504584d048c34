use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use uuid::Uuid;

use super::{utils, AppState};
use crate::error::ExchangeError;

// all transactions the user took part in, oldest first
async fn list_transactions(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = utils::validate_auth_token(&headers, &state.auth)?;
    let transactions = state.backend.transactions(user_id).await?;
    Ok(Json(transactions))
}

// same history as server-sent events, one transaction per event
async fn stream_transactions(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = utils::validate_auth_token(&headers, &state.auth)?;
    let transactions = state.backend.transactions(user_id).await?;

    let stream = futures::stream::iter(transactions).map(|transaction| {
        Event::default()
            .event("transaction")
            .id(transaction.id.to_string())
            .json_data(transaction)
    });

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(2))
            .text("keep-alive-text"),
    );

    Ok(sse)
}

// a specific transaction, only visible to the parties involved
async fn get_transaction(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = utils::validate_auth_token(&headers, &state.auth)?;

    let transaction = state
        .backend
        .transactions(user_id)
        .await?
        .into_iter()
        .find(|transaction| transaction.id == transaction_id && transaction.involves(user_id))
        .ok_or(ExchangeError::NotFound(format!("Transaction {transaction_id}")))?;

    Ok(Json(transaction))
}

pub fn tx_routes(state: AppState) -> Router {
    Router::new()
        .route("/transactions", get(list_transactions))
        .route("/transactions/stream", get(stream_transactions))
        .route("/transactions/:id", get(get_transaction))
        .with_state(state)
}
