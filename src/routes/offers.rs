use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{utils, AppState};
use crate::db::offer::OfferView;
use crate::error::ExchangeError;
use crate::offline::Outcome;

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOfferRequest {
    // lets a device resend the request without creating a second offer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<Uuid>,
    pub from_currency: String,
    pub from_amount: Decimal,
    pub to_currency: String,
    pub to_amount: Decimal,
}

async fn list_offers(State(state): State<AppState>) -> Result<impl IntoResponse, ExchangeError> {
    let offers: Vec<OfferView> = state
        .offers
        .list_open_offers()
        .await?
        .map(OfferView::from)
        .collect();
    Ok(Json(offers))
}

async fn create_offer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateOfferRequest>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = utils::validate_auth_token(&headers, &state.auth)?;
    let outcome = state
        .offers
        .create_offer_with_id(
            req.offer_id.unwrap_or_else(Uuid::new_v4),
            user_id,
            &req.from_currency,
            req.from_amount,
            &req.to_currency,
            req.to_amount,
        )
        .await?;
    Ok(utils::outcome_response(view(outcome), StatusCode::CREATED))
}

async fn get_offer(
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
) -> Result<impl IntoResponse, ExchangeError> {
    let offer = state.offers.get_offer(offer_id).await?;
    Ok(Json(OfferView::from(offer)))
}

async fn accept_offer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = utils::validate_auth_token(&headers, &state.auth)?;
    let outcome = state.offers.accept_offer(user_id, offer_id).await?;
    Ok(utils::outcome_response(outcome, StatusCode::OK))
}

async fn cancel_offer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
) -> Result<impl IntoResponse, ExchangeError> {
    let user_id = utils::validate_auth_token(&headers, &state.auth)?;
    let outcome = state.offers.cancel_offer(user_id, offer_id).await?;
    Ok(utils::outcome_response(view(outcome), StatusCode::OK))
}

fn view(outcome: Outcome<crate::db::offer::P2POffer>) -> Outcome<OfferView> {
    match outcome {
        Outcome::Confirmed(offer) => Outcome::Confirmed(offer.into()),
        Outcome::Queued(action) => Outcome::Queued(action),
    }
}

pub fn offer_routes(state: AppState) -> Router {
    Router::new()
        .route("/offers", get(list_offers).post(create_offer))
        .route("/offers/:id", get(get_offer))
        .route("/offers/:id/accept", post(accept_offer))
        .route("/offers/:id/cancel", post(cancel_offer))
        .with_state(state)
}
