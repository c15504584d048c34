use std::sync::Arc;

use axum::Router;
use tower_http::{compression::CompressionLayer, limit::RequestBodyLimitLayer};

use crate::config::ExchangeSettings;
use crate::db::{ExchangeBackend, UserStore};
use crate::exchange::{CurrencyRegistry, ExchangeCalculator, OfferManager, RateProvider};

pub mod auth;
pub mod exchange;
pub mod offers;
pub mod tx;
pub mod utils;
pub mod wallet;

use auth::AuthService;

const BODY_LIMIT: usize = 64 * 1024;

/// Everything the handlers need, cloned into every router.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub backend: Arc<dyn ExchangeBackend>,
    pub offers: Arc<OfferManager>,
    pub calculator: Arc<ExchangeCalculator>,
    pub rates: Arc<RateProvider>,
    pub registry: Arc<CurrencyRegistry>,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn ExchangeBackend>,
        users: Arc<dyn UserStore>,
        registry: Arc<CurrencyRegistry>,
        rates: Arc<RateProvider>,
        settings: &ExchangeSettings,
        jwt_secret: String,
    ) -> Self {
        let calculator = Arc::new(ExchangeCalculator::new(rates.clone(), settings.fee_rate));
        let offers = Arc::new(OfferManager::new(
            backend.clone(),
            registry.clone(),
            calculator.clone(),
            settings.request_timeout,
        ));
        Self {
            auth: Arc::new(AuthService::new(users, jwt_secret)),
            backend,
            offers,
            calculator,
            rates,
            registry,
        }
    }
}

pub fn app(state: AppState) -> Router {
    let v1 = Router::new()
        .merge(auth::auth_routes(state.auth.clone()))
        .merge(exchange::exchange_routes(state.clone()))
        .merge(offers::offer_routes(state.clone()))
        .merge(wallet::wallet_routes(state.clone()))
        .merge(tx::tx_routes(state));

    Router::new()
        .nest("/v1", v1)
        .layer(CompressionLayer::new().gzip(true))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
}
