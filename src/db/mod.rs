use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::ExchangeResult;
use crate::exchange::calculator::Quote;

pub mod auth;
pub mod currency;
pub mod exchange;
pub mod memory;
pub mod offer;
pub mod tx;
pub mod utils;
pub mod wallet;

use offer::{NewOffer, P2POffer};
use tx::Transaction;
use wallet::Wallet;

/// Source of truth for balances, offers and transactions. Every mutating
/// method is atomic: it either fully applies or leaves nothing behind.
#[async_trait]
pub trait ExchangeBackend: Send + Sync {
    async fn wallet(&self, user_id: Uuid, currency: &str) -> ExchangeResult<Option<Wallet>>;

    async fn wallets(&self, user_id: Uuid) -> ExchangeResult<Vec<Wallet>>;

    async fn deposit(&self, user_id: Uuid, currency: &str, amount: Decimal)
        -> ExchangeResult<Transaction>;

    /// Stores an open offer and escrows `from_amount` from the creator.
    /// Resending the same `NewOffer` returns the stored row without escrowing
    /// again; reusing its id for a different request is a validation error.
    async fn insert_offer(&self, offer: &NewOffer) -> ExchangeResult<P2POffer>;

    async fn offer(&self, offer_id: Uuid) -> ExchangeResult<Option<P2POffer>>;

    /// Open offers, oldest first.
    async fn open_offers(&self) -> ExchangeResult<Vec<P2POffer>>;

    /// `open -> matched` plus both legs of the settlement, only if the offer
    /// is still open at commit time.
    async fn settle_offer(&self, offer_id: Uuid, accepter_id: Uuid)
        -> ExchangeResult<Transaction>;

    /// `open -> cancelled` for the creator, refunding the escrow.
    async fn cancel_offer(&self, offer_id: Uuid, requester_id: Uuid) -> ExchangeResult<P2POffer>;

    /// Applies `quote` once per `transaction_id`; a resend returns the
    /// transaction already recorded.
    async fn execute_exchange(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        quote: &Quote,
    ) -> ExchangeResult<Transaction>;

    async fn transactions(&self, user_id: Uuid) -> ExchangeResult<Vec<Transaction>>;

    async fn submit_kyc(&self, user_id: Uuid, document: &serde_json::Value) -> ExchangeResult<()>;

    async fn update_profile(&self, user_id: Uuid, full_name: &str) -> ExchangeResult<()>;
}

/// Credentials and refresh tokens behind the auth endpoints.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        full_name: Option<&str>,
    ) -> ExchangeResult<(Uuid, String)>;

    /// `(id, email, password_hash)`
    async fn find_user_by_email(&self, email: &str)
        -> ExchangeResult<Option<(Uuid, String, String)>>;

    async fn store_refresh_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> ExchangeResult<()>;

    async fn verify_refresh_token(&self, token: &str) -> ExchangeResult<Option<Uuid>>;
}
