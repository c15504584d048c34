use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::offer::{NewOffer, OfferStatus, P2POffer};
use super::tx::Transaction;
use super::utils::normalize_code;
use super::wallet::Wallet;
use super::{ExchangeBackend, UserStore};
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::calculator::Quote;

#[derive(Debug, Clone)]
struct UserRecord {
    id: Uuid,
    email: String,
    password_hash: String,
    full_name: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, UserRecord>,
    refresh_tokens: HashMap<String, (Uuid, DateTime<Utc>)>,
    wallets: HashMap<(Uuid, String), Wallet>,
    offers: Vec<P2POffer>,
    transactions: Vec<Transaction>,
    kyc_documents: Vec<(Uuid, serde_json::Value)>,
}

impl MemoryState {
    fn balance(&self, user_id: Uuid, currency: &str) -> Decimal {
        self.wallets
            .get(&(user_id, currency.to_string()))
            .map(|wallet| wallet.balance)
            .unwrap_or(Decimal::ZERO)
    }

    fn ensure_covers(&self, user_id: Uuid, currency: &str, amount: Decimal) -> ExchangeResult<()> {
        let covered = self
            .wallets
            .get(&(user_id, currency.to_string()))
            .map(|wallet| wallet.covers(amount))
            .unwrap_or(false);
        if !covered {
            return Err(ExchangeError::InsufficientFunds(currency.to_string()));
        }
        Ok(())
    }

    // callers check `ensure_covers` first so a debit never fails halfway
    fn apply(&mut self, user_id: Uuid, currency: &str, delta: Decimal, now: DateTime<Utc>) {
        let wallet = self
            .wallets
            .entry((user_id, currency.to_string()))
            .or_insert_with(|| Wallet::empty(user_id, currency));
        wallet.balance += delta;
        wallet.last_transaction_at = Some(now);
    }

    fn offer_mut(&mut self, offer_id: Uuid) -> ExchangeResult<&mut P2POffer> {
        self.offers
            .iter_mut()
            .find(|offer| offer.id == offer_id)
            .ok_or(ExchangeError::NotFound(format!("Offer {offer_id}")))
    }
}

/// In-process implementation of both stores. Used by the test-suite and for
/// running the service without a database. Reachability and latency can be
/// switched at runtime to simulate an unreliable link.
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Balance as stored, bypassing reachability. Test helper.
    pub async fn balance_of(&self, user_id: Uuid, currency: &str) -> Decimal {
        self.state.lock().await.balance(user_id, &normalize_code(currency))
    }

    pub async fn kyc_documents(&self, user_id: Uuid) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .await
            .kyc_documents
            .iter()
            .filter(|(owner, _)| *owner == user_id)
            .map(|(_, document)| document.clone())
            .collect()
    }

    pub async fn full_name(&self, user_id: Uuid) -> Option<String> {
        self.state
            .lock()
            .await
            .users
            .values()
            .find(|user| user.id == user_id)
            .and_then(|user| user.full_name.clone())
    }

    async fn connect(&self) -> ExchangeResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ExchangeError::Network("backend unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeBackend for MemoryRepository {
    async fn wallet(&self, user_id: Uuid, currency: &str) -> ExchangeResult<Option<Wallet>> {
        self.connect().await?;
        let state = self.state.lock().await;
        Ok(state
            .wallets
            .get(&(user_id, normalize_code(currency)))
            .cloned())
    }

    async fn wallets(&self, user_id: Uuid) -> ExchangeResult<Vec<Wallet>> {
        self.connect().await?;
        let state = self.state.lock().await;
        let mut wallets: Vec<Wallet> = state
            .wallets
            .values()
            .filter(|wallet| wallet.user_id == user_id)
            .cloned()
            .collect();
        wallets.sort_by(|a, b| a.currency_code.cmp(&b.currency_code));
        Ok(wallets)
    }

    async fn deposit(
        &self,
        user_id: Uuid,
        currency: &str,
        amount: Decimal,
    ) -> ExchangeResult<Transaction> {
        self.connect().await?;
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount);
        }
        let currency = normalize_code(currency);
        let mut state = self.state.lock().await;
        let transaction = Transaction::deposit(user_id, &currency, amount);
        state.apply(user_id, &currency, amount, transaction.created_at);
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn insert_offer(&self, offer: &NewOffer) -> ExchangeResult<P2POffer> {
        self.connect().await?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.offers.iter().find(|stored| stored.id == offer.id) {
            if !existing.created_by(offer) {
                return Err(ExchangeError::Validation(format!(
                    "Offer id {} is already in use",
                    offer.id
                )));
            }
            return Ok(existing.clone());
        }
        state.ensure_covers(offer.creator_id, &offer.from_currency, offer.from_amount)?;

        let stored = P2POffer::from_new(offer);
        state.apply(
            offer.creator_id,
            &offer.from_currency,
            -offer.from_amount,
            stored.created_at,
        );
        state.offers.push(stored.clone());
        Ok(stored)
    }

    async fn offer(&self, offer_id: Uuid) -> ExchangeResult<Option<P2POffer>> {
        self.connect().await?;
        let state = self.state.lock().await;
        Ok(state.offers.iter().find(|offer| offer.id == offer_id).cloned())
    }

    async fn open_offers(&self) -> ExchangeResult<Vec<P2POffer>> {
        self.connect().await?;
        let state = self.state.lock().await;
        let mut offers: Vec<P2POffer> = state
            .offers
            .iter()
            .filter(|offer| offer.is_open())
            .cloned()
            .collect();
        offers.sort_by_key(|offer| (offer.created_at, offer.id));
        Ok(offers)
    }

    async fn settle_offer(
        &self,
        offer_id: Uuid,
        accepter_id: Uuid,
    ) -> ExchangeResult<Transaction> {
        self.connect().await?;
        let mut state = self.state.lock().await;

        let offer = state.offer_mut(offer_id)?.clone();
        if !offer.is_open() {
            return Err(ExchangeError::OfferNotOpen);
        }
        if offer.user_id == accepter_id {
            return Err(ExchangeError::NotAuthorized);
        }
        state.ensure_covers(accepter_id, &offer.to_currency, offer.to_amount)?;

        let transaction = Transaction::settlement(&offer, accepter_id);
        let now = transaction.created_at;
        state.apply(accepter_id, &offer.to_currency, -offer.to_amount, now);
        state.apply(offer.user_id, &offer.to_currency, offer.to_amount, now);
        state.apply(accepter_id, &offer.from_currency, offer.from_amount, now);

        let stored = state.offer_mut(offer_id)?;
        stored.status = OfferStatus::Matched;
        stored.matched_by = Some(accepter_id);
        stored.updated_at = now;

        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn cancel_offer(&self, offer_id: Uuid, requester_id: Uuid) -> ExchangeResult<P2POffer> {
        self.connect().await?;
        let mut state = self.state.lock().await;

        let offer = state.offer_mut(offer_id)?.clone();
        if offer.user_id != requester_id {
            return Err(ExchangeError::NotAuthorized);
        }
        if !offer.is_open() {
            return Err(ExchangeError::OfferNotOpen);
        }

        let now = Utc::now();
        state.apply(offer.user_id, &offer.from_currency, offer.from_amount, now);
        let stored = state.offer_mut(offer_id)?;
        stored.status = OfferStatus::Cancelled;
        stored.updated_at = now;
        Ok(stored.clone())
    }

    async fn execute_exchange(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        quote: &Quote,
    ) -> ExchangeResult<Transaction> {
        self.connect().await?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.transactions.iter().find(|tx| tx.id == transaction_id) {
            if existing.user_id != user_id {
                return Err(ExchangeError::Validation(format!(
                    "Transaction id {transaction_id} is already in use"
                )));
            }
            return Ok(existing.clone());
        }
        state.ensure_covers(user_id, &quote.from_currency, quote.from_amount)?;

        let transaction = Transaction::exchange(transaction_id, user_id, quote);
        let now = transaction.created_at;
        state.apply(user_id, &quote.from_currency, -quote.from_amount, now);
        state.apply(user_id, &quote.to_currency, quote.total, now);
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn transactions(&self, user_id: Uuid) -> ExchangeResult<Vec<Transaction>> {
        self.connect().await?;
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|transaction| transaction.involves(user_id))
            .cloned()
            .collect())
    }

    async fn submit_kyc(&self, user_id: Uuid, document: &serde_json::Value) -> ExchangeResult<()> {
        self.connect().await?;
        let mut state = self.state.lock().await;
        state.kyc_documents.push((user_id, document.clone()));
        Ok(())
    }

    async fn update_profile(&self, user_id: Uuid, full_name: &str) -> ExchangeResult<()> {
        self.connect().await?;
        let mut state = self.state.lock().await;
        let user = state
            .users
            .values_mut()
            .find(|user| user.id == user_id)
            .ok_or(ExchangeError::NotFound(format!("User {user_id}")))?;
        user.full_name = Some(full_name.to_string());
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryRepository {
    async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        full_name: Option<&str>,
    ) -> ExchangeResult<(Uuid, String)> {
        self.connect().await?;
        let mut state = self.state.lock().await;
        if state.users.contains_key(email) {
            return Err(ExchangeError::Validation("User already exists".to_string()));
        }
        let record = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            full_name: full_name.map(str::to_string),
        };
        state.users.insert(email.to_string(), record.clone());
        Ok((record.id, record.email))
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> ExchangeResult<Option<(Uuid, String, String)>> {
        self.connect().await?;
        let state = self.state.lock().await;
        Ok(state
            .users
            .get(email)
            .map(|user| (user.id, user.email.clone(), user.password_hash.clone())))
    }

    async fn store_refresh_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> ExchangeResult<()> {
        self.connect().await?;
        let mut state = self.state.lock().await;
        state
            .refresh_tokens
            .insert(token.to_string(), (user_id, expires_at));
        Ok(())
    }

    async fn verify_refresh_token(&self, token: &str) -> ExchangeResult<Option<Uuid>> {
        self.connect().await?;
        let state = self.state.lock().await;
        Ok(state
            .refresh_tokens
            .get(token)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(user_id, _)| *user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_from(creator_id: Uuid) -> NewOffer {
        NewOffer {
            id: Uuid::new_v4(),
            creator_id,
            from_currency: "XOF".into(),
            from_amount: Decimal::from(10000),
            to_currency: "NGN".into(),
            to_amount: Decimal::from(15000),
        }
    }

    #[tokio::test]
    async fn offer_creation_escrows_the_creator_funds() {
        let repo = MemoryRepository::new();
        let creator = Uuid::new_v4();
        repo.deposit(creator, "XOF", Decimal::from(12000)).await.unwrap();

        repo.insert_offer(&offer_from(creator)).await.unwrap();

        assert_eq!(repo.balance_of(creator, "XOF").await, Decimal::from(2000));
    }

    #[tokio::test]
    async fn resent_offer_is_escrowed_once() {
        let repo = MemoryRepository::new();
        let creator = Uuid::new_v4();
        repo.deposit(creator, "XOF", Decimal::from(20000)).await.unwrap();
        let offer = offer_from(creator);

        let first = repo.insert_offer(&offer).await.unwrap();
        let again = repo.insert_offer(&offer).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(repo.open_offers().await.unwrap().len(), 1);
        assert_eq!(repo.balance_of(creator, "XOF").await, Decimal::from(10000));

        let hijack = NewOffer {
            creator_id: Uuid::new_v4(),
            ..offer
        };
        assert!(matches!(
            repo.insert_offer(&hijack).await,
            Err(ExchangeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn resent_exchange_is_applied_once() {
        let repo = MemoryRepository::new();
        let user = Uuid::new_v4();
        repo.deposit(user, "USD", Decimal::from(100)).await.unwrap();
        let quote = Quote {
            from_currency: "USD".into(),
            to_currency: "EUR".into(),
            from_amount: Decimal::from(40),
            to_amount: Decimal::from(36),
            rate: Decimal::new(9, 1),
            fee: Decimal::new(4, 1),
            total: Decimal::new(356, 1),
        };
        let id = Uuid::new_v4();

        let first = repo.execute_exchange(user, id, &quote).await.unwrap();
        let again = repo.execute_exchange(user, id, &quote).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(repo.balance_of(user, "USD").await, Decimal::from(60));
        assert_eq!(repo.balance_of(user, "EUR").await, Decimal::new(356, 1));
    }

    #[test]
    fn oversized_latency_saturates() {
        let repo = MemoryRepository::new();
        repo.set_latency(Duration::MAX);
        assert_eq!(repo.latency_ms.load(Ordering::SeqCst), u64::MAX);
    }

    #[tokio::test]
    async fn failed_settlement_leaves_everything_untouched() {
        let repo = MemoryRepository::new();
        let creator = Uuid::new_v4();
        let accepter = Uuid::new_v4();
        repo.deposit(creator, "XOF", Decimal::from(10000)).await.unwrap();
        repo.deposit(accepter, "NGN", Decimal::from(100)).await.unwrap();
        let offer = repo.insert_offer(&offer_from(creator)).await.unwrap();

        let result = repo.settle_offer(offer.id, accepter).await;

        assert!(matches!(result, Err(ExchangeError::InsufficientFunds(c)) if c == "NGN"));
        assert_eq!(repo.balance_of(accepter, "NGN").await, Decimal::from(100));
        assert_eq!(repo.balance_of(creator, "NGN").await, Decimal::ZERO);
        assert!(repo.offer(offer.id).await.unwrap().unwrap().is_open());
    }

    #[tokio::test]
    async fn cancel_refunds_the_escrow() {
        let repo = MemoryRepository::new();
        let creator = Uuid::new_v4();
        repo.deposit(creator, "XOF", Decimal::from(10000)).await.unwrap();
        let offer = repo.insert_offer(&offer_from(creator)).await.unwrap();

        let cancelled = repo.cancel_offer(offer.id, creator).await.unwrap();

        assert_eq!(cancelled.status, OfferStatus::Cancelled);
        assert_eq!(repo.balance_of(creator, "XOF").await, Decimal::from(10000));
    }

    #[tokio::test]
    async fn unreachable_repository_reports_network_errors() {
        let repo = MemoryRepository::new();
        repo.set_reachable(false);
        let err = repo.open_offers().await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn refresh_tokens_expire() {
        let repo = MemoryRepository::new();
        let user = Uuid::new_v4();
        repo.store_refresh_token(user, "fresh", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        repo.store_refresh_token(user, "stale", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(repo.verify_refresh_token("fresh").await.unwrap(), Some(user));
        assert_eq!(repo.verify_refresh_token("stale").await.unwrap(), None);
    }
}
