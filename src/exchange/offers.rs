use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use uuid::Uuid;

use super::calculator::ExchangeCalculator;
use super::registry::CurrencyRegistry;
use crate::db::offer::{NewOffer, P2POffer};
use crate::db::tx::Transaction;
use crate::db::ExchangeBackend;
use crate::error::{ExchangeError, ExchangeResult};
use crate::offline::{ActionPayload, FlushReport, Hold, OfflineAction, OfflineQueue, Outcome};

/// Validates and drives the P2P offer lifecycle against a backend.
///
/// Offers move `open -> matched` on acceptance or `open -> cancelled` when
/// the creator withdraws them; both are terminal. Funds are escrowed by the
/// backend when the offer is created. With an offline queue attached,
/// mutating calls that cannot reach the backend are deferred instead of
/// failing, and the queued action carries an optimistic hold until the
/// replay resolves.
pub struct OfferManager {
    backend: Arc<dyn ExchangeBackend>,
    registry: Arc<CurrencyRegistry>,
    calculator: Arc<ExchangeCalculator>,
    queue: Option<Arc<OfflineQueue>>,
    timeout: Duration,
}

impl OfferManager {
    pub fn new(
        backend: Arc<dyn ExchangeBackend>,
        registry: Arc<CurrencyRegistry>,
        calculator: Arc<ExchangeCalculator>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            calculator,
            queue: None,
            timeout,
        }
    }

    pub fn with_offline_queue(mut self, queue: Arc<OfflineQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub async fn create_offer(
        &self,
        creator_id: Uuid,
        from_currency: &str,
        from_amount: Decimal,
        to_currency: &str,
        to_amount: Decimal,
    ) -> ExchangeResult<Outcome<P2POffer>> {
        self.create_offer_with_id(
            Uuid::new_v4(),
            creator_id,
            from_currency,
            from_amount,
            to_currency,
            to_amount,
        )
        .await
    }

    /// Same as `create_offer` with a caller-chosen offer id. Repeating a
    /// call with the same id never creates or escrows a second offer.
    pub async fn create_offer_with_id(
        &self,
        offer_id: Uuid,
        creator_id: Uuid,
        from_currency: &str,
        from_amount: Decimal,
        to_currency: &str,
        to_amount: Decimal,
    ) -> ExchangeResult<Outcome<P2POffer>> {
        if from_amount <= Decimal::ZERO || to_amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount);
        }
        let from = self.registry.require_active(from_currency)?.code.clone();
        let to = self.registry.require_active(to_currency)?.code.clone();
        if from == to {
            return Err(ExchangeError::Validation(
                "Offer currencies must differ".to_string(),
            ));
        }

        let offer = NewOffer {
            id: offer_id,
            creator_id,
            from_currency: from.clone(),
            from_amount,
            to_currency: to.clone(),
            to_amount,
        };
        let payload = ActionPayload::CreateOffer {
            offer_id,
            creator_id,
            from_currency: from.clone(),
            from_amount,
            to_currency: to,
            to_amount,
        };
        let holds = vec![Hold {
            user_id: creator_id,
            currency: from,
            delta: -from_amount,
        }];

        if self.is_offline() {
            return self.queue_action(payload, holds).await;
        }

        // the backend checks the balance and escrows in one step
        match self.call(self.backend.insert_offer(&offer)).await {
            Ok(stored) => {
                tracing::info!(
                    "Offer {} created by {creator_id}: {} {} for {} {} (rate {})",
                    stored.id,
                    stored.from_amount,
                    stored.from_currency,
                    stored.to_amount,
                    stored.to_currency,
                    stored.implied_rate()
                );
                Ok(Outcome::Confirmed(stored))
            }
            Err(ExchangeError::InsufficientFunds(currency)) => {
                tracing::warn!("Offer refused, user {creator_id} lacks {from_amount} {currency}");
                Err(ExchangeError::InsufficientFunds(currency))
            }
            Err(err) => self.defer(err, payload, holds).await,
        }
    }

    /// Open offers, oldest first. The order is stable between calls as long
    /// as nothing changes.
    pub async fn list_open_offers(&self) -> ExchangeResult<impl Iterator<Item = P2POffer>> {
        let offers = self.call(self.backend.open_offers()).await?;
        Ok(offers.into_iter())
    }

    pub async fn get_offer(&self, offer_id: Uuid) -> ExchangeResult<P2POffer> {
        self.call(self.backend.offer(offer_id))
            .await?
            .ok_or(ExchangeError::NotFound(format!("Offer {offer_id}")))
    }

    pub async fn accept_offer(
        &self,
        accepter_id: Uuid,
        offer_id: Uuid,
    ) -> ExchangeResult<Outcome<Transaction>> {
        let payload = ActionPayload::AcceptOffer {
            accepter_id,
            offer_id,
        };
        if self.is_offline() {
            return self.queue_action(payload, Vec::new()).await;
        }

        let offer = match self.call(self.backend.offer(offer_id)).await {
            Ok(Some(offer)) => offer,
            Ok(None) => return Err(ExchangeError::NotFound(format!("Offer {offer_id}"))),
            Err(err) => return self.defer(err, payload, Vec::new()).await,
        };
        if !offer.is_open() {
            tracing::warn!("Accept refused, offer {offer_id} is {:?}", offer.status);
            return Err(ExchangeError::OfferNotOpen);
        }
        if offer.user_id == accepter_id {
            return Err(ExchangeError::NotAuthorized);
        }

        let holds = vec![Hold {
            user_id: accepter_id,
            currency: offer.to_currency.clone(),
            delta: -offer.to_amount,
        }];

        match self
            .call(self.backend.wallet(accepter_id, &offer.to_currency))
            .await
        {
            Ok(wallet) => {
                if !wallet.map(|wallet| wallet.covers(offer.to_amount)).unwrap_or(false) {
                    tracing::warn!(
                        "Accept refused, user {accepter_id} lacks {} {}",
                        offer.to_amount,
                        offer.to_currency
                    );
                    return Err(ExchangeError::InsufficientFunds(offer.to_currency));
                }
            }
            Err(err) => return self.defer(err, payload, holds).await,
        }

        match self.call(self.backend.settle_offer(offer_id, accepter_id)).await {
            Ok(transaction) => {
                tracing::info!(
                    "Offer {offer_id} matched by {accepter_id}, transaction {}",
                    transaction.reference
                );
                Ok(Outcome::Confirmed(transaction))
            }
            Err(err) => self.defer(err, payload, holds).await,
        }
    }

    pub async fn cancel_offer(
        &self,
        requester_id: Uuid,
        offer_id: Uuid,
    ) -> ExchangeResult<Outcome<P2POffer>> {
        let payload = ActionPayload::CancelOffer {
            requester_id,
            offer_id,
        };
        if self.is_offline() {
            return self.queue_action(payload, Vec::new()).await;
        }

        let offer = match self.call(self.backend.offer(offer_id)).await {
            Ok(Some(offer)) => offer,
            Ok(None) => return Err(ExchangeError::NotFound(format!("Offer {offer_id}"))),
            Err(err) => return self.defer(err, payload, Vec::new()).await,
        };
        if offer.user_id != requester_id {
            tracing::warn!("User {requester_id} tried to cancel offer {offer_id}");
            return Err(ExchangeError::NotAuthorized);
        }
        if !offer.is_open() {
            return Err(ExchangeError::OfferNotOpen);
        }

        let holds = vec![Hold {
            user_id: requester_id,
            currency: offer.from_currency.clone(),
            delta: offer.from_amount,
        }];

        match self.call(self.backend.cancel_offer(offer_id, requester_id)).await {
            Ok(cancelled) => {
                tracing::info!("Offer {offer_id} cancelled by its creator");
                Ok(Outcome::Confirmed(cancelled))
            }
            Err(err) => self.defer(err, payload, holds).await,
        }
    }

    /// Direct exchange at the current quote: debits `amount`, credits the
    /// net total.
    pub async fn execute_exchange(
        &self,
        user_id: Uuid,
        amount: Decimal,
        from_currency: &str,
        to_currency: &str,
    ) -> ExchangeResult<Outcome<Transaction>> {
        self.execute_exchange_with_id(Uuid::new_v4(), user_id, amount, from_currency, to_currency)
            .await
    }

    pub async fn execute_exchange_with_id(
        &self,
        transaction_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        from_currency: &str,
        to_currency: &str,
    ) -> ExchangeResult<Outcome<Transaction>> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount);
        }
        let from = self.registry.require_active(from_currency)?.code.clone();
        let to = self.registry.require_active(to_currency)?.code.clone();
        let quote = self.calculator.calculate(amount, &from, &to).await?;

        let holds = vec![Hold {
            user_id,
            currency: from,
            delta: -amount,
        }];
        let payload = ActionPayload::ExecuteExchange {
            transaction_id,
            user_id,
            quote: quote.clone(),
        };
        if self.is_offline() {
            return self.queue_action(payload, holds).await;
        }

        match self
            .call(self.backend.execute_exchange(user_id, transaction_id, &quote))
            .await
        {
            Ok(transaction) => {
                tracing::info!(
                    "Exchanged {} {} to {} {} for {user_id}",
                    quote.from_amount,
                    quote.from_currency,
                    quote.total,
                    quote.to_currency
                );
                Ok(Outcome::Confirmed(transaction))
            }
            Err(err) => self.defer(err, payload, holds).await,
        }
    }

    /// Confirmed backend balance plus the holds of actions still queued.
    pub async fn display_balance(&self, user_id: Uuid, currency: &str) -> ExchangeResult<Decimal> {
        let code = self.registry.lookup(currency)?.code.clone();
        let confirmed = self
            .call(self.backend.wallet(user_id, &code))
            .await?
            .map(|wallet| wallet.balance)
            .unwrap_or(Decimal::ZERO);
        let held = match &self.queue {
            Some(queue) => queue.held(user_id, &code).await,
            None => Decimal::ZERO,
        };
        Ok(confirmed + held)
    }

    /// Reconnect trigger: replays the offline queue. Holds of actions that
    /// were delivered, dropped or rejected leave the queue with them.
    pub async fn reconnect(&self) -> Option<FlushReport> {
        let queue = self.queue.as_ref()?;
        queue.set_online(true).await
    }

    pub async fn flush(&self) -> Option<FlushReport> {
        let queue = self.queue.as_ref()?;
        Some(queue.flush().await)
    }

    fn is_offline(&self) -> bool {
        self.queue
            .as_ref()
            .map(|queue| !queue.is_online())
            .unwrap_or(false)
    }

    async fn call<T, F>(&self, request: F) -> ExchangeResult<T>
    where
        F: Future<Output = ExchangeResult<T>>,
    {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(ExchangeError::from)
            .and_then(|result| result)
    }

    // connectivity failures go to the queue, everything else is the answer
    async fn defer<T>(
        &self,
        err: ExchangeError,
        payload: ActionPayload,
        holds: Vec<Hold>,
    ) -> ExchangeResult<Outcome<T>> {
        match &self.queue {
            Some(queue) if err.is_connectivity() => {
                tracing::warn!("Backend unreachable ({err}), deferring {:?}", payload.action_type());
                queue.mark_offline();
                self.queue_action(payload, holds).await
            }
            _ => Err(err),
        }
    }

    async fn queue_action<T>(
        &self,
        payload: ActionPayload,
        holds: Vec<Hold>,
    ) -> ExchangeResult<Outcome<T>> {
        let Some(queue) = &self.queue else {
            return Err(ExchangeError::Network("backend unreachable".to_string()));
        };
        let action = OfflineAction::new(payload).with_holds(holds);
        Ok(Outcome::Queued(queue.enqueue_action(action).await?))
    }
}
