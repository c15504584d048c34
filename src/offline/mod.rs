use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ExchangeSettings;
use crate::db::offer::{NewOffer, OfferStatus, P2POffer};
use crate::db::ExchangeBackend;
use crate::error::{ExchangeError, ExchangeResult};

pub mod action;
pub mod store;

pub use action::{ActionPayload, Hold, OfflineAction, OfflineActionType};
pub use store::{FileStore, KeyValueStore, MemoryStore};

pub const QUEUE_KEY: &str = "offline_action_queue";

/// Result of a mutating call that may have been deferred.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Confirmed(T),
    Queued(OfflineAction),
}

impl<T> Outcome<T> {
    pub fn confirmed(self) -> Option<T> {
        match self {
            Outcome::Confirmed(value) => Some(value),
            Outcome::Queued(_) => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Outcome::Queued(_))
    }
}

#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, payload: &ActionPayload) -> ExchangeResult<()>;
}

/// Replays queued payloads against an exchange backend.
pub struct BackendDispatcher {
    backend: Arc<dyn ExchangeBackend>,
}

impl BackendDispatcher {
    pub fn new(backend: Arc<dyn ExchangeBackend>) -> Self {
        Self { backend }
    }

    // an earlier attempt may have committed before its reply was lost
    async fn applied_earlier(
        &self,
        offer_id: Uuid,
        applied: impl Fn(&P2POffer) -> bool + Send,
    ) -> ExchangeResult<()> {
        match self.backend.offer(offer_id).await? {
            Some(offer) if applied(&offer) => {
                tracing::info!("Offer {offer_id} already reflects the replayed action");
                Ok(())
            }
            _ => Err(ExchangeError::OfferNotOpen),
        }
    }
}

#[async_trait]
impl ActionDispatcher for BackendDispatcher {
    async fn dispatch(&self, payload: &ActionPayload) -> ExchangeResult<()> {
        match payload {
            ActionPayload::CreateOffer {
                offer_id,
                creator_id,
                from_currency,
                from_amount,
                to_currency,
                to_amount,
            } => {
                let offer = NewOffer {
                    id: *offer_id,
                    creator_id: *creator_id,
                    from_currency: from_currency.clone(),
                    from_amount: *from_amount,
                    to_currency: to_currency.clone(),
                    to_amount: *to_amount,
                };
                self.backend.insert_offer(&offer).await.map(|_| ())
            }
            ActionPayload::AcceptOffer {
                accepter_id,
                offer_id,
            } => match self.backend.settle_offer(*offer_id, *accepter_id).await {
                Ok(_) => Ok(()),
                Err(ExchangeError::OfferNotOpen) => {
                    self.applied_earlier(*offer_id, |offer| {
                        offer.matched_by == Some(*accepter_id)
                    })
                    .await
                }
                Err(err) => Err(err),
            },
            ActionPayload::CancelOffer {
                requester_id,
                offer_id,
            } => match self.backend.cancel_offer(*offer_id, *requester_id).await {
                Ok(_) => Ok(()),
                Err(ExchangeError::OfferNotOpen) => {
                    self.applied_earlier(*offer_id, |offer| {
                        offer.status == OfferStatus::Cancelled && offer.user_id == *requester_id
                    })
                    .await
                }
                Err(err) => Err(err),
            },
            ActionPayload::ExecuteExchange {
                transaction_id,
                user_id,
                quote,
            } => self
                .backend
                .execute_exchange(*user_id, *transaction_id, quote)
                .await
                .map(|_| ()),
            ActionPayload::KycUpdate { user_id, document } => {
                self.backend.submit_kyc(*user_id, document).await
            }
            ActionPayload::ProfileUpdate { user_id, full_name } => {
                self.backend.update_profile(*user_id, full_name).await
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FlushReport {
    pub delivered: Vec<Uuid>,
    pub retried: Vec<Uuid>,
    /// Gave up after too many connectivity failures.
    pub dropped: Vec<OfflineAction>,
    /// Refused by the backend; replaying them again would never succeed.
    pub rejected: Vec<OfflineAction>,
    /// Another flush was already running.
    pub skipped: bool,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// FIFO of deferred mutating calls, persisted on every change.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    dispatcher: Arc<dyn ActionDispatcher>,
    actions: Mutex<VecDeque<OfflineAction>>,
    online: AtomicBool,
    flushing: AtomicBool,
    max_retries: u32,
    timeout: Duration,
}

impl OfflineQueue {
    /// Restores whatever a previous process left in `store`.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        dispatcher: Arc<dyn ActionDispatcher>,
        settings: &ExchangeSettings,
    ) -> ExchangeResult<Self> {
        let actions: VecDeque<OfflineAction> = match store.load(QUEUE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => VecDeque::new(),
        };
        if !actions.is_empty() {
            tracing::info!("Restored {} pending offline actions", actions.len());
        }

        Ok(Self {
            store,
            dispatcher,
            actions: Mutex::new(actions),
            online: AtomicBool::new(true),
            flushing: AtomicBool::new(false),
            max_retries: settings.max_offline_retries,
            timeout: settings.request_timeout,
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn mark_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            tracing::warn!("Backend unreachable, deferring mutating actions");
        }
    }

    /// Going from offline to online is the reconnect trigger and flushes.
    pub async fn set_online(&self, online: bool) -> Option<FlushReport> {
        if !online {
            self.mark_offline();
            return None;
        }
        let was_online = self.online.swap(true, Ordering::SeqCst);
        if was_online {
            return None;
        }
        tracing::info!("Connectivity restored, replaying offline actions");
        Some(self.flush().await)
    }

    pub async fn enqueue(&self, payload: ActionPayload) -> ExchangeResult<OfflineAction> {
        self.enqueue_action(OfflineAction::new(payload)).await
    }

    pub async fn enqueue_action(&self, action: OfflineAction) -> ExchangeResult<OfflineAction> {
        {
            let mut actions = self.actions.lock().await;
            actions.push_back(action.clone());
            if let Err(err) = self.persist(&actions).await {
                actions.pop_back();
                tracing::error!("Unable to persist offline action {}: {err}", action.id);
                return Err(err);
            }
        }
        tracing::info!(
            "Queued offline action {} ({:?})",
            action.id,
            action.action_type
        );

        if self.is_online() {
            self.flush().await;
        }
        Ok(action)
    }

    /// Delivers right away when online; queues only if the backend cannot be
    /// reached. Business rejections are returned, never queued.
    pub async fn submit(&self, payload: ActionPayload) -> ExchangeResult<Outcome<()>> {
        if self.is_online() {
            match self.deliver(&payload).await {
                Ok(()) => return Ok(Outcome::Confirmed(())),
                Err(err) if err.is_connectivity() => {
                    tracing::warn!("Delivery failed, queueing for later: {err}");
                    self.mark_offline();
                }
                Err(err) => return Err(err),
            }
        }
        let action = self.enqueue(payload).await?;
        Ok(Outcome::Queued(action))
    }

    pub async fn flush(&self) -> FlushReport {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Offline queue flush already running");
            return FlushReport {
                skipped: true,
                ..FlushReport::default()
            };
        }
        let _guard = FlushGuard(&self.flushing);

        let mut report = FlushReport::default();
        let mut attempted = HashSet::new();

        loop {
            let next = {
                let actions = self.actions.lock().await;
                actions
                    .iter()
                    .find(|action| !attempted.contains(&action.id))
                    .cloned()
            };
            let Some(action) = next else {
                break;
            };
            attempted.insert(action.id);

            let result = self.deliver(&action.payload).await;

            let mut actions = self.actions.lock().await;
            let position = actions.iter().position(|queued| queued.id == action.id);
            let mut stop = false;

            match (result, position) {
                (_, None) => {}
                (Ok(()), Some(position)) => {
                    actions.remove(position);
                    tracing::info!("Delivered offline action {}", action.id);
                    report.delivered.push(action.id);
                }
                (Err(err), Some(position)) if err.is_connectivity() => {
                    // later actions must not overtake this one
                    stop = true;
                    self.online.store(false, Ordering::SeqCst);

                    let attempts = {
                        let queued = &mut actions[position];
                        queued.retry_count += 1;
                        queued.retry_count
                    };
                    if attempts >= self.max_retries {
                        if let Some(dropped) = actions.remove(position) {
                            tracing::error!(
                                "Dropping unresolved offline action {} after {attempts} attempts: {err}",
                                dropped.id
                            );
                            report.dropped.push(dropped);
                        }
                    } else {
                        tracing::warn!(
                            "Offline action {} failed (attempt {attempts}): {err}",
                            action.id
                        );
                        report.retried.push(action.id);
                    }
                }
                (Err(err), Some(position)) => {
                    if let Some(rejected) = actions.remove(position) {
                        tracing::warn!("Backend rejected offline action {}: {err}", rejected.id);
                        report.rejected.push(rejected);
                    }
                }
            }

            if let Err(err) = self.persist(&actions).await {
                tracing::error!("Unable to persist offline queue: {err}");
            }
            if stop {
                break;
            }
        }

        report
    }

    pub async fn pending(&self) -> Vec<OfflineAction> {
        self.actions.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actions.lock().await.is_empty()
    }

    /// Net optimistic change on one wallet from every action still queued.
    /// A hold disappears the moment its action is delivered, dropped or
    /// rejected, no matter which caller ran the flush.
    pub async fn held(&self, user_id: Uuid, currency: &str) -> Decimal {
        self.actions
            .lock()
            .await
            .iter()
            .map(|action| action.held(user_id, currency))
            .sum()
    }

    async fn deliver(&self, payload: &ActionPayload) -> ExchangeResult<()> {
        tokio::time::timeout(self.timeout, self.dispatcher.dispatch(payload))
            .await
            .map_err(ExchangeError::from)
            .and_then(|result| result)
    }

    async fn persist(&self, actions: &VecDeque<OfflineAction>) -> ExchangeResult<()> {
        let raw = serde_json::to_string(actions)?;
        self.store.save(QUEUE_KEY, &raw).await
    }
}
