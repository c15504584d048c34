use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use p2p_exchange::config::ExchangeSettings;
use p2p_exchange::db::memory::MemoryRepository;
use p2p_exchange::db::offer::{NewOffer, OfferStatus, P2POffer};
use p2p_exchange::db::tx::Transaction;
use p2p_exchange::db::wallet::Wallet;
use p2p_exchange::db::{ExchangeBackend, UserStore};
use p2p_exchange::exchange::{
    CurrencyRegistry, ExchangeCalculator, OfferManager, Quote, RateProvider,
};
use p2p_exchange::offline::{
    ActionPayload, BackendDispatcher, FileStore, MemoryStore, OfflineQueue, Outcome,
};
use p2p_exchange::{ExchangeError, ExchangeResult};

fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

struct Fixture {
    repo: Arc<MemoryRepository>,
    queue: Arc<OfflineQueue>,
    manager: OfferManager,
}

async fn fixture(timeout: Duration) -> Fixture {
    let settings = ExchangeSettings::default();
    let repo = Arc::new(MemoryRepository::new());
    let queue = Arc::new(
        OfflineQueue::open(
            Arc::new(MemoryStore::new()),
            Arc::new(BackendDispatcher::new(repo.clone())),
            &settings,
        )
        .await
        .unwrap(),
    );
    let rates = Arc::new(RateProvider::new(&settings, vec![]));
    let calculator = Arc::new(ExchangeCalculator::new(rates, settings.fee_rate));
    let manager = OfferManager::new(
        repo.clone(),
        Arc::new(CurrencyRegistry::with_defaults()),
        calculator,
        timeout,
    )
    .with_offline_queue(queue.clone());
    Fixture {
        repo,
        queue,
        manager,
    }
}

/// Applies every mutation, then answers after `delay`: the reply is lost to
/// any caller with a shorter timeout although the change is committed.
struct LateReplies {
    inner: Arc<MemoryRepository>,
    delay: Duration,
}

impl LateReplies {
    async fn late<T>(&self, result: ExchangeResult<T>) -> ExchangeResult<T> {
        tokio::time::sleep(self.delay).await;
        result
    }
}

#[async_trait]
impl ExchangeBackend for LateReplies {
    async fn wallet(&self, user_id: Uuid, currency: &str) -> ExchangeResult<Option<Wallet>> {
        self.inner.wallet(user_id, currency).await
    }

    async fn wallets(&self, user_id: Uuid) -> ExchangeResult<Vec<Wallet>> {
        self.inner.wallets(user_id).await
    }

    async fn deposit(
        &self,
        user_id: Uuid,
        currency: &str,
        amount: Decimal,
    ) -> ExchangeResult<Transaction> {
        self.inner.deposit(user_id, currency, amount).await
    }

    async fn insert_offer(&self, offer: &NewOffer) -> ExchangeResult<P2POffer> {
        let result = self.inner.insert_offer(offer).await;
        self.late(result).await
    }

    async fn offer(&self, offer_id: Uuid) -> ExchangeResult<Option<P2POffer>> {
        self.inner.offer(offer_id).await
    }

    async fn open_offers(&self) -> ExchangeResult<Vec<P2POffer>> {
        self.inner.open_offers().await
    }

    async fn settle_offer(
        &self,
        offer_id: Uuid,
        accepter_id: Uuid,
    ) -> ExchangeResult<Transaction> {
        let result = self.inner.settle_offer(offer_id, accepter_id).await;
        self.late(result).await
    }

    async fn cancel_offer(&self, offer_id: Uuid, requester_id: Uuid) -> ExchangeResult<P2POffer> {
        let result = self.inner.cancel_offer(offer_id, requester_id).await;
        self.late(result).await
    }

    async fn execute_exchange(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        quote: &Quote,
    ) -> ExchangeResult<Transaction> {
        let result = self
            .inner
            .execute_exchange(user_id, transaction_id, quote)
            .await;
        self.late(result).await
    }

    async fn transactions(&self, user_id: Uuid) -> ExchangeResult<Vec<Transaction>> {
        self.inner.transactions(user_id).await
    }

    async fn submit_kyc(&self, user_id: Uuid, document: &serde_json::Value) -> ExchangeResult<()> {
        self.inner.submit_kyc(user_id, document).await
    }

    async fn update_profile(&self, user_id: Uuid, full_name: &str) -> ExchangeResult<()> {
        self.inner.update_profile(user_id, full_name).await
    }
}

async fn late_fixture() -> Fixture {
    let settings = ExchangeSettings::default();
    let repo = Arc::new(MemoryRepository::new());
    let backend = Arc::new(LateReplies {
        inner: repo.clone(),
        delay: Duration::from_millis(300),
    });
    let queue = Arc::new(
        OfflineQueue::open(
            Arc::new(MemoryStore::new()),
            Arc::new(BackendDispatcher::new(backend.clone())),
            &settings,
        )
        .await
        .unwrap(),
    );
    let rates = Arc::new(RateProvider::new(&settings, vec![]));
    let manager = OfferManager::new(
        backend,
        Arc::new(CurrencyRegistry::with_defaults()),
        Arc::new(ExchangeCalculator::new(rates, settings.fee_rate)),
        Duration::from_millis(50),
    )
    .with_offline_queue(queue.clone());
    Fixture {
        repo,
        queue,
        manager,
    }
}

async fn funded(repo: &MemoryRepository, currency: &str, amount: i64) -> Uuid {
    let user = Uuid::new_v4();
    repo.deposit(user, currency, dec(amount)).await.unwrap();
    user
}

#[tokio::test]
async fn offer_created_offline_is_delivered_on_reconnect() {
    let Fixture {
        repo,
        queue,
        manager,
    } = fixture(Duration::from_secs(2)).await;
    let user = funded(&repo, "XOF", 10000).await;

    repo.set_reachable(false);
    let outcome = manager
        .create_offer(user, "XOF", dec(10000), "NGN", dec(15000))
        .await
        .unwrap();
    let Outcome::Queued(action) = outcome else {
        panic!("offer should have been deferred");
    };
    assert!(matches!(action.payload, ActionPayload::CreateOffer { .. }));
    assert!(!queue.is_online());
    assert_eq!(queue.len().await, 1);

    repo.set_reachable(true);
    // escrow shows up before the backend has seen the offer
    assert_eq!(repo.balance_of(user, "XOF").await, dec(10000));
    assert_eq!(manager.display_balance(user, "XOF").await.unwrap(), dec(0));

    let report = manager.reconnect().await.unwrap();
    assert_eq!(report.delivered, vec![action.id]);
    assert!(queue.is_empty().await);

    let offers: Vec<_> = manager.list_open_offers().await.unwrap().collect();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].user_id, user);
    assert_eq!(repo.balance_of(user, "XOF").await, dec(0));
    assert_eq!(manager.display_balance(user, "XOF").await.unwrap(), dec(0));

    // a second reconnect replays nothing
    assert!(manager.reconnect().await.is_none());
    assert_eq!(manager.list_open_offers().await.unwrap().count(), 1);
}

#[tokio::test]
async fn accept_rejected_on_replay_is_rolled_back() {
    let Fixture {
        repo,
        queue,
        manager,
    } = fixture(Duration::from_secs(2)).await;
    let creator = funded(&repo, "XOF", 10000).await;
    let late = funded(&repo, "NGN", 15000).await;
    let early = funded(&repo, "NGN", 15000).await;

    let offer = manager
        .create_offer(creator, "XOF", dec(10000), "NGN", dec(15000))
        .await
        .unwrap()
        .confirmed()
        .unwrap();

    repo.set_reachable(false);
    assert!(manager.accept_offer(late, offer.id).await.unwrap().is_queued());

    // someone else takes the offer while the device is offline
    repo.set_reachable(true);
    repo.settle_offer(offer.id, early).await.unwrap();

    let report = manager.reconnect().await.unwrap();
    assert_eq!(report.rejected.len(), 1);
    assert!(report.delivered.is_empty());
    assert!(queue.is_empty().await);

    assert_eq!(repo.balance_of(late, "NGN").await, dec(15000));
    assert_eq!(manager.display_balance(late, "NGN").await.unwrap(), dec(15000));
}

#[tokio::test]
async fn unreachable_backend_drops_the_action_after_three_attempts() {
    let Fixture {
        repo,
        queue,
        manager,
    } = fixture(Duration::from_secs(2)).await;
    let user = funded(&repo, "KES", 5000).await;

    repo.set_reachable(false);
    assert!(manager
        .create_offer(user, "KES", dec(5000), "GHS", dec(600))
        .await
        .unwrap()
        .is_queued());

    let first = manager.reconnect().await.unwrap();
    assert_eq!(first.retried.len(), 1);
    assert_eq!(queue.pending().await[0].retry_count, 1);

    let second = manager.reconnect().await.unwrap();
    assert_eq!(second.retried.len(), 1);

    let third = manager.reconnect().await.unwrap();
    assert_eq!(third.dropped.len(), 1);
    assert_eq!(third.dropped[0].retry_count, 3);
    assert!(queue.is_empty().await);

    repo.set_reachable(true);
    assert_eq!(manager.display_balance(user, "KES").await.unwrap(), dec(5000));
    assert_eq!(manager.list_open_offers().await.unwrap().count(), 0);
}

#[tokio::test]
async fn business_rejections_are_never_queued() {
    let Fixture {
        repo,
        queue,
        manager,
    } = fixture(Duration::from_secs(2)).await;
    let user = funded(&repo, "XOF", 100).await;

    let result = manager
        .create_offer(user, "XOF", dec(10000), "NGN", dec(15000))
        .await;

    assert!(matches!(result, Err(ExchangeError::InsufficientFunds(_))));
    assert!(queue.is_empty().await);
    assert!(queue.is_online());
}

#[tokio::test]
async fn slow_backend_times_out_into_the_queue() {
    let Fixture {
        repo,
        queue,
        manager,
    } = fixture(Duration::from_millis(50)).await;
    let user = funded(&repo, "USD", 100).await;

    repo.set_latency(Duration::from_millis(200));
    let outcome = manager
        .execute_exchange(user, dec(40), "USD", "EUR")
        .await
        .unwrap();
    assert!(outcome.is_queued());
    assert_eq!(queue.len().await, 1);

    repo.set_latency(Duration::ZERO);
    assert_eq!(manager.display_balance(user, "USD").await.unwrap(), dec(60));

    let report = manager.reconnect().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(repo.balance_of(user, "USD").await, dec(60));
    assert!(repo.balance_of(user, "EUR").await > dec(0));
}

#[tokio::test]
async fn profile_update_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ExchangeSettings::default();
    let repo = Arc::new(MemoryRepository::new());
    let (user, _) = repo
        .create_user("ada@example.com", "hash", Some("Ada"))
        .await
        .unwrap();

    {
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let queue = OfflineQueue::open(
            store,
            Arc::new(BackendDispatcher::new(repo.clone())),
            &settings,
        )
        .await
        .unwrap();
        repo.set_reachable(false);
        let outcome = queue
            .submit(ActionPayload::ProfileUpdate {
                user_id: user,
                full_name: "Ada Lovelace".into(),
            })
            .await
            .unwrap();
        assert!(outcome.is_queued());
    }

    repo.set_reachable(true);
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let queue = OfflineQueue::open(
        store,
        Arc::new(BackendDispatcher::new(repo.clone())),
        &settings,
    )
    .await
    .unwrap();
    assert_eq!(queue.len().await, 1);

    let report = queue.flush().await;
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(repo.full_name(user).await.as_deref(), Some("Ada Lovelace"));
}

#[tokio::test]
async fn committed_offer_with_a_lost_reply_is_not_created_twice() {
    let Fixture {
        repo,
        queue,
        manager,
    } = late_fixture().await;
    let user = funded(&repo, "XOF", 20000).await;

    let outcome = manager
        .create_offer(user, "XOF", dec(10000), "NGN", dec(15000))
        .await
        .unwrap();
    assert!(outcome.is_queued());
    // the backend already holds the offer and its escrow
    assert_eq!(repo.balance_of(user, "XOF").await, dec(10000));

    let report = manager.reconnect().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert!(queue.is_empty().await);

    assert_eq!(manager.list_open_offers().await.unwrap().count(), 1);
    assert_eq!(repo.balance_of(user, "XOF").await, dec(10000));
    assert_eq!(manager.display_balance(user, "XOF").await.unwrap(), dec(10000));
}

#[tokio::test]
async fn committed_exchange_with_a_lost_reply_is_applied_once() {
    let Fixture { repo, manager, .. } = late_fixture().await;
    let user = funded(&repo, "USD", 100).await;

    let outcome = manager
        .execute_exchange(user, dec(40), "USD", "EUR")
        .await
        .unwrap();
    assert!(outcome.is_queued());

    let report = manager.reconnect().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(repo.balance_of(user, "USD").await, dec(60));
    let exchanges = repo.transactions(user).await.unwrap();
    // deposit plus a single exchange
    assert_eq!(exchanges.len(), 2);
}

#[tokio::test]
async fn committed_accept_with_a_lost_reply_counts_as_delivered() {
    let Fixture { repo, manager, .. } = late_fixture().await;
    let creator = funded(&repo, "XOF", 10000).await;
    let accepter = funded(&repo, "NGN", 15000).await;
    let offer = repo
        .insert_offer(&NewOffer {
            id: Uuid::new_v4(),
            creator_id: creator,
            from_currency: "XOF".into(),
            from_amount: dec(10000),
            to_currency: "NGN".into(),
            to_amount: dec(15000),
        })
        .await
        .unwrap();

    assert!(manager.accept_offer(accepter, offer.id).await.unwrap().is_queued());

    let report = manager.reconnect().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert!(report.rejected.is_empty());

    let matched = manager.get_offer(offer.id).await.unwrap();
    assert_eq!(matched.status, OfferStatus::Matched);
    assert_eq!(manager.display_balance(accepter, "NGN").await.unwrap(), dec(0));
}

#[tokio::test]
async fn holds_clear_when_the_queue_is_flushed_directly() {
    let Fixture {
        repo,
        queue,
        manager,
    } = fixture(Duration::from_secs(2)).await;
    let user = funded(&repo, "XOF", 10000).await;

    repo.set_reachable(false);
    assert!(manager
        .create_offer(user, "XOF", dec(4000), "NGN", dec(6000))
        .await
        .unwrap()
        .is_queued());
    repo.set_reachable(true);
    assert_eq!(manager.display_balance(user, "XOF").await.unwrap(), dec(6000));

    // reconnect noticed by another component sharing the queue
    let report = queue.set_online(true).await.unwrap();
    assert_eq!(report.delivered.len(), 1);

    assert_eq!(repo.balance_of(user, "XOF").await, dec(6000));
    assert_eq!(manager.display_balance(user, "XOF").await.unwrap(), dec(6000));
}
