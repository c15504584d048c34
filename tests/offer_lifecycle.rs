use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use uuid::Uuid;

use p2p_exchange::config::ExchangeSettings;
use p2p_exchange::db::memory::MemoryRepository;
use p2p_exchange::db::offer::OfferStatus;
use p2p_exchange::db::tx::TransactionStatus;
use p2p_exchange::db::ExchangeBackend;
use p2p_exchange::exchange::{CurrencyRegistry, ExchangeCalculator, OfferManager, RateProvider};
use p2p_exchange::ExchangeError;

fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

fn manager(repo: Arc<MemoryRepository>) -> OfferManager {
    let settings = ExchangeSettings::default();
    // static table only
    let rates = Arc::new(RateProvider::new(&settings, vec![]));
    let calculator = Arc::new(ExchangeCalculator::new(rates, settings.fee_rate));
    OfferManager::new(
        repo,
        Arc::new(CurrencyRegistry::with_defaults()),
        calculator,
        Duration::from_secs(2),
    )
}

async fn funded(repo: &MemoryRepository, currency: &str, amount: i64) -> Uuid {
    let user = Uuid::new_v4();
    repo.deposit(user, currency, dec(amount)).await.unwrap();
    user
}

#[tokio::test]
async fn xof_for_ngn_offer_settles_both_legs() {
    let repo = Arc::new(MemoryRepository::new());
    let manager = manager(repo.clone());
    let user_a = funded(&repo, "XOF", 10000).await;
    let user_b = funded(&repo, "NGN", 20000).await;

    let offer = manager
        .create_offer(user_a, "XOF", dec(10000), "NGN", dec(15000))
        .await
        .unwrap()
        .confirmed()
        .unwrap();
    assert_eq!(offer.implied_rate(), Decimal::new(15, 1));
    assert_eq!(offer.status, OfferStatus::Open);

    let transaction = manager
        .accept_offer(user_b, offer.id)
        .await
        .unwrap()
        .confirmed()
        .unwrap();
    assert_eq!(transaction.status, TransactionStatus::Completed);
    assert_eq!(transaction.offer_id, Some(offer.id));

    let settled = manager.get_offer(offer.id).await.unwrap();
    assert_eq!(settled.status, OfferStatus::Matched);
    assert_eq!(settled.matched_by, Some(user_b));

    assert_eq!(repo.balance_of(user_a, "XOF").await, dec(0));
    assert_eq!(repo.balance_of(user_a, "NGN").await, dec(15000));
    assert_eq!(repo.balance_of(user_b, "NGN").await, dec(5000));
    assert_eq!(repo.balance_of(user_b, "XOF").await, dec(10000));
}

#[tokio::test]
async fn short_accepter_leaves_the_offer_open() {
    let repo = Arc::new(MemoryRepository::new());
    let manager = manager(repo.clone());
    let user_a = funded(&repo, "XOF", 10000).await;
    let user_b = funded(&repo, "NGN", 14000).await;

    let offer = manager
        .create_offer(user_a, "XOF", dec(10000), "NGN", dec(15000))
        .await
        .unwrap()
        .confirmed()
        .unwrap();

    let result = manager.accept_offer(user_b, offer.id).await;
    assert!(matches!(result, Err(ExchangeError::InsufficientFunds(ref c)) if c == "NGN"));

    assert!(manager.get_offer(offer.id).await.unwrap().is_open());
    assert_eq!(repo.balance_of(user_b, "NGN").await, dec(14000));
    assert_eq!(repo.balance_of(user_a, "NGN").await, dec(0));
}

#[tokio::test]
async fn offer_creation_is_validated() {
    let repo = Arc::new(MemoryRepository::new());
    let manager = manager(repo.clone());
    let user = funded(&repo, "XOF", 500).await;

    assert!(matches!(
        manager.create_offer(user, "XOF", dec(0), "NGN", dec(10)).await,
        Err(ExchangeError::InvalidAmount)
    ));
    assert!(matches!(
        manager.create_offer(user, "XOF", dec(10), "NGN", dec(-1)).await,
        Err(ExchangeError::InvalidAmount)
    ));
    assert!(matches!(
        manager.create_offer(user, "XOF", dec(10), "ABC", dec(10)).await,
        Err(ExchangeError::UnknownCurrency(_))
    ));
    // GNF is registered but inactive
    assert!(matches!(
        manager.create_offer(user, "XOF", dec(10), "GNF", dec(10)).await,
        Err(ExchangeError::UnknownCurrency(_))
    ));
    assert!(matches!(
        manager.create_offer(user, "XOF", dec(1000), "NGN", dec(1500)).await,
        Err(ExchangeError::InsufficientFunds(ref c)) if c == "XOF"
    ));
    assert_eq!(manager.list_open_offers().await.unwrap().count(), 0);
}

#[tokio::test]
async fn lowercase_codes_are_normalized() {
    let repo = Arc::new(MemoryRepository::new());
    let manager = manager(repo.clone());
    let user = funded(&repo, "XOF", 1000).await;

    let offer = manager
        .create_offer(user, "xof", dec(1000), " ngn ", dec(1500))
        .await
        .unwrap()
        .confirmed()
        .unwrap();

    assert_eq!(offer.from_currency, "XOF");
    assert_eq!(offer.to_currency, "NGN");
}

#[tokio::test]
async fn terminal_offers_cannot_change_again() {
    let repo = Arc::new(MemoryRepository::new());
    let manager = manager(repo.clone());
    let creator = funded(&repo, "XOF", 20000).await;
    let accepter = funded(&repo, "NGN", 50000).await;

    let matched = manager
        .create_offer(creator, "XOF", dec(10000), "NGN", dec(15000))
        .await
        .unwrap()
        .confirmed()
        .unwrap();
    manager.accept_offer(accepter, matched.id).await.unwrap();

    assert!(matches!(
        manager.accept_offer(accepter, matched.id).await,
        Err(ExchangeError::OfferNotOpen)
    ));
    assert!(matches!(
        manager.cancel_offer(creator, matched.id).await,
        Err(ExchangeError::OfferNotOpen)
    ));

    let cancelled = manager
        .create_offer(creator, "XOF", dec(10000), "NGN", dec(15000))
        .await
        .unwrap()
        .confirmed()
        .unwrap();
    let cancelled = manager
        .cancel_offer(creator, cancelled.id)
        .await
        .unwrap()
        .confirmed()
        .unwrap();
    assert_eq!(cancelled.status, OfferStatus::Cancelled);
    assert_eq!(repo.balance_of(creator, "XOF").await, dec(10000));

    assert!(matches!(
        manager.accept_offer(accepter, cancelled.id).await,
        Err(ExchangeError::OfferNotOpen)
    ));
    assert!(matches!(
        manager.cancel_offer(creator, cancelled.id).await,
        Err(ExchangeError::OfferNotOpen)
    ));
}

#[tokio::test]
async fn only_the_creator_may_cancel_and_never_self_accept() {
    let repo = Arc::new(MemoryRepository::new());
    let manager = manager(repo.clone());
    let creator = funded(&repo, "KES", 5000).await;
    let stranger = funded(&repo, "GHS", 5000).await;

    let offer = manager
        .create_offer(creator, "KES", dec(1000), "GHS", dec(120))
        .await
        .unwrap()
        .confirmed()
        .unwrap();

    assert!(matches!(
        manager.cancel_offer(stranger, offer.id).await,
        Err(ExchangeError::NotAuthorized)
    ));
    assert!(matches!(
        manager.accept_offer(creator, offer.id).await,
        Err(ExchangeError::NotAuthorized)
    ));
    assert!(matches!(
        manager.accept_offer(stranger, Uuid::new_v4()).await,
        Err(ExchangeError::NotFound(_))
    ));
    assert!(manager.get_offer(offer.id).await.unwrap().is_open());
}

#[tokio::test]
async fn concurrent_accepts_settle_exactly_once() {
    let repo = Arc::new(MemoryRepository::new());
    // both accepts pass the open check before either settles
    repo.set_latency(Duration::from_millis(20));
    let manager = Arc::new(manager(repo.clone()));
    let creator = funded(&repo, "XOF", 10000).await;
    let first = funded(&repo, "NGN", 15000).await;
    let second = funded(&repo, "NGN", 15000).await;

    let offer = manager
        .create_offer(creator, "XOF", dec(10000), "NGN", dec(15000))
        .await
        .unwrap()
        .confirmed()
        .unwrap();

    let handles: Vec<_> = [first, second]
        .into_iter()
        .map(|accepter| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.accept_offer(accepter, offer.id).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut not_open = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                assert!(!outcome.is_queued());
                succeeded += 1;
            }
            Err(ExchangeError::OfferNotOpen) => not_open += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!((succeeded, not_open), (1, 1));

    // exactly one accepter paid
    let paid = repo.balance_of(first, "NGN").await + repo.balance_of(second, "NGN").await;
    assert_eq!(paid, dec(15000));
    assert_eq!(repo.balance_of(creator, "NGN").await, dec(15000));
}

#[tokio::test]
async fn listing_is_stable_and_only_shows_open_offers() {
    let repo = Arc::new(MemoryRepository::new());
    let manager = manager(repo.clone());
    let creator = funded(&repo, "ZAR", 10000).await;
    let accepter = funded(&repo, "KES", 100000).await;

    let mut ids = Vec::new();
    for amount in [100, 200, 300] {
        let offer = manager
            .create_offer(creator, "ZAR", dec(amount), "KES", dec(amount * 7))
            .await
            .unwrap()
            .confirmed()
            .unwrap();
        ids.push(offer.id);
    }

    let first: Vec<Uuid> = manager.list_open_offers().await.unwrap().map(|o| o.id).collect();
    let second: Vec<Uuid> = manager.list_open_offers().await.unwrap().map(|o| o.id).collect();
    assert_eq!(first, second);
    assert_eq!(
        first.iter().collect::<HashSet<_>>(),
        ids.iter().collect::<HashSet<_>>()
    );

    manager.accept_offer(accepter, ids[1]).await.unwrap();
    let remaining: Vec<Uuid> = manager.list_open_offers().await.unwrap().map(|o| o.id).collect();
    assert_eq!(remaining.len(), 2);
    assert!(!remaining.contains(&ids[1]));
}

#[tokio::test]
async fn direct_exchange_charges_the_fee() {
    let repo = Arc::new(MemoryRepository::new());
    let manager = manager(repo.clone());
    let user = funded(&repo, "USD", 100).await;

    let transaction = manager
        .execute_exchange(user, dec(100), "USD", "NGN")
        .await
        .unwrap()
        .confirmed()
        .unwrap();

    assert_eq!(transaction.fee, dec(1));
    assert_eq!(transaction.to_amount, dec(100) * transaction.rate - dec(1));
    assert_eq!(repo.balance_of(user, "USD").await, dec(0));
    assert_eq!(repo.balance_of(user, "NGN").await, transaction.to_amount);

    assert!(matches!(
        manager.execute_exchange(user, dec(50), "USD", "NGN").await,
        Err(ExchangeError::InsufficientFunds(ref c)) if c == "USD"
    ));
}
