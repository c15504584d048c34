use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::currency::Currency;
use super::offer::{NewOffer, P2POffer};
use super::tx::Transaction;
use super::utils::normalize_code;
use super::wallet::Wallet;
use super::ExchangeBackend;
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::calculator::Quote;

// Database repository
#[derive(Clone)]
pub struct PgRepository {
    pub(super) pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_currencies(&self) -> ExchangeResult<Vec<Currency>> {
        let currencies = sqlx::query_as::<_, Currency>(
            r#"
            SELECT code, name, symbol, country_code, flag, is_active
            FROM currencies
            ORDER BY position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(currencies)
    }
}

async fn credit(
    conn: &mut PgConnection,
    user_id: Uuid,
    currency: &str,
    amount: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO wallets (id, user_id, currency_code, balance, last_transaction_at)
        VALUES ($1, $2, $3, $4, now())
        ON CONFLICT (user_id, currency_code)
        DO UPDATE SET balance = wallets.balance + EXCLUDED.balance, last_transaction_at = now()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(currency)
    .bind(amount)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// conditional debit, never drives a balance below zero
async fn debit(
    conn: &mut PgConnection,
    user_id: Uuid,
    currency: &str,
    amount: Decimal,
) -> ExchangeResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE wallets SET balance = balance - $3, last_transaction_at = now()
        WHERE user_id = $1 AND currency_code = $2 AND is_active AND balance >= $3
        "#,
    )
    .bind(user_id)
    .bind(currency)
    .bind(amount)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ExchangeError::InsufficientFunds(currency.to_string()));
    }
    Ok(())
}

// false when a transaction with the same id is already recorded
async fn insert_transaction(
    conn: &mut PgConnection,
    transaction: &Transaction,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO transactions (id, user_id, transaction_type, from_currency, to_currency,
            from_amount, to_amount, rate, fee, status, reference, offer_id, counterparty_id,
            created_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(transaction.id)
    .bind(transaction.user_id)
    .bind(transaction.transaction_type)
    .bind(&transaction.from_currency)
    .bind(&transaction.to_currency)
    .bind(transaction.from_amount)
    .bind(transaction.to_amount)
    .bind(transaction.rate)
    .bind(transaction.fee)
    .bind(transaction.status)
    .bind(&transaction.reference)
    .bind(transaction.offer_id)
    .bind(transaction.counterparty_id)
    .bind(transaction.created_at)
    .bind(transaction.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn find_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<Option<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1")
        .bind(transaction_id)
        .fetch_optional(&mut *conn)
        .await
}

async fn find_offer(conn: &mut PgConnection, offer_id: Uuid) -> Result<Option<P2POffer>, sqlx::Error> {
    sqlx::query_as::<_, P2POffer>("SELECT * FROM p2p_offers WHERE id = $1")
        .bind(offer_id)
        .fetch_optional(&mut *conn)
        .await
}

#[async_trait]
impl ExchangeBackend for PgRepository {
    async fn wallet(&self, user_id: Uuid, currency: &str) -> ExchangeResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>(
            "SELECT * FROM wallets WHERE user_id = $1 AND currency_code = $2",
        )
        .bind(user_id)
        .bind(normalize_code(currency))
        .fetch_optional(&self.pool)
        .await?;
        Ok(wallet)
    }

    async fn wallets(&self, user_id: Uuid) -> ExchangeResult<Vec<Wallet>> {
        let wallets = sqlx::query_as::<_, Wallet>(
            "SELECT * FROM wallets WHERE user_id = $1 ORDER BY currency_code",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(wallets)
    }

    async fn deposit(
        &self,
        user_id: Uuid,
        currency: &str,
        amount: Decimal,
    ) -> ExchangeResult<Transaction> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidAmount);
        }
        let currency = normalize_code(currency);
        let transaction = Transaction::deposit(user_id, &currency, amount);

        let mut tx = self.pool.begin().await?;
        credit(&mut tx, user_id, &currency, amount).await?;
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;

        tracing::info!("Deposited {amount} {currency} for user: {user_id}");
        Ok(transaction)
    }

    async fn insert_offer(&self, offer: &NewOffer) -> ExchangeResult<P2POffer> {
        let stored = P2POffer::from_new(offer);

        // Begin a database transaction, escrow and insert commit together
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query_as::<_, P2POffer>(
            r#"
            INSERT INTO p2p_offers (id, user_id, from_currency, to_currency, from_amount,
                to_amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(stored.id)
        .bind(stored.user_id)
        .bind(&stored.from_currency)
        .bind(&stored.to_currency)
        .bind(stored.from_amount)
        .bind(stored.to_amount)
        .bind(stored.status)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(inserted) = inserted else {
            return match find_offer(&mut tx, offer.id).await? {
                Some(existing) if existing.created_by(offer) => {
                    tracing::info!("Offer {} was already stored, escrow untouched", offer.id);
                    Ok(existing)
                }
                _ => Err(ExchangeError::Validation(format!(
                    "Offer id {} is already in use",
                    offer.id
                ))),
            };
        };
        debit(&mut tx, offer.creator_id, &offer.from_currency, offer.from_amount).await?;
        tx.commit().await?;

        Ok(inserted)
    }

    async fn offer(&self, offer_id: Uuid) -> ExchangeResult<Option<P2POffer>> {
        let mut conn = self.pool.acquire().await?;
        Ok(find_offer(&mut conn, offer_id).await?)
    }

    async fn open_offers(&self) -> ExchangeResult<Vec<P2POffer>> {
        let offers = sqlx::query_as::<_, P2POffer>(
            "SELECT * FROM p2p_offers WHERE status = 'open' ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(offers)
    }

    async fn settle_offer(
        &self,
        offer_id: Uuid,
        accepter_id: Uuid,
    ) -> ExchangeResult<Transaction> {
        let mut tx = self.pool.begin().await?;

        // the conditional update is the serialization point for racing accepts
        let matched = sqlx::query_as::<_, P2POffer>(
            r#"
            UPDATE p2p_offers SET status = 'matched', matched_by = $2, updated_at = now()
            WHERE id = $1 AND status = 'open' AND user_id <> $2
            RETURNING *
            "#,
        )
        .bind(offer_id)
        .bind(accepter_id)
        .fetch_optional(&mut *tx)
        .await?;

        let offer = match matched {
            Some(offer) => offer,
            None => {
                return Err(match find_offer(&mut tx, offer_id).await? {
                    None => ExchangeError::NotFound(format!("Offer {offer_id}")),
                    Some(offer) if offer.is_open() => ExchangeError::NotAuthorized,
                    Some(_) => ExchangeError::OfferNotOpen,
                });
            }
        };

        let transaction = Transaction::settlement(&offer, accepter_id);
        // any early return drops `tx` and rolls the whole settlement back
        debit(&mut tx, accepter_id, &offer.to_currency, offer.to_amount).await?;
        credit(&mut tx, offer.user_id, &offer.to_currency, offer.to_amount).await?;
        credit(&mut tx, accepter_id, &offer.from_currency, offer.from_amount).await?;
        insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;

        Ok(transaction)
    }

    async fn cancel_offer(&self, offer_id: Uuid, requester_id: Uuid) -> ExchangeResult<P2POffer> {
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query_as::<_, P2POffer>(
            r#"
            UPDATE p2p_offers SET status = 'cancelled', updated_at = now()
            WHERE id = $1 AND user_id = $2 AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(offer_id)
        .bind(requester_id)
        .fetch_optional(&mut *tx)
        .await?;

        let offer = match cancelled {
            Some(offer) => offer,
            None => {
                return Err(match find_offer(&mut tx, offer_id).await? {
                    None => ExchangeError::NotFound(format!("Offer {offer_id}")),
                    Some(offer) if offer.user_id != requester_id => ExchangeError::NotAuthorized,
                    Some(_) => ExchangeError::OfferNotOpen,
                });
            }
        };

        credit(&mut tx, offer.user_id, &offer.from_currency, offer.from_amount).await?;
        tx.commit().await?;

        Ok(offer)
    }

    async fn execute_exchange(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        quote: &Quote,
    ) -> ExchangeResult<Transaction> {
        let transaction = Transaction::exchange(transaction_id, user_id, quote);

        let mut tx = self.pool.begin().await?;
        if !insert_transaction(&mut tx, &transaction).await? {
            return match find_transaction(&mut tx, transaction_id).await? {
                Some(existing) if existing.user_id == user_id => Ok(existing),
                _ => Err(ExchangeError::Validation(format!(
                    "Transaction id {transaction_id} is already in use"
                ))),
            };
        }
        debit(&mut tx, user_id, &quote.from_currency, quote.from_amount).await?;
        credit(&mut tx, user_id, &quote.to_currency, quote.total).await?;
        tx.commit().await?;

        Ok(transaction)
    }

    async fn transactions(&self, user_id: Uuid) -> ExchangeResult<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT * FROM transactions
            WHERE user_id = $1 OR counterparty_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(transactions)
    }

    async fn submit_kyc(&self, user_id: Uuid, document: &serde_json::Value) -> ExchangeResult<()> {
        sqlx::query("INSERT INTO kyc_submissions (user_id, document) VALUES ($1, $2)")
            .bind(user_id)
            .bind(document)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_profile(&self, user_id: Uuid, full_name: &str) -> ExchangeResult<()> {
        let result =
            sqlx::query("UPDATE users SET full_name = $2, updated_at = now() WHERE id = $1")
                .bind(user_id)
                .bind(full_name)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(ExchangeError::NotFound(format!("User {user_id}")));
        }
        Ok(())
    }
}
