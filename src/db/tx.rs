use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::offer::P2POffer;
use super::utils::reference;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub from_currency: String,
    pub to_currency: String,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
    pub rate: Decimal,
    pub fee: Decimal,
    pub status: TransactionStatus,
    pub reference: String,
    pub offer_id: Option<Uuid>,
    pub counterparty_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Exchange,
    Deposit,
    Withdrawal,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl Transaction {
    /// Settlement of a matched offer, seen from the accepter's side: they pay
    /// the offer's `to_amount` and receive its `from_amount`.
    pub fn settlement(offer: &P2POffer, accepter_id: Uuid) -> Self {
        let now = Utc::now();
        let rate = if offer.to_amount.is_zero() {
            Decimal::ZERO
        } else {
            offer.from_amount / offer.to_amount
        };
        Self {
            id: Uuid::new_v4(),
            user_id: accepter_id,
            transaction_type: TransactionType::Exchange,
            from_currency: offer.to_currency.clone(),
            to_currency: offer.from_currency.clone(),
            from_amount: offer.to_amount,
            to_amount: offer.from_amount,
            rate,
            fee: Decimal::ZERO,
            status: TransactionStatus::Completed,
            reference: reference("P2P"),
            offer_id: Some(offer.id),
            counterparty_id: Some(offer.user_id),
            created_at: now,
            completed_at: Some(now),
        }
    }

    pub fn deposit(user_id: Uuid, currency: &str, amount: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            transaction_type: TransactionType::Deposit,
            from_currency: currency.to_string(),
            to_currency: currency.to_string(),
            from_amount: amount,
            to_amount: amount,
            rate: Decimal::ONE,
            fee: Decimal::ZERO,
            status: TransactionStatus::Completed,
            reference: reference("DEP"),
            offer_id: None,
            counterparty_id: None,
            created_at: now,
            completed_at: Some(now),
        }
    }

    pub fn exchange(id: Uuid, user_id: Uuid, quote: &crate::exchange::calculator::Quote) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            transaction_type: TransactionType::Exchange,
            from_currency: quote.from_currency.clone(),
            to_currency: quote.to_currency.clone(),
            from_amount: quote.from_amount,
            to_amount: quote.total,
            rate: quote.rate,
            fee: quote.fee,
            status: TransactionStatus::Completed,
            reference: reference("EXC"),
            offer_id: None,
            counterparty_id: None,
            created_at: now,
            completed_at: Some(now),
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.user_id == user_id || self.counterparty_id == Some(user_id)
    }
}
