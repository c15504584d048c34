use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub currency_code: String,
    pub balance: Decimal,
    pub is_active: bool,
    pub last_transaction_at: Option<DateTime<Utc>>,
}

impl Wallet {
    pub fn empty(user_id: Uuid, currency_code: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            currency_code: currency_code.to_string(),
            balance: Decimal::ZERO,
            is_active: true,
            last_transaction_at: None,
        }
    }

    pub fn covers(&self, amount: Decimal) -> bool {
        self.is_active && self.balance >= amount
    }
}
