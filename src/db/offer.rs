use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "offer_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Open,
    Matched,
    Cancelled,
}

impl OfferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OfferStatus::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct P2POffer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub from_currency: String,
    pub to_currency: String,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
    pub status: OfferStatus,
    pub matched_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl P2POffer {
    pub fn from_new(offer: &NewOffer) -> Self {
        let now = Utc::now();
        Self {
            id: offer.id,
            user_id: offer.creator_id,
            from_currency: offer.from_currency.clone(),
            to_currency: offer.to_currency.clone(),
            from_amount: offer.from_amount,
            to_amount: offer.to_amount,
            status: OfferStatus::Open,
            matched_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    // user-declared, never checked against the market rate
    pub fn implied_rate(&self) -> Decimal {
        if self.from_amount.is_zero() {
            return Decimal::ZERO;
        }
        self.to_amount / self.from_amount
    }

    pub fn is_open(&self) -> bool {
        self.status == OfferStatus::Open
    }

    /// True when `offer` is a resend of the request that created this row.
    pub fn created_by(&self, offer: &NewOffer) -> bool {
        self.id == offer.id
            && self.user_id == offer.creator_id
            && self.from_currency == offer.from_currency
            && self.to_currency == offer.to_currency
            && self.from_amount == offer.from_amount
            && self.to_amount == offer.to_amount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOffer {
    // chosen by the caller, so a resent request is recognised
    pub id: Uuid,
    pub creator_id: Uuid,
    pub from_currency: String,
    pub from_amount: Decimal,
    pub to_currency: String,
    pub to_amount: Decimal,
}

/// Offer as shown to users, with the implied rate spelled out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferView {
    #[serde(flatten)]
    pub offer: P2POffer,
    pub implied_rate: Decimal,
}

impl From<P2POffer> for OfferView {
    fn from(offer: P2POffer) -> Self {
        let implied_rate = offer.implied_rate();
        Self {
            offer,
            implied_rate,
        }
    }
}
