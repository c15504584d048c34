use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exchange::calculator::Quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineActionType {
    Exchange,
    Transaction,
    KycUpdate,
    ProfileUpdate,
}

/// A mutating call captured while the backend could not be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActionPayload {
    // ids are chosen before the first attempt so a replay of a request the
    // backend already committed is recognised instead of applied twice
    CreateOffer {
        offer_id: Uuid,
        creator_id: Uuid,
        from_currency: String,
        from_amount: Decimal,
        to_currency: String,
        to_amount: Decimal,
    },
    AcceptOffer {
        accepter_id: Uuid,
        offer_id: Uuid,
    },
    CancelOffer {
        requester_id: Uuid,
        offer_id: Uuid,
    },
    // quote captured when the action was queued
    ExecuteExchange {
        transaction_id: Uuid,
        user_id: Uuid,
        quote: Quote,
    },
    KycUpdate {
        user_id: Uuid,
        document: serde_json::Value,
    },
    ProfileUpdate {
        user_id: Uuid,
        full_name: String,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> OfflineActionType {
        match self {
            ActionPayload::ExecuteExchange { .. } => OfflineActionType::Exchange,
            ActionPayload::CreateOffer { .. }
            | ActionPayload::AcceptOffer { .. }
            | ActionPayload::CancelOffer { .. } => OfflineActionType::Transaction,
            ActionPayload::KycUpdate { .. } => OfflineActionType::KycUpdate,
            ActionPayload::ProfileUpdate { .. } => OfflineActionType::ProfileUpdate,
        }
    }
}

/// Tentative balance change shown to the user while its action waits in the
/// queue. It lives and dies with the action, so whichever flush resolves the
/// action also resolves the hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    pub user_id: Uuid,
    pub currency: String,
    pub delta: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub action_type: OfflineActionType,
    pub payload: ActionPayload,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holds: Vec<Hold>,
}

impl OfflineAction {
    pub fn new(payload: ActionPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type: payload.action_type(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            holds: Vec::new(),
        }
    }

    pub fn with_holds(mut self, holds: Vec<Hold>) -> Self {
        self.holds = holds;
        self
    }

    /// Sum of this action's holds on one wallet.
    pub fn held(&self, user_id: Uuid, currency: &str) -> Decimal {
        self.holds
            .iter()
            .filter(|hold| hold.user_id == user_id && hold.currency == currency)
            .map(|hold| hold.delta)
            .sum()
    }
}
