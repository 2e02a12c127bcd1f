//! Database models for payment proofs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;

use crate::types::{ProofId, UserId};

/// A recorded payment proof. Rows are never updated once inserted.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Proof {
    pub id: ProofId,
    pub user_id: UserId,
    pub provider_payment_id: String,
    pub approved_at: DateTime<Utc>,
    pub operation_type: String,
    pub status: String,
    pub amount: Decimal,
    pub dni: Option<String>,
    pub card_last4: Option<String>,
    pub card_type: Option<String>,
    pub payment_method_id: Option<String>,
    pub external_order_id: Option<String>,
    pub product_name: Option<String>,
    pub proof_date: DateTime<Utc>,
}

/// Provider-side facts about a payment, copied onto the proof row
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentFacts {
    pub approved_at: DateTime<Utc>,
    pub operation_type: String,
    pub status: String,
    pub amount: Decimal,
    pub dni: Option<String>,
    pub card_last4: Option<String>,
    pub card_type: Option<String>,
    pub payment_method_id: Option<String>,
    pub external_order_id: Option<String>,
    pub product_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProofCreateDBRequest {
    pub user_id: UserId,
    pub provider_payment_id: String,
    pub facts: PaymentFacts,
    pub proof_date: DateTime<Utc>,
}
