//! Database models for reward vouchers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{UserId, VoucherId};

/// Voucher redemption status stored as TEXT in database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum VoucherStatus {
    Active,
    Used,
}

/// Database entity model
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Voucher {
    pub id: VoucherId,
    pub user_id: Option<UserId>,
    pub qr_code: String,
    pub storage_path: String,
    pub is_assigned: bool,
    pub assigned_date: Option<DateTime<Utc>>,
    pub status: VoucherStatus,
    pub used_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Stock-loading request. Loading itself happens outside this crate; this is used by seeding and tests.
#[derive(Debug, Clone)]
pub struct VoucherCreateDBRequest {
    pub qr_code: String,
    pub storage_path: String,
}
