//! Database models for persisted credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{FamilyId, TokenId, UserId};

/// Token kind, stored as TEXT and carried in the `token_type` JWT claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum TokenType {
    Access,
    Refresh,
    ResetPassword,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::ResetPassword => "resetPassword",
        }
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a token row was revoked, stored in `revoked_reason`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    /// Consumed by a successful rotation
    Rotated,
    /// Family killed after a dead refresh token was presented again
    ReuseDetected,
    /// Explicit revocation (logout)
    Logout,
    /// Single-use reset token consumed
    ResetUsed,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Rotated => "rotated",
            RevocationReason::ReuseDetected => "reuse_detected",
            RevocationReason::Logout => "logout",
            RevocationReason::ResetUsed => "reset_used",
        }
    }
}

/// Database entity model
#[derive(Debug, Clone, FromRow)]
pub struct Token {
    pub id: TokenId,
    pub user_id: UserId,
    pub token_type: TokenType,
    pub token_hash: String,
    pub family_id: Option<FamilyId>,
    pub parent_id: Option<TokenId>,
    pub replaced_by_id: Option<TokenId>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub is_revoked: bool,
    pub revoked_date: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Request for persisting a newly minted token
#[derive(Debug, Clone)]
pub struct TokenCreateDBRequest {
    pub user_id: UserId,
    pub token_type: TokenType,
    pub token_hash: String,
    pub family_id: Option<FamilyId>,
    pub parent_id: Option<TokenId>,
    pub expires_at: DateTime<Utc>,
}
