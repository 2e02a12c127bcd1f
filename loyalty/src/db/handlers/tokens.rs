//! Database repository for persisted credentials (the credential store).

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{
        errors::Result,
        models::tokens::{RevocationReason, Token, TokenCreateDBRequest, TokenType},
    },
    types::{FamilyId, TokenId, abbrev_uuid},
};

pub struct Tokens<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Tokens<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), token_type = %request.token_type), err)]
    pub async fn create(&mut self, request: &TokenCreateDBRequest) -> Result<Token> {
        let token = sqlx::query_as::<_, Token>(
            r#"
            INSERT INTO tokens (user_id, token_type, token_hash, family_id, parent_id, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(request.user_id)
        .bind(request.token_type)
        .bind(&request.token_hash)
        .bind(request.family_id)
        .bind(request.parent_id)
        .bind(request.expires_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(token)
    }

    #[instrument(skip(self, token_hash), err)]
    pub async fn get_by_hash(&mut self, token_hash: &str) -> Result<Option<Token>> {
        let token = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(token)
    }

    /// Lock-read a refresh token row by hash. Must run inside a transaction; the row lock is held
    /// until that transaction ends.
    #[instrument(skip(self, token_hash), err)]
    pub async fn get_refresh_by_hash_for_update(&mut self, token_hash: &str) -> Result<Option<Token>> {
        let token = sqlx::query_as::<_, Token>(
            r#"
            SELECT * FROM tokens
            WHERE token_hash = $1 AND token_type = $2
            FOR UPDATE
            "#,
        )
        .bind(token_hash)
        .bind(TokenType::Refresh)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(token)
    }

    /// Take the family's transaction-scoped advisory lock. Every rotation and reuse revocation
    /// of the family holds it, so a revocation always sees successors minted before it.
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&family_id)), err)]
    pub async fn lock_family(&mut self, family_id: FamilyId) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(family_id)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }

    /// Revoke every live refresh token in a family. Returns how many rows were revoked.
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&family_id)), err)]
    pub async fn revoke_family(&mut self, family_id: FamilyId, now: DateTime<Utc>, reason: RevocationReason) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tokens
            SET is_revoked = TRUE, revoked_date = $2, revoked_reason = $3
            WHERE family_id = $1 AND token_type = $4 AND is_revoked = FALSE
            "#,
        )
        .bind(family_id)
        .bind(now)
        .bind(reason.as_str())
        .bind(TokenType::Refresh)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Close out a rotated token: revoked, consumed, and linked to its successor.
    #[instrument(skip(self), fields(token_id = %abbrev_uuid(&token_id), replaced_by = %abbrev_uuid(&replaced_by)), err)]
    pub async fn mark_rotated(&mut self, token_id: TokenId, replaced_by: TokenId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tokens
            SET is_revoked = TRUE, revoked_date = $3, revoked_reason = $4, used_at = $3, replaced_by_id = $2
            WHERE id = $1
            "#,
        )
        .bind(token_id)
        .bind(replaced_by)
        .bind(now)
        .bind(RevocationReason::Rotated.as_str())
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Revoke a token only if it is currently live (not revoked, not expired).
    /// Returns `None` when no live row matched.
    #[instrument(skip(self, token_hash), err)]
    pub async fn revoke_live_by_hash(&mut self, token_hash: &str, now: DateTime<Utc>, reason: RevocationReason) -> Result<Option<Token>> {
        let token = sqlx::query_as::<_, Token>(
            r#"
            UPDATE tokens
            SET is_revoked = TRUE, revoked_date = $2, revoked_reason = $3
            WHERE token_hash = $1 AND is_revoked = FALSE AND expires_at > $2
            RETURNING *
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .bind(reason.as_str())
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(token)
    }

    /// Single-use consumption of a reset-password token: matched and revoked in one statement,
    /// so two concurrent callers cannot both succeed.
    #[instrument(skip(self, token_hash), err)]
    pub async fn consume_reset_token(&mut self, token_hash: &str, now: DateTime<Utc>) -> Result<Option<Token>> {
        let token = sqlx::query_as::<_, Token>(
            r#"
            UPDATE tokens
            SET is_revoked = TRUE, revoked_date = $3, revoked_reason = $4, used_at = $3
            WHERE token_hash = $1 AND token_type = $2 AND is_revoked = FALSE AND expires_at > $3
            RETURNING *
            "#,
        )
        .bind(token_hash)
        .bind(TokenType::ResetPassword)
        .bind(now)
        .bind(RevocationReason::ResetUsed.as_str())
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(token)
    }

    /// All tokens of a family, oldest first
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&family_id)), err)]
    pub async fn list_family(&mut self, family_id: FamilyId) -> Result<Vec<Token>> {
        let tokens = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE family_id = $1 ORDER BY created_at ASC, id ASC")
            .bind(family_id)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(tokens)
    }
}
