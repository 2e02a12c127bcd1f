//! Token rotation engine.
//!
//! Access tokens are stateless: a valid signature is enough. Refresh and reset-password
//! tokens are backed by a row in `tokens` (keyed by the token hash) and the row is
//! authoritative.
//!
//! Refresh tokens form families. Login starts a family; every rotation revokes the presented
//! token and appends its successor (`parent_id` → `replaced_by_id`). Presenting an already
//! revoked refresh token is treated as theft and revokes the whole family.

use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::{PgConnection, PgPool};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        hashing::TokenHasher,
        jwt::{SignedToken, TokenSigner},
    },
    config::AuthConfig,
    db::{
        errors::DbError,
        handlers::{Tokens, Users},
        models::{
            tokens::{RevocationReason, Token, TokenCreateDBRequest, TokenType},
            users::User,
        },
    },
    errors::{Error, Result},
    types::{FamilyId, UserId, abbrev_uuid},
};

/// A freshly minted access/refresh pair
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Outcome of a rotation attempt inside a caller-owned transaction
#[derive(Debug)]
pub enum Rotation {
    Rotated(TokenPair),
    /// The token had already been used. Every live token of the family was revoked and the
    /// caller must commit before reporting the failure.
    ReuseDetected { family_id: FamilyId, revoked: u64 },
}

/// Identity carried by a validated token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedToken {
    pub user_id: UserId,
    pub email: String,
    pub token_type: TokenType,
}

pub struct TokenService {
    signer: TokenSigner,
    hasher: TokenHasher,
}

impl TokenService {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let pepper = config
            .token_pepper
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("auth.token_pepper is required")))?;

        Ok(Self {
            signer: TokenSigner::new(config)?,
            hasher: TokenHasher::new(pepper.as_bytes())?,
        })
    }

    pub fn hash(&self, raw_token: &str) -> String {
        self.hasher.hash(raw_token)
    }

    /// Sign an access token and a refresh token, persisting the refresh token in `family_id`.
    async fn mint_pair(
        &self,
        conn: &mut PgConnection,
        user: &User,
        family_id: FamilyId,
        parent_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(TokenPair, Token)> {
        let access = self.signer.sign(user.id, &user.email, TokenType::Access, now)?;
        let refresh = self.signer.sign(user.id, &user.email, TokenType::Refresh, now)?;

        let row = Tokens::new(conn)
            .create(&TokenCreateDBRequest {
                user_id: user.id,
                token_type: TokenType::Refresh,
                token_hash: self.hasher.hash(&refresh.token),
                family_id: Some(family_id),
                parent_id,
                expires_at: refresh.expires_at,
            })
            .await?;

        let pair = TokenPair {
            access_token: access.token,
            access_expires_at: access.expires_at,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.expires_at,
        };
        Ok((pair, row))
    }

    /// Start a new refresh-token family for a user (login).
    #[instrument(skip(self, conn), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn issue_initial(&self, conn: &mut PgConnection, user_id: UserId, now: DateTime<Utc>) -> Result<TokenPair> {
        let user = Users::new(conn).get_by_id(user_id).await?.ok_or(Error::UserNotFound)?;
        let family_id = Uuid::new_v4();
        let (pair, _) = self.mint_pair(conn, &user, family_id, None, now).await?;

        info!(family_id = %abbrev_uuid(&family_id), "Issued new token family");
        Ok(pair)
    }

    /// Validate a token of the expected type.
    ///
    /// Refresh and reset-password tokens must also have a live row (present, not revoked, not
    /// expired) in the store.
    #[instrument(skip(self, conn, raw_token), fields(token_type = %expected), err)]
    pub async fn validate(
        &self,
        conn: &mut PgConnection,
        raw_token: &str,
        expected: TokenType,
        now: DateTime<Utc>,
    ) -> Result<ValidatedToken> {
        let claims = self.signer.verify(raw_token, expected)?;
        let validated = ValidatedToken {
            user_id: claims.sub,
            email: claims.email,
            token_type: claims.token_type,
        };

        let store_error = match expected {
            TokenType::Access => return Ok(validated),
            TokenType::Refresh => Error::RefreshInvalid,
            TokenType::ResetPassword => Error::ResetTokenInvalid,
        };

        let row = Tokens::new(conn).get_by_hash(&self.hasher.hash(raw_token)).await?;
        match row {
            Some(row) if row.token_type == expected && row.user_id == validated.user_id && !row.is_revoked && !row.is_expired_at(now) => {
                Ok(validated)
            }
            _ => Err(store_error),
        }
    }

    /// Rotate a refresh token within the caller's transaction.
    ///
    /// The family lock is held for the rest of the transaction, so rotations within one family
    /// serialize: a replay waits for an in-flight sibling rotation and then revokes its
    /// successor too.
    #[instrument(skip(self, conn, raw_refresh), err)]
    pub async fn rotate_in(&self, conn: &mut PgConnection, raw_refresh: &str, now: DateTime<Utc>) -> Result<Rotation> {
        let hash = self.hasher.hash(raw_refresh);
        let family_id = Tokens::new(conn)
            .get_by_hash(&hash)
            .await?
            .filter(|t| t.token_type == TokenType::Refresh)
            .and_then(|t| t.family_id)
            .ok_or(Error::RefreshInvalid)?;

        Tokens::new(conn).lock_family(family_id).await?;

        // Re-read under the lock: the row may have been rotated while we waited
        let current = Tokens::new(conn)
            .get_refresh_by_hash_for_update(&hash)
            .await?
            .ok_or(Error::RefreshInvalid)?;

        if current.is_expired_at(now) {
            return Err(Error::RefreshInvalid);
        }

        if current.is_revoked {
            let revoked = Tokens::new(conn)
                .revoke_family(family_id, now, RevocationReason::ReuseDetected)
                .await?;
            counter!("loyalty_refresh_reuse_detected_total").increment(1);
            warn!(
                family_id = %abbrev_uuid(&family_id),
                user_id = %abbrev_uuid(&current.user_id),
                revoked,
                "Refresh token reuse detected, revoked token family"
            );
            return Ok(Rotation::ReuseDetected { family_id, revoked });
        }

        let user = Users::new(conn).get_by_id(current.user_id).await?.ok_or(Error::UserNotFound)?;
        let (pair, successor) = self.mint_pair(conn, &user, family_id, Some(current.id), now).await?;
        Tokens::new(conn).mark_rotated(current.id, successor.id, now).await?;

        Ok(Rotation::Rotated(pair))
    }

    /// Rotate a refresh token in its own transaction.
    ///
    /// On reuse the family revocation is committed before `RefreshReuseDetected` is returned.
    #[instrument(skip(self, pool, raw_refresh), err)]
    pub async fn rotate(&self, pool: &PgPool, raw_refresh: &str, now: DateTime<Utc>) -> Result<TokenPair> {
        let mut tx = pool.begin().await.map_err(DbError::from)?;
        let rotation = self.rotate_in(&mut tx, raw_refresh, now).await?;
        tx.commit().await.map_err(DbError::from)?;

        match rotation {
            Rotation::Rotated(pair) => Ok(pair),
            Rotation::ReuseDetected { .. } => Err(Error::RefreshReuseDetected),
        }
    }

    /// Revoke a live token (logout).
    #[instrument(skip(self, conn, raw_token), err)]
    pub async fn revoke_token(&self, conn: &mut PgConnection, raw_token: &str, now: DateTime<Utc>) -> Result<()> {
        let revoked = Tokens::new(conn)
            .revoke_live_by_hash(&self.hasher.hash(raw_token), now, RevocationReason::Logout)
            .await?;

        match revoked {
            Some(token) => {
                info!(user_id = %abbrev_uuid(&token.user_id), token_type = %token.token_type, "Token revoked");
                Ok(())
            }
            None => Err(Error::RefreshInvalid),
        }
    }

    /// Mint a single-use reset-password token and store its hash. Delivering it is the caller's job.
    #[instrument(skip(self, conn), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn create_reset_password_token(&self, conn: &mut PgConnection, user_id: UserId, now: DateTime<Utc>) -> Result<SignedToken> {
        let user = Users::new(conn).get_by_id(user_id).await?.ok_or(Error::UserNotFound)?;
        let signed = self.signer.sign(user.id, &user.email, TokenType::ResetPassword, now)?;

        Tokens::new(conn)
            .create(&TokenCreateDBRequest {
                user_id: user.id,
                token_type: TokenType::ResetPassword,
                token_hash: self.hasher.hash(&signed.token),
                family_id: None,
                parent_id: None,
                expires_at: signed.expires_at,
            })
            .await?;

        Ok(signed)
    }

    /// Consume a reset-password token. Succeeds at most once per token.
    #[instrument(skip(self, conn, raw_token), err)]
    pub async fn validate_and_revoke_reset_password_token(
        &self,
        conn: &mut PgConnection,
        raw_token: &str,
        now: DateTime<Utc>,
    ) -> Result<ValidatedToken> {
        let claims = self
            .signer
            .verify(raw_token, TokenType::ResetPassword)
            .map_err(|_| Error::ResetTokenInvalid)?;

        let consumed = Tokens::new(conn)
            .consume_reset_token(&self.hasher.hash(raw_token), now)
            .await?
            .ok_or(Error::ResetTokenInvalid)?;

        if consumed.user_id != claims.sub {
            return Err(Error::ResetTokenInvalid);
        }

        Ok(ValidatedToken {
            user_id: claims.sub,
            email: claims.email,
            token_type: TokenType::ResetPassword,
        })
    }
}
