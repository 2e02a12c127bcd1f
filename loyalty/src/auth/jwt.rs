//! JWT creation and verification for access, refresh and reset-password tokens.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::AuthConfig,
    db::models::tokens::TokenType,
    errors::{Error, TokenRejection},
    types::UserId,
};

/// JWT claims shared by every token type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub email: String,
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
    /// Random per token, so two tokens minted in the same second never share a hash
    pub jti: Uuid,
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Signs and verifies tokens. Reset-password tokens use their own secret.
pub struct TokenSigner {
    session_keys: KeyPair,
    reset_keys: KeyPair,
    access_ttl: Duration,
    refresh_ttl: Duration,
    reset_ttl: Duration,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, Error> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Other(anyhow::anyhow!("{name} is required")))
}

fn to_chrono(duration: std::time::Duration) -> Result<Duration, Error> {
    Duration::from_std(duration).map_err(|e| Error::Other(anyhow::anyhow!("token lifetime out of range: {e}")))
}

impl TokenSigner {
    pub fn new(config: &AuthConfig) -> Result<Self, Error> {
        Ok(Self {
            session_keys: KeyPair::from_secret(required(&config.jwt_secret, "auth.jwt_secret")?),
            reset_keys: KeyPair::from_secret(required(&config.reset_password_secret, "auth.reset_password_secret")?),
            access_ttl: to_chrono(config.access_token_ttl)?,
            refresh_ttl: to_chrono(config.refresh_token_ttl)?,
            reset_ttl: to_chrono(config.reset_password_token_ttl)?,
        })
    }

    fn keys(&self, token_type: TokenType) -> &KeyPair {
        match token_type {
            TokenType::Access | TokenType::Refresh => &self.session_keys,
            TokenType::ResetPassword => &self.reset_keys,
        }
    }

    pub fn ttl(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
            TokenType::ResetPassword => self.reset_ttl,
        }
    }

    pub fn sign(&self, user_id: UserId, email: &str, token_type: TokenType, now: DateTime<Utc>) -> Result<SignedToken, Error> {
        let expires_at = now + self.ttl(token_type);
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            token_type,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4(),
        };

        let token = encode(&Header::default(), &claims, &self.keys(token_type).encoding)
            .map_err(|e| Error::Other(anyhow::anyhow!("create JWT: {e}")))?;

        Ok(SignedToken { token, expires_at })
    }

    /// Check signature, expiry and type. No store lookup happens here.
    pub fn verify(&self, token: &str, expected: TokenType) -> Result<Claims, Error> {
        let mut validation = Validation::default();
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.keys(expected).decoding, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => Error::InvalidToken {
                reason: TokenRejection::Expired,
            },
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::ImmatureSignature
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_)
            | ErrorKind::InvalidAlgorithm => Error::InvalidToken {
                reason: TokenRejection::InvalidSignature,
            },
            _ => Error::Other(anyhow::anyhow!("JWT verification: {e}")),
        })?;

        if data.claims.token_type != expected {
            return Err(Error::InvalidToken {
                reason: TokenRejection::WrongType,
            });
        }

        Ok(data.claims)
    }
}
