//! # loyalty: rewards core for a coffee-shop loyalty programme
//!
//! Members earn a stamp for every approved payment they prove, and a voucher redeemable at the
//! vending machine once they collect enough stamps. This crate holds the parts of that system
//! with real invariants:
//!
//! - **Sessions** ([`auth`]): access/refresh/reset-password tokens. Refresh tokens rotate on
//!   every use and form a family per login; replaying a spent refresh token revokes the whole
//!   family.
//! - **Rewards** ([`rewards`]): recording a proof, incrementing the stamp counter and, at the
//!   threshold, allocating a voucher happen in one transaction. Voucher allocation uses
//!   `FOR UPDATE SKIP LOCKED` so concurrent members never wait on or share a voucher.
//! - **Reconciliation** ([`matcher`], [`intake`]): a member who lacks the provider's payment id
//!   describes the receipt instead, and the matcher accepts a single unambiguous candidate.
//! - **Usage tracking** ([`rewards::usage_check`]): a background job asks the vending API which
//!   assigned vouchers were redeemed.
//!
//! HTTP routing sits outside this crate. [`Loyalty`] is the surface it calls: every operation
//! takes a [`CancellationToken`], and cancelling drops the in-flight transaction, which rolls it
//! back.
//!
//! ## Database
//!
//! PostgreSQL through `sqlx`. Migrations live in `migrations/` and are embedded:
//!
//! ```ignore
//! loyalty::migrator().run(&pool).await?;
//! ```

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod intake;
pub mod matcher;
pub mod payment_providers;
pub mod rewards;
pub mod telemetry;
pub mod types;
pub mod vending;

#[cfg(test)]
mod test_utils;

use std::{future::Future, sync::Arc};

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{TokenPair, TokenService, ValidatedToken, jwt::SignedToken},
    config::VoucherCheckConfig,
    db::{
        errors::DbError,
        handlers::ProofFilter,
        models::{
            proofs::{PaymentFacts, Proof},
            tokens::TokenType,
            vouchers::Voucher,
        },
    },
    errors::{Error, Result},
    intake::ProofIntake,
    matcher::{MatchOutcome, MatchSettings, PaymentClaim, PaymentMatcher},
    payment_providers::{PaymentProvider, mercadopago::MercadoPagoProvider},
    rewards::{LedgerEntry, ProofPage, RewardLedger, UsageCheckSummary, VoucherAllocator, VoucherUsageJob, VoucherView},
    types::{ProofId, UserId, VoucherId},
    vending::{CoffeejiClient, OrderLookup, VoucherVerifier},
};

pub use config::Config;

/// Get the loyalty database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// The boundary operations, wired to one database pool and the external APIs
pub struct Loyalty {
    pool: PgPool,
    tokens: TokenService,
    intake: ProofIntake,
    verifier: Arc<dyn VoucherVerifier>,
    voucher_check: VoucherCheckConfig,
}

impl Loyalty {
    /// Build against the real payment provider and vending API
    pub fn new(pool: PgPool, config: &Config) -> Result<Self> {
        let provider: Arc<dyn PaymentProvider> = Arc::new(MercadoPagoProvider::new(&config.mercadopago)?);
        let vending = Arc::new(CoffeejiClient::new(&config.coffeeji)?);

        Self::with_services(pool, config, provider, vending.clone(), vending)
    }

    /// Build with caller-supplied provider and vending implementations
    pub fn with_services(
        pool: PgPool,
        config: &Config,
        provider: Arc<dyn PaymentProvider>,
        orders: Arc<dyn OrderLookup>,
        verifier: Arc<dyn VoucherVerifier>,
    ) -> Result<Self> {
        let matcher = PaymentMatcher::new(provider.clone(), MatchSettings::new(&config.matcher)?);
        let ledger = RewardLedger::new(
            VoucherAllocator::new(config.rewards.voucher_bucket_url.clone()),
            config.rewards.stamp_threshold,
        );

        Ok(Self {
            pool,
            tokens: TokenService::new(&config.auth)?,
            intake: ProofIntake::new(provider, matcher, orders, ledger),
            verifier,
            voucher_check: config.voucher_check.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The periodic usage check, sharing this instance's pool and verifier
    pub fn usage_job(&self) -> VoucherUsageJob {
        VoucherUsageJob::new(self.pool.clone(), self.verifier.clone(), self.voucher_check.clone())
    }

    fn allocator(&self) -> &VoucherAllocator {
        self.intake.ledger().allocator()
    }

    // Sessions

    pub async fn issue_initial(&self, cancel: &CancellationToken, user_id: UserId) -> Result<TokenPair> {
        cancellable(cancel, async {
            let mut tx = self.pool.begin().await.map_err(DbError::from)?;
            let pair = self.tokens.issue_initial(&mut tx, user_id, Utc::now()).await?;
            tx.commit().await.map_err(DbError::from)?;
            Ok(pair)
        })
        .await
    }

    pub async fn validate(&self, cancel: &CancellationToken, raw_token: &str, expected: TokenType) -> Result<ValidatedToken> {
        cancellable(cancel, async {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            self.tokens.validate(&mut conn, raw_token, expected, Utc::now()).await
        })
        .await
    }

    pub async fn rotate(&self, cancel: &CancellationToken, raw_refresh: &str) -> Result<TokenPair> {
        cancellable(cancel, self.tokens.rotate(&self.pool, raw_refresh, Utc::now())).await
    }

    pub async fn revoke_token(&self, cancel: &CancellationToken, raw_token: &str) -> Result<()> {
        cancellable(cancel, async {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            self.tokens.revoke_token(&mut conn, raw_token, Utc::now()).await
        })
        .await
    }

    pub async fn create_reset_password_token(&self, cancel: &CancellationToken, user_id: UserId) -> Result<SignedToken> {
        cancellable(cancel, async {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            self.tokens.create_reset_password_token(&mut conn, user_id, Utc::now()).await
        })
        .await
    }

    pub async fn validate_and_revoke_reset_password_token(&self, cancel: &CancellationToken, raw_token: &str) -> Result<ValidatedToken> {
        cancellable(cancel, async {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            self.tokens
                .validate_and_revoke_reset_password_token(&mut conn, raw_token, Utc::now())
                .await
        })
        .await
    }

    // Proofs and rewards

    /// Record a proof whose payment facts were already verified by the caller
    pub async fn create_proof(
        &self,
        cancel: &CancellationToken,
        user_id: UserId,
        provider_payment_id: &str,
        facts: PaymentFacts,
    ) -> Result<LedgerEntry> {
        cancellable(
            cancel,
            self.intake.ledger().create(&self.pool, user_id, provider_payment_id, facts, Utc::now()),
        )
        .await
    }

    pub async fn submit_proof_by_payment_id(&self, cancel: &CancellationToken, user_id: UserId, payment_id: &str) -> Result<LedgerEntry> {
        cancellable(cancel, self.intake.submit_by_payment_id(&self.pool, user_id, payment_id)).await
    }

    pub async fn submit_proof_by_details(&self, cancel: &CancellationToken, user_id: UserId, claim: &PaymentClaim) -> Result<LedgerEntry> {
        cancellable(cancel, self.intake.submit_by_details(&self.pool, user_id, claim)).await
    }

    /// A page of the member's proof history, newest first
    pub async fn list_proofs(&self, cancel: &CancellationToken, filter: &ProofFilter) -> Result<ProofPage> {
        cancellable(cancel, async {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            self.intake.ledger().list_proofs(&mut conn, filter).await
        })
        .await
    }

    pub async fn get_proof(&self, cancel: &CancellationToken, user_id: UserId, proof_id: ProofId) -> Result<Proof> {
        cancellable(cancel, async {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            self.intake.ledger().get_proof(&mut conn, user_id, proof_id).await
        })
        .await
    }

    /// Allocate one voucher to a member outside the stamp flow
    pub async fn assign_next(&self, cancel: &CancellationToken, user_id: UserId) -> Result<Voucher> {
        cancellable(cancel, async {
            let mut tx = self.pool.begin().await.map_err(DbError::from)?;
            let voucher = self.allocator().assign_next(&mut tx, user_id, Utc::now()).await?;
            tx.commit().await.map_err(DbError::from)?;
            Ok(voucher)
        })
        .await
    }

    pub async fn match_payment(&self, cancel: &CancellationToken, claim: &PaymentClaim) -> Result<MatchOutcome> {
        cancellable(cancel, self.intake.matcher().match_payment(claim)).await
    }

    pub async fn list_vouchers(&self, cancel: &CancellationToken, user_id: UserId) -> Result<Vec<VoucherView>> {
        cancellable(cancel, async {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            self.allocator().list_for_user(&mut conn, user_id).await
        })
        .await
    }

    pub async fn delete_used_voucher(&self, cancel: &CancellationToken, user_id: UserId, voucher_id: VoucherId) -> Result<()> {
        cancellable(cancel, async {
            let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
            self.allocator().delete_used_voucher(&mut conn, user_id, voucher_id).await
        })
        .await
    }

    pub async fn check_used_vouchers(&self, cancel: &CancellationToken) -> Result<UsageCheckSummary> {
        cancellable(
            cancel,
            rewards::check_used_vouchers(
                &self.pool,
                self.verifier.as_ref(),
                self.voucher_check.batch_size,
                self.voucher_check.per_item_timeout,
            ),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakePaymentProvider, FakeVerifier, create_test_user, fake_orders, sample_facts, stock_vouchers, test_config};

    fn loyalty(pool: PgPool, config: &Config) -> Loyalty {
        Loyalty::with_services(
            pool,
            config,
            Arc::new(FakePaymentProvider::new(vec![])),
            fake_orders(&[]),
            Arc::new(FakeVerifier::new([])),
        )
        .unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_session_lifecycle(pool: PgPool) {
        let user = create_test_user(&pool, "facade@example.com").await;
        let loyalty = loyalty(pool, &test_config());
        let cancel = CancellationToken::new();

        let pair = loyalty.issue_initial(&cancel, user.id).await.unwrap();
        let identity = loyalty.validate(&cancel, &pair.access_token, TokenType::Access).await.unwrap();
        assert_eq!(identity.user_id, user.id);

        let rotated = loyalty.rotate(&cancel, &pair.refresh_token).await.unwrap();
        let err = loyalty.rotate(&cancel, &pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, Error::RefreshReuseDetected));

        let err = loyalty
            .validate(&cancel, &rotated.refresh_token, TokenType::Refresh)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RefreshInvalid), "{err:?}");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cancelled_token_short_circuits(pool: PgPool) {
        let user = create_test_user(&pool, "cancel@example.com").await;
        stock_vouchers(&pool, 1).await;
        let loyalty = loyalty(pool, &test_config());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = loyalty.assign_next(&cancel, user.id).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // Nothing was allocated by the cancelled call
        let vouchers = loyalty.list_vouchers(&CancellationToken::new(), user.id).await.unwrap();
        assert!(vouchers.is_empty());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cancel_mid_transaction_rolls_back(pool: PgPool) {
        let user = create_test_user(&pool, "cancel-mid@example.com").await;
        stock_vouchers(&pool, 1).await;
        let mut config = test_config();
        config.rewards.stamp_threshold = 1;
        let loyalty = Arc::new(loyalty(pool.clone(), &config));

        // Hold the member row so the stamp increment blocks after the proof insert
        let mut locker = pool.begin().await.unwrap();
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR NO KEY UPDATE")
            .bind(user.id)
            .execute(&mut *locker)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let loyalty = loyalty.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { loyalty.create_proof(&cancel, user.id, "777", sample_facts()).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(!task.is_finished(), "create_proof should be waiting on the member row");

        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got {err:?}");
        locker.commit().await.unwrap();

        let proofs = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM proofs WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(proofs, 0);
        let stamps = sqlx::query_scalar::<_, i32>("SELECT stamps_counter FROM users WHERE id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stamps, 0);
        let fresh = CancellationToken::new();
        assert!(loyalty.list_vouchers(&fresh, user.id).await.unwrap().is_empty());

        // The abandoned insert left nothing behind, so the same payment is accepted afterwards
        let entry = loyalty.create_proof(&fresh, user.id, "777", sample_facts()).await.unwrap();
        assert!(entry.voucher.is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_proof_history(pool: PgPool) {
        let user = create_test_user(&pool, "history-facade@example.com").await;
        let stranger = create_test_user(&pool, "history-stranger@example.com").await;
        let loyalty = loyalty(pool, &test_config());
        let cancel = CancellationToken::new();

        let older = loyalty.create_proof(&cancel, user.id, "501", sample_facts()).await.unwrap();
        let newer = loyalty.create_proof(&cancel, user.id, "502", sample_facts()).await.unwrap();

        let page = loyalty.list_proofs(&cancel, &ProofFilter::new(user.id, 0, 1)).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(page.has_more);
        assert_eq!(page.proofs[0].id, newer.proof.id);

        let page = loyalty.list_proofs(&cancel, &ProofFilter::new(user.id, 1, 1)).await.unwrap();
        assert_eq!(page.proofs[0].id, older.proof.id);
        assert!(!page.has_more);

        let proof = loyalty.get_proof(&cancel, user.id, older.proof.id).await.unwrap();
        assert_eq!(proof.provider_payment_id, "501");
        let err = loyalty.get_proof(&cancel, stranger.id, older.proof.id).await.unwrap_err();
        assert!(matches!(err, Error::ProofNotFound), "got {err:?}");
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_assign_and_list_vouchers(pool: PgPool) {
        let user = create_test_user(&pool, "assign@example.com").await;
        stock_vouchers(&pool, 1).await;
        let mut config = test_config();
        config.rewards.voucher_bucket_url = "https://cdn.example.com/v/".to_string();
        let loyalty = loyalty(pool, &config);
        let cancel = CancellationToken::new();

        let voucher = loyalty.assign_next(&cancel, user.id).await.unwrap();
        let views = loyalty.list_vouchers(&cancel, user.id).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].image_url, format!("https://cdn.example.com/v/{}", voucher.storage_path));

        let err = loyalty.assign_next(&cancel, user.id).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableVouchers));

        let summary = loyalty.check_used_vouchers(&cancel).await.unwrap();
        assert_eq!(summary.checked, 1);
    }
}
