//! Reward ledger: payment proof → stamp → (at the threshold) voucher, as one atomic unit.
//! Also the read side of a member's proof history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::{info, instrument};

use crate::{
    db::{
        errors::DbError,
        handlers::{ProofFilter, Proofs, Users},
        models::{
            proofs::{PaymentFacts, Proof, ProofCreateDBRequest},
            vouchers::Voucher,
        },
    },
    errors::{Error, Result},
    rewards::vouchers::VoucherAllocator,
    types::{ProofId, UserId, abbrev_uuid},
};

pub const PROOF_PAYMENT_ID_CONSTRAINT: &str = "proofs_provider_payment_id_unique";

pub const MAX_PROOF_PAGE_SIZE: i64 = 100;

/// Result of recording a proof
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub proof: Proof,
    /// Stamp count after this proof (0 if a voucher was just earned)
    pub stamps: i32,
    pub voucher: Option<Voucher>,
}

/// One page of a member's proof history
#[derive(Debug, Clone, Serialize)]
pub struct ProofPage {
    pub proofs: Vec<Proof>,
    /// Matching proofs across all pages
    pub total: i64,
    pub has_more: bool,
}

pub struct RewardLedger {
    allocator: VoucherAllocator,
    stamp_threshold: i32,
}

impl RewardLedger {
    pub fn new(allocator: VoucherAllocator, stamp_threshold: i32) -> Self {
        Self {
            allocator,
            stamp_threshold,
        }
    }

    pub fn allocator(&self) -> &VoucherAllocator {
        &self.allocator
    }

    pub fn stamp_threshold(&self) -> i32 {
        self.stamp_threshold
    }

    /// Record a proof inside the caller's transaction.
    ///
    /// On any error the caller must drop (roll back) the transaction: the proof insert and the
    /// stamp increment are only valid together with the allocation that may follow them.
    #[instrument(skip(self, conn, facts), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn create_in(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        provider_payment_id: &str,
        facts: PaymentFacts,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        if Proofs::new(conn).exists_by_provider_payment_id(provider_payment_id).await? {
            return Err(Error::DuplicateProof {
                provider_payment_id: provider_payment_id.to_string(),
            });
        }

        let request = ProofCreateDBRequest {
            user_id,
            provider_payment_id: provider_payment_id.to_string(),
            facts,
            proof_date: now,
        };
        let proof = Proofs::new(conn).create(&request).await.map_err(|e| match e {
            e if e.is_unique_violation_on(PROOF_PAYMENT_ID_CONSTRAINT) => Error::DuplicateProof {
                provider_payment_id: provider_payment_id.to_string(),
            },
            DbError::ForeignKeyViolation { .. } => Error::UserNotFound,
            e => Error::Database(e),
        })?;

        let stamps = Users::new(conn).increment_stamps(user_id).await?.ok_or(Error::UserNotFound)?;

        if stamps < self.stamp_threshold {
            info!(stamps, "Stamp recorded");
            return Ok(LedgerEntry {
                proof,
                stamps,
                voucher: None,
            });
        }

        let voucher = self.allocator.assign_next(conn, user_id, now).await?;
        Users::new(conn).reset_stamps(user_id).await?;
        info!(voucher_id = %abbrev_uuid(&voucher.id), "Stamp threshold reached, voucher earned");

        Ok(LedgerEntry {
            proof,
            stamps: 0,
            voucher: Some(voucher),
        })
    }

    /// Record a proof in a transaction of its own.
    pub async fn create(
        &self,
        pool: &PgPool,
        user_id: UserId,
        provider_payment_id: &str,
        facts: PaymentFacts,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let mut tx = pool.begin().await.map_err(DbError::from)?;
        let entry = self.create_in(&mut tx, user_id, provider_payment_id, facts, now).await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(entry)
    }

    /// A page of the member's proofs, newest first
    #[instrument(skip(self, conn, filter), fields(user_id = %abbrev_uuid(&filter.user_id)), err)]
    pub async fn list_proofs(&self, conn: &mut PgConnection, filter: &ProofFilter) -> Result<ProofPage> {
        if !(1..=MAX_PROOF_PAGE_SIZE).contains(&filter.limit) {
            return Err(Error::validation(format!("limit must be between 1 and {MAX_PROOF_PAGE_SIZE}")));
        }
        if filter.skip < 0 {
            return Err(Error::validation("skip must not be negative"));
        }
        if let (Some(from), Some(to)) = (filter.approved_from, filter.approved_to)
            && from > to
        {
            return Err(Error::validation("approved_from must not be after approved_to"));
        }

        let total = Proofs::new(conn).count(filter).await?;
        let proofs = Proofs::new(conn).list(filter).await?;
        let has_more = filter.skip + (proofs.len() as i64) < total;

        Ok(ProofPage { proofs, total, has_more })
    }

    /// One of the member's proofs. Another member's proof reads as missing.
    #[instrument(skip(self, conn), fields(user_id = %abbrev_uuid(&user_id), proof_id = %abbrev_uuid(&proof_id)), err)]
    pub async fn get_proof(&self, conn: &mut PgConnection, user_id: UserId, proof_id: ProofId) -> Result<Proof> {
        Proofs::new(conn)
            .get(proof_id)
            .await?
            .filter(|proof| proof.user_id == user_id)
            .ok_or(Error::ProofNotFound)
    }
}
