//! Proof intake: resolve a submitted payment against the provider, then record it.
//!
//! Every network call (provider lookup or matching, product-name enrichment) happens before
//! the ledger transaction opens, so no row lock is ever held across a remote call.

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, instrument, warn};

use crate::{
    db::{errors::DbError, handlers::Proofs},
    errors::{Error, Result},
    matcher::{MatchOutcome, PaymentClaim, PaymentMatcher},
    payment_providers::{PaymentProvider, ProviderPayment},
    rewards::{LedgerEntry, RewardLedger},
    types::{UserId, abbrev_uuid},
    vending::OrderLookup,
};

pub struct ProofIntake {
    provider: Arc<dyn PaymentProvider>,
    matcher: PaymentMatcher,
    orders: Arc<dyn OrderLookup>,
    ledger: RewardLedger,
}

impl ProofIntake {
    pub fn new(provider: Arc<dyn PaymentProvider>, matcher: PaymentMatcher, orders: Arc<dyn OrderLookup>, ledger: RewardLedger) -> Self {
        Self {
            provider,
            matcher,
            orders,
            ledger,
        }
    }

    pub fn ledger(&self) -> &RewardLedger {
        &self.ledger
    }

    pub fn matcher(&self) -> &PaymentMatcher {
        &self.matcher
    }

    /// Record a proof for a payment the member identified by its provider id
    #[instrument(skip(self, pool), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn submit_by_payment_id(&self, pool: &PgPool, user_id: UserId, payment_id: &str) -> Result<LedgerEntry> {
        let payment_id = payment_id.trim();
        if payment_id.is_empty() {
            return Err(Error::validation("payment id is required"));
        }
        // Provider payment ids are numeric and end up in the lookup URL path
        if !payment_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::validation("payment id must be numeric"));
        }

        {
            let mut conn = pool.acquire().await.map_err(DbError::from)?;
            if Proofs::new(&mut conn).exists_by_provider_payment_id(payment_id).await? {
                return Err(Error::DuplicateProof {
                    provider_payment_id: payment_id.to_string(),
                });
            }
        }

        let payment = self.provider.get_payment(payment_id).await?.ok_or(Error::PaymentNotFound)?;
        if !payment.is_approved() {
            return Err(Error::validation(format!("payment is {}, only approved payments earn stamps", payment.status)));
        }

        self.record(pool, user_id, payment).await
    }

    /// Record a proof for a payment the member described from their receipt
    #[instrument(skip(self, pool, claim), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn submit_by_details(&self, pool: &PgPool, user_id: UserId, claim: &PaymentClaim) -> Result<LedgerEntry> {
        let payment = match self.matcher.match_payment(claim).await? {
            MatchOutcome::Matched(matched) => matched.payment,
            MatchOutcome::NoMatch => return Err(Error::PaymentNotFound),
            MatchOutcome::Ambiguous { count, hints } => return Err(Error::PaymentAmbiguous { count, hints }),
        };

        self.record(pool, user_id, payment).await
    }

    async fn record(&self, pool: &PgPool, user_id: UserId, payment: ProviderPayment) -> Result<LedgerEntry> {
        let product_name = self.product_name(&payment).await;
        let facts = payment
            .to_facts(product_name)
            .ok_or_else(|| Error::validation("payment has no approval or creation date"))?;

        self.ledger.create(pool, user_id, &payment.id.to_string(), facts, Utc::now()).await
    }

    /// Best-effort: a failed lookup stores the proof without a product name
    async fn product_name(&self, payment: &ProviderPayment) -> Option<String> {
        let order_no = payment.external_order_id()?;
        match self.orders.product_name(order_no).await {
            Ok(name) => {
                debug!(order_no, found = name.is_some(), "Product lookup");
                name
            }
            Err(e) => {
                warn!(order_no, error = %e, "Product lookup failed, recording proof without product name");
                None
            }
        }
    }
}
