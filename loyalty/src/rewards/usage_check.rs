//! Periodic voucher usage check.
//!
//! Vouchers are redeemed at the vending machine, outside this system. The job asks the
//! vending API about each assigned, still-active voucher and flips redeemed ones to USED.
//! It is best-effort: a failing or slow verifier only skips that voucher until the next run.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::VoucherCheckConfig,
    db::{errors::DbError, handlers::Vouchers},
    errors::Result,
    types::abbrev_uuid,
    vending::VoucherVerifier,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageCheckSummary {
    pub checked: usize,
    pub marked_used: usize,
    pub failed: usize,
}

/// Check up to `batch_size` assigned ACTIVE vouchers, least recently checked first.
///
/// Each verifier call is bounded by `per_item_timeout`. `last_checked_at` is updated for every
/// voucher visited, whatever the verifier said.
#[instrument(skip(pool, verifier), err)]
pub async fn check_used_vouchers(
    pool: &PgPool,
    verifier: &dyn VoucherVerifier,
    batch_size: i64,
    per_item_timeout: Duration,
) -> Result<UsageCheckSummary> {
    let batch = {
        let mut conn = pool.acquire().await.map_err(DbError::from)?;
        Vouchers::new(&mut conn).list_assigned_active(batch_size).await?
    };

    let mut summary = UsageCheckSummary::default();
    for voucher in batch {
        summary.checked += 1;
        let voucher_id = abbrev_uuid(&voucher.id);

        match tokio::time::timeout(per_item_timeout, verifier.is_used(&voucher.qr_code)).await {
            Ok(Ok(true)) => {
                let mut conn = pool.acquire().await.map_err(DbError::from)?;
                if Vouchers::new(&mut conn).mark_used(voucher.id, Utc::now()).await? {
                    summary.marked_used += 1;
                    counter!("loyalty_voucher_checks_total", "outcome" => "used").increment(1);
                    info!(voucher_id = %voucher_id, "Voucher redeemed, marked used");
                }
            }
            Ok(Ok(false)) => {
                counter!("loyalty_voucher_checks_total", "outcome" => "unused").increment(1);
                debug!(voucher_id = %voucher_id, "Voucher not redeemed yet");
            }
            Ok(Err(e)) => {
                summary.failed += 1;
                counter!("loyalty_voucher_checks_total", "outcome" => "error").increment(1);
                warn!(voucher_id = %voucher_id, error = %e, "Voucher verification failed");
            }
            Err(_) => {
                summary.failed += 1;
                counter!("loyalty_voucher_checks_total", "outcome" => "timeout").increment(1);
                warn!(voucher_id = %voucher_id, timeout = ?per_item_timeout, "Voucher verification timed out");
            }
        }

        let touched = match pool.acquire().await {
            Ok(mut conn) => Vouchers::new(&mut conn).touch_checked(voucher.id, Utc::now()).await,
            Err(e) => Err(DbError::from(e)),
        };
        if let Err(e) = touched {
            warn!(voucher_id = %voucher_id, error = %e, "Failed to record voucher check time");
        }
    }

    Ok(summary)
}

/// Background driver for [`check_used_vouchers`]
pub struct VoucherUsageJob {
    pool: PgPool,
    verifier: Arc<dyn VoucherVerifier>,
    config: VoucherCheckConfig,
}

impl VoucherUsageJob {
    pub fn new(pool: PgPool, verifier: Arc<dyn VoucherVerifier>, config: VoucherCheckConfig) -> Self {
        Self { pool, verifier, config }
    }

    /// One run, bounded by the configured run timeout
    pub async fn run_once(&self) -> Result<Option<UsageCheckSummary>> {
        let run = check_used_vouchers(
            &self.pool,
            self.verifier.as_ref(),
            self.config.batch_size,
            self.config.per_item_timeout,
        );
        match tokio::time::timeout(self.config.run_timeout, run).await {
            Ok(summary) => summary.map(Some),
            Err(_) => {
                warn!(run_timeout = ?self.config.run_timeout, "Voucher usage check hit its deadline");
                Ok(None)
            }
        }
    }

    /// Run until `shutdown` is cancelled. Runs never overlap; ticks missed while a run is in
    /// progress are skipped.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.config.interval, batch_size = self.config.batch_size, "Starting voucher usage job");

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.run_once() => match result {
                    Ok(Some(summary)) => info!(
                        checked = summary.checked,
                        marked_used = summary.marked_used,
                        failed = summary.failed,
                        "Voucher usage check complete"
                    ),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Voucher usage check failed"),
                },
            }
        }

        info!("Voucher usage job stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::models::vouchers::VoucherStatus,
        test_utils::{FakeVerifier, VerifierAnswer, create_test_user, stock_vouchers},
    };

    async fn assign_all(pool: &PgPool, count: usize) -> Vec<crate::db::models::vouchers::Voucher> {
        let user = create_test_user(pool, "holder@example.com").await;
        stock_vouchers(pool, count).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut assigned = Vec::new();
        for _ in 0..count {
            assigned.push(Vouchers::new(&mut conn).assign_next(user.id, Utc::now()).await.unwrap().unwrap());
        }
        assigned
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_marks_used_and_touches_every_voucher(pool: PgPool) {
        let vouchers = assign_all(&pool, 4).await;
        let verifier = FakeVerifier::new([
            (vouchers[0].qr_code.clone(), VerifierAnswer::Used),
            (vouchers[1].qr_code.clone(), VerifierAnswer::Unused),
            (vouchers[2].qr_code.clone(), VerifierAnswer::Fail),
            (vouchers[3].qr_code.clone(), VerifierAnswer::Hang),
        ]);

        let summary = check_used_vouchers(&pool, &verifier, 10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(
            summary,
            UsageCheckSummary {
                checked: 4,
                marked_used: 1,
                failed: 2,
            }
        );

        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Vouchers::new(&mut conn);
        for voucher in &vouchers {
            let row = repo.get(voucher.id).await.unwrap().unwrap();
            assert!(row.last_checked_at.is_some(), "voucher {} was not touched", voucher.id);
            if voucher.id == vouchers[0].id {
                assert_eq!(row.status, VoucherStatus::Used);
                assert!(row.used_at.is_some());
            } else {
                assert_eq!(row.status, VoucherStatus::Active);
            }
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_batch_prefers_least_recently_checked(pool: PgPool) {
        let vouchers = assign_all(&pool, 3).await;
        let verifier = FakeVerifier::new([]);

        let first = check_used_vouchers(&pool, &verifier, 2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.checked, 2);

        // The voucher skipped last time is now first in line
        check_used_vouchers(&pool, &verifier, 1, Duration::from_secs(1)).await.unwrap();
        let calls = verifier.calls();
        assert_eq!(calls.len(), 3);
        assert!(!calls[..2].contains(&calls[2]));
        assert!(vouchers.iter().any(|v| v.qr_code == calls[2]));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_used_and_unassigned_vouchers_are_ignored(pool: PgPool) {
        let vouchers = assign_all(&pool, 1).await;
        stock_vouchers(&pool, 2).await;
        let mut conn = pool.acquire().await.unwrap();
        Vouchers::new(&mut conn).mark_used(vouchers[0].id, Utc::now()).await.unwrap();

        let verifier = FakeVerifier::new([]);
        let summary = check_used_vouchers(&pool, &verifier, 10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(summary.checked, 0);
        assert!(verifier.calls().is_empty());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_job_stops_on_cancellation(pool: PgPool) {
        assign_all(&pool, 1).await;
        let verifier = Arc::new(FakeVerifier::new([]));
        let job = VoucherUsageJob::new(
            pool.clone(),
            verifier.clone(),
            VoucherCheckConfig {
                interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(job.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("job did not stop")
            .unwrap();

        assert!(!verifier.calls().is_empty(), "job never ran");
    }
}
