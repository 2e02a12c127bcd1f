//! Voucher allocation and member-facing voucher operations.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{info, instrument};

use crate::{
    db::{
        handlers::Vouchers,
        models::vouchers::{Voucher, VoucherStatus},
    },
    errors::{Error, Result},
    types::{UserId, VoucherId, abbrev_uuid},
};

/// A voucher as shown to its owner
#[derive(Debug, Clone, Serialize)]
pub struct VoucherView {
    #[serde(flatten)]
    pub voucher: Voucher,
    pub image_url: String,
}

pub struct VoucherAllocator {
    bucket_url: String,
}

impl VoucherAllocator {
    pub fn new(bucket_url: impl Into<String>) -> Self {
        Self {
            bucket_url: bucket_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn image_url(&self, storage_path: &str) -> String {
        format!("{}/{}", self.bucket_url, storage_path.trim_start_matches('/'))
    }

    /// Assign the next free voucher to `user_id` inside the caller's transaction.
    ///
    /// Never waits on rows other transactions are allocating; if every remaining row is
    /// locked or the stock is empty the call fails with `NoAvailableVouchers` straight away.
    #[instrument(skip(self, conn), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn assign_next(&self, conn: &mut PgConnection, user_id: UserId, now: DateTime<Utc>) -> Result<Voucher> {
        let voucher = Vouchers::new(conn)
            .assign_next(user_id, now)
            .await?
            .ok_or(Error::NoAvailableVouchers)?;

        counter!("loyalty_vouchers_assigned_total").increment(1);
        info!(voucher_id = %abbrev_uuid(&voucher.id), "Voucher assigned");
        Ok(voucher)
    }

    #[instrument(skip(self, conn), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn list_for_user(&self, conn: &mut PgConnection, user_id: UserId) -> Result<Vec<VoucherView>> {
        let vouchers = Vouchers::new(conn).list_for_user(user_id).await?;
        Ok(vouchers
            .into_iter()
            .map(|voucher| VoucherView {
                image_url: self.image_url(&voucher.storage_path),
                voucher,
            })
            .collect())
    }

    /// Delete one of the member's vouchers once it has been redeemed.
    #[instrument(skip(self, conn), fields(user_id = %abbrev_uuid(&user_id), voucher_id = %abbrev_uuid(&voucher_id)), err)]
    pub async fn delete_used_voucher(&self, conn: &mut PgConnection, user_id: UserId, voucher_id: VoucherId) -> Result<()> {
        let mut repo = Vouchers::new(conn);
        let voucher = repo
            .get(voucher_id)
            .await?
            .filter(|v| v.user_id == Some(user_id))
            .ok_or(Error::VoucherNotFound)?;

        if voucher.status != VoucherStatus::Used {
            return Err(Error::validation("only used vouchers can be deleted"));
        }

        if !repo.delete_used(user_id, voucher_id).await? {
            return Err(Error::VoucherNotFound);
        }
        Ok(())
    }
}
