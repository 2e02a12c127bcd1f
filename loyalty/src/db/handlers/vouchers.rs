//! Database repository for reward vouchers.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{
        errors::Result,
        models::vouchers::{Voucher, VoucherCreateDBRequest, VoucherStatus},
    },
    types::{UserId, VoucherId, abbrev_uuid},
};

pub struct Vouchers<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Vouchers<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(qr_code = %request.qr_code), err)]
    pub async fn create(&mut self, request: &VoucherCreateDBRequest) -> Result<Voucher> {
        let voucher = sqlx::query_as::<_, Voucher>(
            r#"
            INSERT INTO vouchers (qr_code, storage_path)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(&request.qr_code)
        .bind(&request.storage_path)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(voucher)
    }

    #[instrument(skip(self), fields(voucher_id = %abbrev_uuid(&id)), err)]
    pub async fn get(&mut self, id: VoucherId) -> Result<Option<Voucher>> {
        let voucher = sqlx::query_as::<_, Voucher>("SELECT * FROM vouchers WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(voucher)
    }

    /// Claim the lowest-id unassigned ACTIVE voucher for `user_id`.
    ///
    /// Rows locked by other in-flight transactions are skipped rather than waited on, so
    /// concurrent callers never block each other and never claim the same row. Returns `None`
    /// when no unlocked candidate exists.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn assign_next(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<Option<Voucher>> {
        let voucher = sqlx::query_as::<_, Voucher>(
            r#"
            UPDATE vouchers
            SET is_assigned = TRUE, user_id = $1, assigned_date = $2
            WHERE id = (
                SELECT id FROM vouchers
                WHERE is_assigned = FALSE AND status = $3
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(VoucherStatus::Active)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(voucher)
    }

    /// Assigned ACTIVE vouchers, least recently checked first (never-checked rows lead)
    #[instrument(skip(self), err)]
    pub async fn list_assigned_active(&mut self, limit: i64) -> Result<Vec<Voucher>> {
        let vouchers = sqlx::query_as::<_, Voucher>(
            r#"
            SELECT * FROM vouchers
            WHERE is_assigned = TRUE AND status = $1
            ORDER BY last_checked_at ASC NULLS FIRST, id ASC
            LIMIT $2
            "#,
        )
        .bind(VoucherStatus::Active)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(vouchers)
    }

    #[instrument(skip(self), fields(voucher_id = %abbrev_uuid(&id)), err)]
    pub async fn touch_checked(&mut self, id: VoucherId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE vouchers SET last_checked_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }

    /// Flip an ACTIVE voucher to USED. Returns false if it was not ACTIVE.
    #[instrument(skip(self), fields(voucher_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_used(&mut self, id: VoucherId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE vouchers SET status = $2, used_at = $3 WHERE id = $1 AND status = $4")
            .bind(id)
            .bind(VoucherStatus::Used)
            .bind(now)
            .bind(VoucherStatus::Active)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// A user's vouchers, most recently assigned first
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn list_for_user(&mut self, user_id: UserId) -> Result<Vec<Voucher>> {
        let vouchers = sqlx::query_as::<_, Voucher>(
            r#"
            SELECT * FROM vouchers
            WHERE user_id = $1 AND is_assigned = TRUE
            ORDER BY assigned_date DESC NULLS LAST, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(vouchers)
    }

    /// Delete a voucher if it belongs to `user_id` and is USED. Returns whether a row was deleted.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id), voucher_id = %abbrev_uuid(&id)), err)]
    pub async fn delete_used(&mut self, user_id: UserId, id: VoucherId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM vouchers WHERE id = $1 AND user_id = $2 AND status = $3")
            .bind(id)
            .bind(user_id)
            .bind(VoucherStatus::Used)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
