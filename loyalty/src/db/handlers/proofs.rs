//! Database repository for payment proofs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;

use crate::{
    db::{
        errors::Result,
        models::proofs::{Proof, ProofCreateDBRequest},
    },
    types::{ProofId, UserId, abbrev_uuid},
};

/// Filter for listing a user's proofs
#[derive(Debug, Clone)]
pub struct ProofFilter {
    pub user_id: UserId,
    /// Case-insensitive substring of the provider payment id
    pub payment_id: Option<String>,
    pub approved_from: Option<DateTime<Utc>>,
    pub approved_to: Option<DateTime<Utc>>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub skip: i64,
    pub limit: i64,
}

impl ProofFilter {
    pub fn new(user_id: UserId, skip: i64, limit: i64) -> Self {
        Self {
            user_id,
            payment_id: None,
            approved_from: None,
            approved_to: None,
            min_amount: None,
            max_amount: None,
            skip,
            limit,
        }
    }
}

fn push_conditions(query: &mut QueryBuilder<'_, Postgres>, filter: &ProofFilter) {
    query.push("user_id = ");
    query.push_bind(filter.user_id);

    if let Some(payment_id) = filter.payment_id.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        query.push(" AND provider_payment_id ILIKE ");
        query.push_bind(format!("%{payment_id}%"));
    }
    if let Some(from) = filter.approved_from {
        query.push(" AND approved_at >= ");
        query.push_bind(from);
    }
    if let Some(to) = filter.approved_to {
        query.push(" AND approved_at <= ");
        query.push_bind(to);
    }
    if let Some(min) = filter.min_amount {
        query.push(" AND amount >= ");
        query.push_bind(min);
    }
    if let Some(max) = filter.max_amount {
        query.push(" AND amount <= ");
        query.push_bind(max);
    }
}

pub struct Proofs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Proofs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn exists_by_provider_payment_id(&mut self, provider_payment_id: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM proofs WHERE provider_payment_id = $1)")
            .bind(provider_payment_id)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(exists)
    }

    /// Insert a proof. A second insert for the same provider payment id fails with a unique
    /// violation on `proofs_provider_payment_id_unique`.
    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), provider_payment_id = %request.provider_payment_id), err)]
    pub async fn create(&mut self, request: &ProofCreateDBRequest) -> Result<Proof> {
        let facts = &request.facts;
        let proof = sqlx::query_as::<_, Proof>(
            r#"
            INSERT INTO proofs (
                user_id, provider_payment_id, approved_at, operation_type, status, amount,
                dni, card_last4, card_type, payment_method_id, external_order_id, product_name, proof_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(request.user_id)
        .bind(&request.provider_payment_id)
        .bind(facts.approved_at)
        .bind(&facts.operation_type)
        .bind(&facts.status)
        .bind(facts.amount)
        .bind(&facts.dni)
        .bind(&facts.card_last4)
        .bind(&facts.card_type)
        .bind(&facts.payment_method_id)
        .bind(&facts.external_order_id)
        .bind(&facts.product_name)
        .bind(request.proof_date)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(proof)
    }

    #[instrument(skip(self), fields(proof_id = %abbrev_uuid(&id)), err)]
    pub async fn get(&mut self, id: ProofId) -> Result<Option<Proof>> {
        let proof = sqlx::query_as::<_, Proof>("SELECT * FROM proofs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(proof)
    }

    /// A page of one user's proofs, newest first
    #[instrument(skip(self, filter), fields(user_id = %abbrev_uuid(&filter.user_id), limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &ProofFilter) -> Result<Vec<Proof>> {
        let mut query = QueryBuilder::new("SELECT * FROM proofs WHERE ");
        push_conditions(&mut query, filter);

        query.push(" ORDER BY proof_date DESC, id DESC LIMIT ");
        query.push_bind(filter.limit);
        query.push(" OFFSET ");
        query.push_bind(filter.skip);

        let proofs = query.build_query_as::<Proof>().fetch_all(&mut *self.db).await?;
        Ok(proofs)
    }

    /// Count the proofs matching the filter, ignoring pagination
    #[instrument(skip(self, filter), fields(user_id = %abbrev_uuid(&filter.user_id)), err)]
    pub async fn count(&mut self, filter: &ProofFilter) -> Result<i64> {
        let mut query = QueryBuilder::new("SELECT COUNT(*) FROM proofs WHERE ");
        push_conditions(&mut query, filter);

        let count: (i64,) = query.build_query_as().fetch_one(&mut *self.db).await?;
        Ok(count.0)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn count_for_user(&mut self, user_id: UserId) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM proofs WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::errors::DbError, test_utils::{create_test_user, sample_facts}};
    use chrono::Utc;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_and_list(pool: PgPool) {
        let user = create_test_user(&pool, "proofs@example.com").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Proofs::new(&mut conn);

        assert!(!repo.exists_by_provider_payment_id("mp-1").await.unwrap());

        let proof = repo
            .create(&ProofCreateDBRequest {
                user_id: user.id,
                provider_payment_id: "mp-1".to_string(),
                facts: sample_facts(),
                proof_date: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(proof.provider_payment_id, "mp-1");
        assert_eq!(proof.amount, sample_facts().amount);

        assert!(repo.exists_by_provider_payment_id("mp-1").await.unwrap());
        assert_eq!(repo.count_for_user(user.id).await.unwrap(), 1);
        assert_eq!(repo.get(proof.id).await.unwrap().unwrap().id, proof.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_duplicate_insert_is_unique_violation(pool: PgPool) {
        let user = create_test_user(&pool, "dupe@example.com").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Proofs::new(&mut conn);

        let request = ProofCreateDBRequest {
            user_id: user.id,
            provider_payment_id: "mp-dupe".to_string(),
            facts: sample_facts(),
            proof_date: Utc::now(),
        };
        repo.create(&request).await.unwrap();

        let err = repo.create(&request).await.unwrap_err();
        assert!(err.is_unique_violation_on("proofs_provider_payment_id_unique"), "got {err:?}");
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }
}
