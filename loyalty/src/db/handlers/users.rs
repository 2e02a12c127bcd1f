//! Database repository for loyalty members.

use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{
        errors::Result,
        models::users::{User, UserCreateDBRequest},
    },
    types::{UserId, abbrev_uuid},
};

pub struct Users<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Users<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(email = %request.email), err)]
    pub async fn create(&mut self, request: &UserCreateDBRequest) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, name)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(&request.email)
        .bind(&request.name)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(user)
    }

    /// Atomically add one stamp and return the new value, or `None` if the user does not exist.
    /// The row stays locked until the enclosing transaction ends.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    pub async fn increment_stamps(&mut self, id: UserId) -> Result<Option<i32>> {
        let stamps = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE users
            SET stamps_counter = stamps_counter + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING stamps_counter
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(stamps)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    pub async fn reset_stamps(&mut self, id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET stamps_counter = 0, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;
    use uuid::Uuid;

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_and_lookup_user(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Users::new(&mut conn);

        let user = repo
            .create(&UserCreateDBRequest {
                email: "member@example.com".to_string(),
                name: "Member".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(user.stamps_counter, 0);

        let by_id = repo.get_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(by_id.email, "member@example.com");

        assert!(repo.get_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_increment_and_reset_stamps(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Users::new(&mut conn);

        let user = repo
            .create(&UserCreateDBRequest {
                email: "stamps@example.com".to_string(),
                name: String::new(),
            })
            .await
            .unwrap();

        assert_eq!(repo.increment_stamps(user.id).await.unwrap(), Some(1));
        assert_eq!(repo.increment_stamps(user.id).await.unwrap(), Some(2));

        repo.reset_stamps(user.id).await.unwrap();
        let user = repo.get_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(user.stamps_counter, 0);

        assert_eq!(repo.increment_stamps(Uuid::new_v4()).await.unwrap(), None);
    }
}
