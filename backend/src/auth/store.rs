use std::future::Future;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::{
    error::AppError,
    models::users::{NewUser, User},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    LastAdmin,
}

pub trait UserRepository: Send + Sync {
    fn count(&self) -> impl Future<Output = Result<i64, AppError>> + Send;

    fn find_by_username(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Option<User>, AppError>> + Send;

    fn find_by_id(&self, id: i64) -> impl Future<Output = Result<Option<User>, AppError>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<User>, AppError>> + Send;

    fn create(&self, user: NewUser) -> impl Future<Output = Result<User, AppError>> + Send;

    fn update_password(
        &self,
        id: i64,
        password_hash: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Deletes `id` unless it is the only remaining admin.
    fn delete_unless_last_admin(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<DeleteOutcome, AppError>> + Send;
}

const USER_COLUMNS: &str = "id, username, password_hash, is_admin, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl UserRepository for SqliteUserStore {
    async fn count(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = ? LIMIT 1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ? LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn list(&self) -> Result<Vec<User>, AppError> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn create(&self, user: NewUser) -> Result<User, AppError> {
        let now = Utc::now();
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (username, password_hash, is_admin, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.is_admin)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict("Username already exists".into())
            }
            other => AppError::Database(other),
        })
    }

    async fn update_password(&self, id: i64, password_hash: &str) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_unless_last_admin(&self, id: i64) -> Result<DeleteOutcome, AppError> {
        // Admin count and delete happen in one statement.
        let result = sqlx::query(
            r#"
            DELETE FROM users
            WHERE id = ?
              AND (is_admin = 0 OR (SELECT COUNT(*) FROM users WHERE is_admin = 1) > 1)
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(DeleteOutcome::Deleted);
        }
        match self.find_by_id(id).await? {
            None => Ok(DeleteOutcome::NotFound),
            Some(_) => Ok(DeleteOutcome::LastAdmin),
        }
    }
}
