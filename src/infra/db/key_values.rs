use async_trait::async_trait;
use tracing::instrument;

use crate::{
    application::repos::{KeyValueStore, RepoError},
    domain::entities::Entry,
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct KeyValueRow {
    key: String,
    value: String,
}

impl From<KeyValueRow> for Entry {
    fn from(row: KeyValueRow) -> Self {
        Self {
            key: row.key,
            value: row.value,
        }
    }
}

#[async_trait]
impl KeyValueStore for PostgresRepositories {
    #[instrument(skip(self, entry), fields(key = %entry.key))]
    async fn add(&self, entry: &Entry) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO key_values (key, value, updated_at)
            VALUES ($1, $2, now())
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.value)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn try_get(&self, key: &str) -> Result<Option<String>, RepoError> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value
            FROM key_values
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(value)
    }

    #[instrument(skip(self, entry), fields(key = %entry.key))]
    async fn update(&self, entry: &Entry) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE key_values
            SET value = $2,
                updated_at = now()
            WHERE key = $1
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.value)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            DELETE FROM key_values
            WHERE key = $1
            "#,
        )
        .bind(key)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<Entry>, RepoError> {
        let rows = sqlx::query_as::<_, KeyValueRow>(
            r#"
            SELECT key, value
            FROM key_values
            ORDER BY key
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(Entry::from).collect())
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        self.ping().await.map_err(map_sqlx_error)
    }
}
