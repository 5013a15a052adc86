use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::application::repos::{CacheRowsRepo, RepoError};
use crate::domain::entities::CacheRow;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct CacheRowRecord {
    cache_key: String,
    data: Value,
    etag: Option<String>,
    expires_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<CacheRowRecord> for CacheRow {
    fn from(row: CacheRowRecord) -> Self {
        Self {
            cache_key: row.cache_key,
            data: row.data,
            etag: row.etag,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl CacheRowsRepo for PostgresRepositories {
    async fn find_row(&self, key: &str) -> Result<Option<CacheRow>, RepoError> {
        let row = sqlx::query_as::<_, CacheRowRecord>(
            r#"
            SELECT cache_key, data, etag, expires_at, updated_at
              FROM esi_cache
             WHERE cache_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(CacheRow::from))
    }

    async fn upsert_row(
        &self,
        key: &str,
        data: &Value,
        etag: Option<&str>,
        expires_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO esi_cache (cache_key, data, etag, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (cache_key) DO UPDATE
               SET data = EXCLUDED.data,
                   etag = EXCLUDED.etag,
                   expires_at = EXCLUDED.expires_at,
                   updated_at = now()
            "#,
        )
        .bind(key)
        .bind(data)
        .bind(etag)
        .bind(expires_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn delete_row(&self, key: &str) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM esi_cache WHERE cache_key = $1")
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_rows_like(&self, prefix: &str) -> Result<u64, RepoError> {
        // LIKE metacharacters in keys are escaped so a literal prefix match
        // cannot over-delete.
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let result = sqlx::query("DELETE FROM esi_cache WHERE cache_key LIKE $1")
            .bind(pattern)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn delete_expired_rows(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM esi_cache WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}
