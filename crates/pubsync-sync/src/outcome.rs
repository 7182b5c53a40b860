//! Per-object success/failure bookkeeping, one row per snapshot key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pubsync_core::SyncOutcome;
use sqlx::{PgPool, Row};

#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn last_outcome(&self, key: &str) -> Result<Option<SyncOutcome>, sqlx::Error>;

    /// Upserts the latest attempt for `key`; earlier attempts are overwritten.
    async fn record(
        &self,
        key: &str,
        had_error: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct PgOutcomeStore {
    pool: PgPool,
}

impl PgOutcomeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutcomeStore for PgOutcomeStore {
    async fn last_outcome(&self, key: &str) -> Result<Option<SyncOutcome>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT key, had_error, updated_at
              FROM publisher_sync
             WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SyncOutcome {
                key: row.try_get("key")?,
                had_error: row.try_get("had_error")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn record(
        &self,
        key: &str,
        had_error: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO publisher_sync (key, had_error, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key)
            DO UPDATE SET had_error = EXCLUDED.had_error,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(had_error)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
