use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::store::{Key, subscription_status};

#[derive(Debug, Clone)]
pub struct KeyRepository {
    pool: SqlitePool,
}

impl KeyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Key>> {
        sqlx::query_as::<_, Key>("SELECT * FROM keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch key")
    }

    pub async fn active_by_user(&self, user_id: i64) -> Result<Vec<Key>> {
        sqlx::query_as::<_, Key>(
            "SELECT * FROM keys WHERE user_id = $1 AND status = 'active' ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active keys")
    }

    /// Counted inside the creation transaction so a racing insert cannot
    /// slip past the limit.
    pub async fn count_active_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
    ) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM keys WHERE user_id = $1 AND status = 'active'")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await
            .context("Failed to count active keys")
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
        server_id: i64,
        client_id: &str,
        connection_uri: &str,
        label: Option<&str>,
        traffic_gb: i64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO keys
                (user_id, server_id, client_id, connection_uri, label, traffic_gb, status, start_date, end_date, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8, $7)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(server_id)
        .bind(client_id)
        .bind(connection_uri)
        .bind(label)
        .bind(traffic_gb)
        .bind(start_date)
        .bind(end_date)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to create key")
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        id: i64,
    ) -> Result<()> {
        sqlx::query("DELETE FROM keys WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn mark_expired(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE keys SET status = $1 WHERE id = $2")
            .bind(subscription_status::EXPIRED)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE keys SET status = 'expired' WHERE status = 'active' AND end_date < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to sweep expired keys")?;
        Ok(result.rows_affected())
    }
}
