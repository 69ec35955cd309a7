use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::store::Server;

#[derive(Debug, Clone)]
pub struct ServerRepository {
    pool: SqlitePool,
}

impl ServerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        name: &str,
        base_url: &str,
        username: Option<&str>,
        password: Option<&str>,
        api_token: Option<&str>,
        inbound_id: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO servers (name, base_url, username, password, api_token, inbound_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(base_url)
        .bind(username)
        .bind(password)
        .bind(api_token)
        .bind(inbound_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create server")?;
        Ok(id)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch server")
    }

    pub async fn get_active(&self) -> Result<Vec<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE is_active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch active servers")
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE servers SET is_active = $1 WHERE id = $2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Refuses to delete a server that still backs any subscription or key.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let subs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE server_id = $1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        let keys: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM keys WHERE server_id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        if subs + keys > 0 {
            anyhow::bail!(
                "Server {} is still referenced by {} subscription(s) and {} key(s)",
                id,
                subs,
                keys
            );
        }

        sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
