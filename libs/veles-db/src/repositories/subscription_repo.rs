use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::store::{Subscription, subscription_status};

#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscription by ID")
    }

    /// Raw active-row lookup; expiry is the caller's concern (the service
    /// applies lazy expiry with its injected clock).
    pub async fn active_by_user(&self, user_id: i64) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = $1 AND status = 'active' ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch active subscription")
    }

    pub async fn all_by_user(&self, user_id: i64) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch user subscriptions")
    }

    /// Insert inside the purchase transaction. The partial unique index on
    /// (user_id) WHERE status = 'active' is the final arbiter when two
    /// purchases race; callers map the unique violation to a rejection.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
        server_id: i64,
        client_id: &str,
        connection_uri: &str,
        traffic_gb: i64,
        days: i64,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO subscriptions
                (user_id, server_id, client_id, connection_uri, traffic_gb, days, status, start_date, end_date, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8, $7)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(server_id)
        .bind(client_id)
        .bind(connection_uri)
        .bind(traffic_gb)
        .bind(days)
        .bind(start_date)
        .bind(end_date)
        .fetch_one(&mut **tx)
        .await
    }

    pub async fn mark_expired(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET status = $1, renewal_used = 0 WHERE id = $2")
            .bind(subscription_status::EXPIRED)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn cancel(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET status = $1 WHERE id = $2")
            .bind(subscription_status::CANCELLED)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies a renewal: new remote credential, pushed-out end date, and
    /// the once-per-cycle flag. The WHERE clause only matches a row whose
    /// renewal slot is still open, so concurrent renewals cannot both land;
    /// returns whether this call claimed the cycle.
    pub async fn apply_renewal_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        id: i64,
        client_id: &str,
        connection_uri: &str,
        new_end: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET client_id = $1, connection_uri = $2, end_date = $3, renewal_used = 1
            WHERE id = $4 AND status = 'active' AND renewal_used = 0
            "#,
        )
        .bind(client_id)
        .bind(connection_uri)
        .bind(new_end)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to apply renewal")?;
        Ok(result.rows_affected() == 1)
    }

    /// Flips every overdue active row to expired and reopens its renewal
    /// slot. Returns the number of affected rows.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'expired', renewal_used = 0 WHERE status = 'active' AND end_date < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to sweep expired subscriptions")?;
        Ok(result.rows_affected())
    }
}
