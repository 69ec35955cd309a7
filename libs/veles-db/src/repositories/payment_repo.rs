use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::store::{Payment, payment_status};

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment")
    }

    pub async fn by_user(&self, user_id: i64) -> Result<Vec<Payment>> {
        sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch user payments")
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_pending(
        &self,
        user_id: i64,
        amount: i64,
        currency: &str,
        plan_name: Option<&str>,
        method: Option<&str>,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO payments (user_id, amount, currency, plan_name, status, method, external_id, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(currency)
        .bind(plan_name)
        .bind(method)
        .bind(external_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create pending payment")
    }

    /// Top-ups are recorded already completed: the money arrived before the
    /// ledger hears about it, so there is no pending phase.
    pub async fn create_completed_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
        amount: i64,
        currency: &str,
        method: Option<&str>,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO payments (user_id, amount, currency, status, method, external_id, created_at, completed_at)
            VALUES ($1, $2, $3, 'completed', $4, $5, $6, $6)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(currency)
        .bind(method)
        .bind(external_id)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to record completed payment")
    }

    /// Completion happens inside the ledger-commit transaction, after the
    /// remote credential already exists.
    pub async fn mark_completed_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        id: i64,
        subscription_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE payments SET status = $1, subscription_id = $2, completed_at = $3 WHERE id = $4",
        )
        .bind(payment_status::COMPLETED)
        .bind(subscription_id)
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("Failed to complete payment")?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE payments SET status = $1 WHERE id = $2")
            .bind(payment_status::FAILED)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
