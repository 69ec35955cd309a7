use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::store::User;

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")
    }

    pub async fn get_by_referral_code(&self, code: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by referral code")
    }

    /// Registers the user on first contact and refreshes the display fields
    /// and activity timestamp on every later one. The referral code is
    /// minted once and never regenerated.
    pub async fn upsert(
        &self,
        user_id: i64,
        username: Option<&str>,
        full_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let referral_code = format!("REF{}{}", user_id, now.timestamp());

        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, full_name, referral_code, last_seen_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT(user_id) DO UPDATE SET
                username = COALESCE(excluded.username, users.username),
                full_name = COALESCE(excluded.full_name, users.full_name),
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(full_name)
        .bind(&referral_code)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to upsert user")?;

        self.get(user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User {} not found after upsert", user_id))
    }

    pub async fn adjust_balance(&self, user_id: i64, amount: i64) -> Result<()> {
        sqlx::query("UPDATE users SET balance = balance + $1 WHERE user_id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to adjust balance")?;
        Ok(())
    }

    /// Guarded deduction: only succeeds when the balance covers the amount,
    /// so two concurrent purchases cannot both spend the same funds.
    pub async fn try_deduct_balance_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
        amount: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET balance = balance - $1 WHERE user_id = $2 AND balance >= $1",
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut **tx)
        .await
        .context("Failed to deduct balance")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn credit_balance_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
        amount: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET balance = balance + $1 WHERE user_id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .context("Failed to credit balance")?;
        Ok(())
    }

    /// First-referrer-wins: a no-op if the link is already set.
    pub async fn set_referrer_if_unset_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
        referrer_id: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET referrer_id = $1 WHERE user_id = $2 AND referrer_id IS NULL",
        )
        .bind(referrer_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn increment_invited_count_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET invited_count = invited_count + 1 WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn set_blacklisted(&self, user_id: i64, blacklisted: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_blacklisted = $1 WHERE user_id = $2")
            .bind(blacklisted)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
