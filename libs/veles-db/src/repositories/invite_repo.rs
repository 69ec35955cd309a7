use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::store::Invite;

#[derive(Debug, Clone)]
pub struct InviteRepository {
    pool: SqlitePool,
}

impl InviteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_by_code(&self, code: &str) -> Result<Option<Invite>> {
        sqlx::query_as::<_, Invite>("SELECT * FROM invites WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch invite")
    }

    /// Returns the user's standing invite code, minting one on first access.
    pub async fn get_or_create_code(&self, inviter_id: i64, now: DateTime<Utc>) -> Result<String> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT code FROM invites WHERE inviter_id = $1 LIMIT 1")
                .bind(inviter_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(code) = existing {
            return Ok(code);
        }

        let code = format!("REF{}{}", inviter_id, now.timestamp());
        sqlx::query("INSERT INTO invites (inviter_id, code, created_at) VALUES ($1, $2, $3)")
            .bind(inviter_id)
            .bind(&code)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to create invite code")?;
        Ok(code)
    }

    /// Single-statement check-then-set: the WHERE clause only matches an
    /// unconsumed code, so concurrent callers cannot both claim it. Returns
    /// the inviter id on the winning call, None otherwise. Self-invites
    /// never match.
    pub async fn consume_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        code: &str,
        invitee_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE invites SET used_by = $1, used_at = $2
            WHERE code = $3 AND used_by IS NULL AND inviter_id <> $1
            RETURNING inviter_id
            "#,
        )
        .bind(invitee_id)
        .bind(now)
        .bind(code)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to consume invite")?;
        Ok(row.map(|(inviter_id,)| inviter_id))
    }
}
