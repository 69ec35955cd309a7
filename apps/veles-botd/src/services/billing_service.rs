use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use tracing::info;
use veles_db::models::store::Payment;
use veles_db::repositories::{PaymentRepository, UserRepository};
use veles_db::sqlx::SqlitePool;

use crate::clock::Clock;

/// Balance top-ups and payment history. The provider callback side: by the
/// time this runs the money has already arrived, so the ledger entry is
/// written completed.
pub struct BillingService {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    users: UserRepository,
    payments: PaymentRepository,
}

impl BillingService {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool.clone()),
            pool,
            clock,
        }
    }

    /// Credits the balance and records the completed payment atomically.
    /// `external_id` is the provider's transaction reference.
    pub async fn record_topup(
        &self,
        user_id: i64,
        amount: i64,
        method: &str,
        external_id: Option<&str>,
    ) -> Result<i64> {
        ensure!(amount > 0, "top-up amount must be positive, got {amount}");
        let now = self.clock.now();

        let mut tx = self.pool.begin().await.context("begin top-up")?;
        self.users.credit_balance_tx(&mut tx, user_id, amount).await?;
        let payment_id = self
            .payments
            .create_completed_tx(&mut tx, user_id, amount, "RUB", Some(method), external_id, now)
            .await?;
        tx.commit().await.context("commit top-up")?;

        info!(
            "user {} topped up {} via {} (payment {})",
            user_id, amount, method, payment_id
        );
        Ok(payment_id)
    }

    pub async fn history(&self, user_id: i64) -> Result<Vec<Payment>> {
        self.payments.by_user(user_id).await
    }
}
