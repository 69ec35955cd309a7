use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::DateTime;
use tracing::{error, info};
use veles_db::models::store::Key;
use veles_db::repositories::{KeyRepository, PaymentRepository, UserRepository};
use veles_db::sqlx::SqlitePool;
use veles_xui::{Provision, ProvisionRequest};

use crate::clock::Clock;
use crate::services::{EligibilityError, Plan, ServiceError};

/// Standalone keys: independent credentials, several per user, capped by a
/// configurable limit. Swapping a key replaces its credential in place and
/// is exempt from the cap.
pub struct KeyService {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    key_limit: i64,
    users: UserRepository,
    keys: KeyRepository,
    payments: PaymentRepository,
}

impl KeyService {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, key_limit: i64) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            keys: KeyRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool.clone()),
            pool,
            clock,
            key_limit,
        }
    }

    pub async fn active_keys(&self, user_id: i64) -> Result<Vec<Key>, ServiceError> {
        Ok(self.keys.active_by_user(user_id).await?)
    }

    pub async fn create_key(
        &self,
        panel: &dyn Provision,
        user_id: i64,
        server_id: i64,
        plan: &Plan,
        label: Option<&str>,
    ) -> Result<Key, ServiceError> {
        let now = self.clock.now();
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| ServiceError::Internal(anyhow!("unknown user {user_id}")))?;
        if user.is_blacklisted {
            return Err(EligibilityError::Blacklisted.into());
        }
        if self.keys.active_by_user(user_id).await?.len() as i64 >= self.key_limit {
            return Err(EligibilityError::KeyLimitReached.into());
        }
        if user.balance < plan.price {
            return Err(EligibilityError::InsufficientBalance {
                shortfall: plan.price - user.balance,
            }
            .into());
        }

        let payment_id = self
            .payments
            .create_pending(
                user_id,
                plan.price,
                "RUB",
                Some(&plan.name),
                Some("balance"),
                None,
                now,
            )
            .await?;

        let request = ProvisionRequest {
            user_id,
            label: label.unwrap_or(&plan.name).to_string(),
            traffic_gb: plan.traffic_gb,
            days_valid: plan.days,
            expiry_override_ms: None,
        };
        let credential = match panel.provision(&request).await {
            Ok(credential) => credential,
            Err(e) => {
                self.payments.mark_failed(payment_id).await?;
                return Err(e.into());
            }
        };
        let end_date = DateTime::from_timestamp_millis(credential.expires_at_ms)
            .ok_or_else(|| ServiceError::Internal(anyhow!("unrepresentable expiry")))?;

        let mut tx = self.pool.begin().await.context("begin key purchase")?;

        // Recount under the transaction; the precheck above only exists to
        // skip the panel round trip on an obviously full account.
        if self.keys.count_active_tx(&mut tx, user_id).await? >= self.key_limit {
            tx.rollback().await.ok();
            panel.revoke(&credential.client_id).await;
            self.payments.mark_failed(payment_id).await?;
            return Err(EligibilityError::KeyLimitReached.into());
        }
        if !self
            .users
            .try_deduct_balance_tx(&mut tx, user_id, plan.price)
            .await?
        {
            tx.rollback().await.ok();
            panel.revoke(&credential.client_id).await;
            self.payments.mark_failed(payment_id).await?;
            return Err(EligibilityError::InsufficientBalance {
                shortfall: plan.price,
            }
            .into());
        }

        let ledger = async {
            let key_id = self
                .keys
                .create_tx(
                    &mut tx,
                    user_id,
                    server_id,
                    &credential.client_id,
                    &credential.connection_uri,
                    label,
                    plan.traffic_gb,
                    now,
                    end_date,
                )
                .await?;
            self.payments
                .mark_completed_tx(&mut tx, payment_id, None, now)
                .await?;
            Ok::<i64, anyhow::Error>(key_id)
        }
        .await;
        let key_id = match ledger {
            Ok(id) => id,
            Err(e) => {
                tx.rollback().await.ok();
                panel.revoke(&credential.client_id).await;
                self.payments.mark_failed(payment_id).await.ok();
                return Err(e.into());
            }
        };

        if let Err(e) = tx.commit().await {
            panel.revoke(&credential.client_id).await;
            self.payments.mark_failed(payment_id).await.ok();
            error!(
                "key purchase commit failed for user {}; credential {} revoked: {}",
                user_id, credential.client_id, e
            );
            return Err(anyhow::Error::from(e).context("commit key purchase").into());
        }

        info!("user {} created key {} on server {}", user_id, key_id, server_id);
        self.fetch(key_id).await
    }

    /// Remote first, row second: a credential that outlives its row is a
    /// leak the revoke warning makes visible, a row without a credential is
    /// a dead link the user will report.
    pub async fn delete_key(
        &self,
        panel: &dyn Provision,
        user_id: i64,
        key_id: i64,
    ) -> Result<(), ServiceError> {
        let key = self.owned_key(user_id, key_id).await?;
        panel.revoke(&key.client_id).await;
        self.keys.delete(key_id).await?;
        info!("user {} deleted key {}", user_id, key_id);
        Ok(())
    }

    /// Replaces a key's credential without touching its expiry. Exempt from
    /// the active-key cap: the count is unchanged by construction.
    pub async fn swap_key(
        &self,
        panel: &dyn Provision,
        user_id: i64,
        key_id: i64,
    ) -> Result<Key, ServiceError> {
        let old = self.owned_key(user_id, key_id).await?;
        let now = self.clock.now();

        let request = ProvisionRequest {
            user_id,
            label: old.label.clone().unwrap_or_default(),
            traffic_gb: old.traffic_gb,
            days_valid: (old.end_date - now).num_days().max(0),
            expiry_override_ms: Some(old.end_date.timestamp_millis()),
        };
        let credential = panel.provision(&request).await?;

        let mut tx = self.pool.begin().await.context("begin key swap")?;
        let ledger = async {
            self.keys.delete_tx(&mut tx, old.id).await?;
            self.keys
                .create_tx(
                    &mut tx,
                    user_id,
                    old.server_id,
                    &credential.client_id,
                    &credential.connection_uri,
                    old.label.as_deref(),
                    old.traffic_gb,
                    now,
                    old.end_date,
                )
                .await
        }
        .await;
        let new_id = match ledger {
            Ok(id) => id,
            Err(e) => {
                tx.rollback().await.ok();
                panel.revoke(&credential.client_id).await;
                return Err(e.into());
            }
        };

        if let Err(e) = tx.commit().await {
            panel.revoke(&credential.client_id).await;
            error!(
                "key swap commit failed for key {}; new credential {} revoked: {}",
                old.id, credential.client_id, e
            );
            return Err(anyhow::Error::from(e).context("commit key swap").into());
        }

        panel.revoke(&old.client_id).await;
        info!("user {} swapped key {} -> {}", user_id, old.id, new_id);
        self.fetch(new_id).await
    }

    async fn owned_key(&self, user_id: i64, key_id: i64) -> Result<Key, ServiceError> {
        let key = self
            .keys
            .get_by_id(key_id)
            .await?
            .ok_or_else(|| ServiceError::Internal(anyhow!("unknown key {key_id}")))?;
        if key.user_id != user_id {
            return Err(ServiceError::Internal(anyhow!(
                "key {key_id} does not belong to user {user_id}"
            )));
        }
        Ok(key)
    }

    async fn fetch(&self, id: i64) -> Result<Key, ServiceError> {
        self.keys
            .get_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::Internal(anyhow!("key {id} vanished")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::services::testutil::{FakePanel, plan, seed_server, seed_user, test_pool};

    fn service(pool: &SqlitePool) -> KeyService {
        KeyService::new(pool.clone(), Arc::new(SystemClock), 3)
    }

    #[tokio::test]
    async fn fourth_key_is_rejected() {
        let pool = test_pool().await;
        let server_id = seed_server(&pool).await;
        seed_user(&pool, 1, 10_000).await;
        let svc = service(&pool);
        let panel = FakePanel::new();

        for _ in 0..3 {
            svc.create_key(&panel, 1, server_id, &plan(400), None)
                .await
                .unwrap();
        }
        let err = svc
            .create_key(&panel, 1, server_id, &plan(400), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Rejected(EligibilityError::KeyLimitReached)
        ));

        // Precheck fired before the panel was asked for a fourth credential.
        assert_eq!(panel.provisioned().len(), 3);
        let users = UserRepository::new(pool.clone());
        assert_eq!(users.get(1).await.unwrap().unwrap().balance, 10_000 - 3 * 400);
    }

    #[tokio::test]
    async fn swap_is_exempt_from_the_cap_and_keeps_expiry() {
        let pool = test_pool().await;
        let server_id = seed_server(&pool).await;
        seed_user(&pool, 1, 10_000).await;
        let svc = service(&pool);
        let panel = FakePanel::new();

        let mut first = None;
        for _ in 0..3 {
            let key = svc
                .create_key(&panel, 1, server_id, &plan(400), Some("phone"))
                .await
                .unwrap();
            first.get_or_insert(key);
        }
        let old = first.unwrap();

        let swapped = svc.swap_key(&panel, 1, old.id).await.unwrap();
        assert_ne!(swapped.client_id, old.client_id);
        assert_eq!(swapped.label.as_deref(), Some("phone"));
        assert_eq!(
            swapped.end_date.timestamp_millis(),
            old.end_date.timestamp_millis()
        );
        assert!(panel.revoked().contains(&old.client_id));

        // Still exactly three active keys, and no extra charge.
        assert_eq!(svc.active_keys(1).await.unwrap().len(), 3);
        let users = UserRepository::new(pool.clone());
        assert_eq!(users.get(1).await.unwrap().unwrap().balance, 10_000 - 3 * 400);
    }

    #[tokio::test]
    async fn delete_revokes_before_dropping_the_row() {
        let pool = test_pool().await;
        let server_id = seed_server(&pool).await;
        seed_user(&pool, 1, 1_000).await;
        let svc = service(&pool);
        let panel = FakePanel::new();

        let key = svc
            .create_key(&panel, 1, server_id, &plan(400), None)
            .await
            .unwrap();
        svc.delete_key(&panel, 1, key.id).await.unwrap();

        assert!(panel.revoked().contains(&key.client_id));
        assert!(svc.active_keys(1).await.unwrap().is_empty());
    }
}
