use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info};
use veles_db::models::store::Subscription;
use veles_db::repositories::{
    KeyRepository, PaymentRepository, SubscriptionRepository, UserRepository,
};
use veles_db::sqlx::SqlitePool;
use veles_xui::{Provision, ProvisionRequest, ProvisionedCredential};

use crate::clock::Clock;
use crate::services::{EligibilityError, Plan, ServiceError, is_unique_violation};

/// Subscription lifecycle: eligibility, purchase, renewal, cancellation and
/// the expiry sweep. The hard ordering rule everywhere: the remote
/// credential must exist before any money moves or any ledger row appears.
pub struct SubscriptionService {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    renewal_window_days: i64,
    users: UserRepository,
    subscriptions: SubscriptionRepository,
    keys: KeyRepository,
    payments: PaymentRepository,
}

impl SubscriptionService {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, renewal_window_days: i64) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            subscriptions: SubscriptionRepository::new(pool.clone()),
            keys: KeyRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool.clone()),
            pool,
            clock,
            renewal_window_days,
        }
    }

    /// Active subscription with lazy expiry: an overdue row is flipped to
    /// expired on read and reported as absent, so callers never act on a
    /// subscription the sweep has not reached yet.
    pub async fn active_subscription(
        &self,
        user_id: i64,
    ) -> Result<Option<Subscription>, ServiceError> {
        let Some(sub) = self.subscriptions.active_by_user(user_id).await? else {
            return Ok(None);
        };
        if sub.end_date < self.clock.now() {
            self.subscriptions.mark_expired(sub.id).await?;
            info!(
                "subscription {} for user {} lapsed, expired on read",
                sub.id, user_id
            );
            return Ok(None);
        }
        Ok(Some(sub))
    }

    pub async fn evaluate_purchase_eligibility(
        &self,
        user_id: i64,
        price: i64,
    ) -> Result<(), ServiceError> {
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| ServiceError::Internal(anyhow!("unknown user {user_id}")))?;

        if user.is_blacklisted {
            return Err(EligibilityError::Blacklisted.into());
        }
        if self.active_subscription(user_id).await?.is_some() {
            return Err(EligibilityError::DuplicateActiveSubscription.into());
        }
        if user.balance < price {
            return Err(EligibilityError::InsufficientBalance {
                shortfall: price - user.balance,
            }
            .into());
        }
        Ok(())
    }

    /// Full purchase flow. A provisioning failure leaves the ledger
    /// untouched apart from the payment row flipping to failed; a ledger
    /// failure after provisioning triggers a best-effort revoke.
    pub async fn purchase(
        &self,
        panel: &dyn Provision,
        user_id: i64,
        server_id: i64,
        plan: &Plan,
    ) -> Result<Subscription, ServiceError> {
        let now = self.clock.now();
        self.evaluate_purchase_eligibility(user_id, plan.price)
            .await?;

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
            label: plan.name.clone(),
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
        let end_date = credential_end_date(&credential)?;

        let mut tx = self.pool.begin().await.context("begin purchase")?;

        if !self
            .users
            .try_deduct_balance_tx(&mut tx, user_id, plan.price)
            .await?
        {
            tx.rollback().await.ok();
            return self
                .abort_after_provision(panel, &credential, payment_id, {
                    let balance = self
                        .users
                        .get(user_id)
                        .await?
                        .map(|u| u.balance)
                        .unwrap_or_default();
                    EligibilityError::InsufficientBalance {
                        shortfall: plan.price - balance,
                    }
                })
                .await;
        }

        let subscription_id = match self
            .subscriptions
            .create_tx(
                &mut tx,
                user_id,
                server_id,
                &credential.client_id,
                &credential.connection_uri,
                plan.traffic_gb,
                plan.days,
                now,
                end_date,
            )
            .await
        {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.ok();
                return self
                    .abort_after_provision(
                        panel,
                        &credential,
                        payment_id,
                        EligibilityError::DuplicateActiveSubscription,
                    )
                    .await;
            }
            Err(e) => {
                tx.rollback().await.ok();
                panel.revoke(&credential.client_id).await;
                self.payments.mark_failed(payment_id).await.ok();
                return Err(anyhow::Error::from(e)
                    .context("insert subscription")
                    .into());
            }
        };

        if let Err(e) = self
            .payments
            .mark_completed_tx(&mut tx, payment_id, Some(subscription_id), now)
            .await
        {
            tx.rollback().await.ok();
            panel.revoke(&credential.client_id).await;
            self.payments.mark_failed(payment_id).await.ok();
            return Err(e.into());
        }

        if let Err(e) = tx.commit().await {
            panel.revoke(&credential.client_id).await;
            self.payments.mark_failed(payment_id).await.ok();
            error!(
                "purchase commit failed for user {}; credential {} revoked, reconcile if the revoke also failed: {}",
                user_id, credential.client_id, e
            );
            return Err(anyhow::Error::from(e).context("commit purchase").into());
        }

        info!(
            "user {} purchased '{}' on server {}: subscription {}, payment {}",
            user_id, plan.name, server_id, subscription_id, payment_id
        );
        self.fetch(subscription_id).await
    }

    /// Renewal: allowed once per cycle, only inside the configured window
    /// before expiry. Provisions a fresh credential whose expiry carries the
    /// old end date forward, then retires the old one.
    pub async fn renew(
        &self,
        panel: &dyn Provision,
        user_id: i64,
        plan: &Plan,
    ) -> Result<Subscription, ServiceError> {
        let now = self.clock.now();
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| ServiceError::Internal(anyhow!("unknown user {user_id}")))?;
        if user.is_blacklisted {
            return Err(EligibilityError::Blacklisted.into());
        }

        let current = self
            .active_subscription(user_id)
            .await?
            .ok_or(EligibilityError::NoActiveSubscription)?;
        if current.renewal_used {
            return Err(EligibilityError::RenewalAlreadyUsed.into());
        }
        let remaining = current.end_date - now;
        if remaining > Duration::days(self.renewal_window_days) {
            return Err(EligibilityError::RenewalWindowNotOpen {
                days_left: remaining.num_days(),
            }
            .into());
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

        let new_end = current.end_date + Duration::days(plan.days);
        let request = ProvisionRequest {
            user_id,
            label: plan.name.clone(),
            traffic_gb: plan.traffic_gb,
            days_valid: plan.days,
            expiry_override_ms: Some(new_end.timestamp_millis()),
        };
        let credential = match panel.provision(&request).await {
            Ok(credential) => credential,
            Err(e) => {
                self.payments.mark_failed(payment_id).await?;
                return Err(e.into());
            }
        };

        let mut tx = self.pool.begin().await.context("begin renewal")?;

        if !self
            .users
            .try_deduct_balance_tx(&mut tx, user_id, plan.price)
            .await?
        {
            tx.rollback().await.ok();
            return self
                .abort_after_provision(panel, &credential, payment_id, {
                    let balance = self
                        .users
                        .get(user_id)
                        .await?
                        .map(|u| u.balance)
                        .unwrap_or_default();
                    EligibilityError::InsufficientBalance {
                        shortfall: plan.price - balance,
                    }
                })
                .await;
        }

        let applied = match self
            .subscriptions
            .apply_renewal_tx(
                &mut tx,
                current.id,
                &credential.client_id,
                &credential.connection_uri,
                new_end,
            )
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                tx.rollback().await.ok();
                panel.revoke(&credential.client_id).await;
                self.payments.mark_failed(payment_id).await.ok();
                return Err(e.into());
            }
        };
        // A concurrent renewal may have claimed the cycle between our read
        // and this statement; the guarded UPDATE is the arbiter, exactly as
        // the unique index is for purchases.
        if !applied {
            tx.rollback().await.ok();
            return self
                .abort_after_provision(
                    panel,
                    &credential,
                    payment_id,
                    EligibilityError::RenewalAlreadyUsed,
                )
                .await;
        }

        if let Err(e) = self
            .payments
            .mark_completed_tx(&mut tx, payment_id, Some(current.id), now)
            .await
        {
            tx.rollback().await.ok();
            panel.revoke(&credential.client_id).await;
            self.payments.mark_failed(payment_id).await.ok();
            return Err(e.into());
        }

        if let Err(e) = tx.commit().await {
            panel.revoke(&credential.client_id).await;
            self.payments.mark_failed(payment_id).await.ok();
            error!(
                "renewal commit failed for subscription {}; new credential {} revoked: {}",
                current.id, credential.client_id, e
            );
            return Err(anyhow::Error::from(e).context("commit renewal").into());
        }

        // The ledger already points at the new credential; the old one is
        // now garbage on the panel and its removal is best-effort.
        panel.revoke(&current.client_id).await;

        info!(
            "user {} renewed subscription {} until {}",
            user_id, current.id, new_end
        );
        self.fetch(current.id).await
    }

    /// User-facing cancellation: the row flips first, then the remote
    /// credential is removed best-effort.
    pub async fn cancel(&self, panel: &dyn Provision, user_id: i64) -> Result<(), ServiceError> {
        // Lazy-expiry read: an overdue row must end up expired, not
        // cancelled.
        let current = self
            .active_subscription(user_id)
            .await?
            .ok_or(EligibilityError::NoActiveSubscription)?;

        self.subscriptions.cancel(current.id).await?;
        panel.revoke(&current.client_id).await;
        info!("user {} cancelled subscription {}", user_id, current.id);
        Ok(())
    }

    /// Flips every overdue subscription and key. Returns the counts.
    pub async fn sweep_expired(&self) -> Result<(u64, u64), ServiceError> {
        let now = self.clock.now();
        let subs = self.subscriptions.sweep_expired(now).await?;
        let keys = self.keys.sweep_expired(now).await?;
        Ok((subs, keys))
    }

    async fn fetch(&self, id: i64) -> Result<Subscription, ServiceError> {
        self.subscriptions
            .get_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::Internal(anyhow!("subscription {id} vanished")))
    }

    /// Shared tail for rejections discovered after the remote credential was
    /// already created: undo the remote side, fail the payment, surface the
    /// rejection.
    async fn abort_after_provision(
        &self,
        panel: &dyn Provision,
        credential: &ProvisionedCredential,
        payment_id: i64,
        rejection: EligibilityError,
    ) -> Result<Subscription, ServiceError> {
        panel.revoke(&credential.client_id).await;
        self.payments.mark_failed(payment_id).await?;
        info!(
            "aborted after provisioning ({}): credential {} revoked, payment {} failed",
            rejection.code(),
            credential.client_id,
            payment_id
        );
        Err(rejection.into())
    }
}

fn credential_end_date(credential: &ProvisionedCredential) -> Result<DateTime<Utc>, ServiceError> {
    DateTime::from_timestamp_millis(credential.expires_at_ms).ok_or_else(|| {
        ServiceError::Internal(anyhow!(
            "panel returned unrepresentable expiry {}",
            credential.expires_at_ms
        ))
    })
}
