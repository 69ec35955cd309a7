use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use veles_db::repositories::{InviteRepository, UserRepository};
use veles_db::sqlx::SqlitePool;

use crate::clock::Clock;

/// Invite codes and referral bookkeeping. Consumption is exactly-once per
/// code and at most one referrer per user, both enforced in a single
/// transaction.
pub struct ReferralService {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    referral_bonus: i64,
    invitee_bonus: i64,
    users: UserRepository,
    invites: InviteRepository,
}

impl ReferralService {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        referral_bonus: i64,
        invitee_bonus: i64,
    ) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            invites: InviteRepository::new(pool.clone()),
            pool,
            clock,
            referral_bonus,
            invitee_bonus,
        }
    }

    /// The user's standing invite code, minted on first access.
    pub async fn invite_code(&self, user_id: i64) -> Result<String> {
        self.invites
            .get_or_create_code(user_id, self.clock.now())
            .await
    }

    /// Consumes an invite code on behalf of the invitee. Returns the inviter
    /// id when the invite applied, `None` when the code is unknown, already
    /// used, a self-invite, or the invitee already has a referrer. Every
    /// effect (code consumption, referrer link, counter, both bonuses) lands
    /// in one transaction or not at all.
    pub async fn consume_invite(&self, code: &str, invitee_id: i64) -> Result<Option<i64>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.context("begin invite")?;

        let Some(inviter_id) = self.invites.consume_tx(&mut tx, code, invitee_id, now).await?
        else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        // First referrer wins: if a link already exists the whole invite is
        // backed out, leaving the code unconsumed for someone else.
        if !self
            .users
            .set_referrer_if_unset_tx(&mut tx, invitee_id, inviter_id)
            .await?
        {
            tx.rollback().await.ok();
            info!(
                "user {} already has a referrer; code {} left untouched",
                invitee_id, code
            );
            return Ok(None);
        }

        self.users
            .increment_invited_count_tx(&mut tx, inviter_id)
            .await?;
        if self.referral_bonus > 0 {
            self.users
                .credit_balance_tx(&mut tx, inviter_id, self.referral_bonus)
                .await?;
        }
        if self.invitee_bonus > 0 {
            self.users
                .credit_balance_tx(&mut tx, invitee_id, self.invitee_bonus)
                .await?;
        }

        tx.commit().await.context("commit invite")?;
        info!(
            "invite {} consumed: user {} referred by {}",
            code, invitee_id, inviter_id
        );
        Ok(Some(inviter_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::services::testutil::{seed_user, test_pool};

    fn service(pool: &SqlitePool) -> ReferralService {
        ReferralService::new(pool.clone(), Arc::new(SystemClock), 5000, 2500)
    }

    #[tokio::test]
    async fn invite_applies_once_with_both_bonuses() {
        let pool = test_pool().await;
        seed_user(&pool, 10, 0).await; // inviter
        seed_user(&pool, 20, 0).await; // invitee
        seed_user(&pool, 30, 0).await; // latecomer
        let svc = service(&pool);

        let code = svc.invite_code(10).await.unwrap();
        assert_eq!(svc.consume_invite(&code, 20).await.unwrap(), Some(10));

        let users = UserRepository::new(pool.clone());
        let inviter = users.get(10).await.unwrap().unwrap();
        let invitee = users.get(20).await.unwrap().unwrap();
        assert_eq!(inviter.balance, 5000);
        assert_eq!(inviter.invited_count, 1);
        assert_eq!(invitee.balance, 2500);
        assert_eq!(invitee.referrer_id, Some(10));

        // Consumed codes stay consumed: nobody else gets the bonus.
        assert_eq!(svc.consume_invite(&code, 30).await.unwrap(), None);
        assert_eq!(users.get(10).await.unwrap().unwrap().balance, 5000);
        assert_eq!(users.get(30).await.unwrap().unwrap().balance, 0);
    }

    #[tokio::test]
    async fn first_referrer_wins_and_losing_code_survives() {
        let pool = test_pool().await;
        seed_user(&pool, 10, 0).await;
        seed_user(&pool, 11, 0).await;
        seed_user(&pool, 20, 0).await;
        let svc = service(&pool);

        let first = svc.invite_code(10).await.unwrap();
        let second = svc.invite_code(11).await.unwrap();

        assert_eq!(svc.consume_invite(&first, 20).await.unwrap(), Some(10));
        assert_eq!(svc.consume_invite(&second, 20).await.unwrap(), None);

        let users = UserRepository::new(pool.clone());
        assert_eq!(users.get(20).await.unwrap().unwrap().referrer_id, Some(10));
        // The rejected attempt rolled back, so the second code is still open.
        let invites = InviteRepository::new(pool.clone());
        assert!(invites.get_by_code(&second).await.unwrap().unwrap().used_by.is_none());
        assert_eq!(users.get(11).await.unwrap().unwrap().balance, 0);
    }

    #[tokio::test]
    async fn self_invite_is_refused() {
        let pool = test_pool().await;
        seed_user(&pool, 10, 0).await;
        let svc = service(&pool);

        let code = svc.invite_code(10).await.unwrap();
        assert_eq!(svc.consume_invite(&code, 10).await.unwrap(), None);

        let users = UserRepository::new(pool.clone());
        let user = users.get(10).await.unwrap().unwrap();
        assert_eq!(user.balance, 0);
        assert_eq!(user.invited_count, 0);
    }
}
