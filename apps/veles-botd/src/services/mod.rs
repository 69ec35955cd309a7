use thiserror::Error;
use veles_xui::PanelError;

pub mod billing_service;
pub mod key_service;
pub mod referral_service;
pub mod subscription_service;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testutil;

/// A purchasable product: one price, one quota, one validity period.
#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    /// Minor currency units.
    pub price: i64,
    /// 0 = unlimited.
    pub traffic_gb: i64,
    pub days: i64,
}

/// Business rejections. Each carries a stable machine-readable code so the
/// chat surface can map it to a message without parsing display text.
#[derive(Debug, Error)]
pub enum EligibilityError {
    #[error("balance is short by {shortfall}")]
    InsufficientBalance { shortfall: i64 },
    #[error("an active subscription already exists")]
    DuplicateActiveSubscription,
    #[error("no active subscription")]
    NoActiveSubscription,
    #[error("renewal opens later; {days_left} day(s) remain")]
    RenewalWindowNotOpen { days_left: i64 },
    #[error("renewal already used for this cycle")]
    RenewalAlreadyUsed,
    #[error("active key limit reached")]
    KeyLimitReached,
    #[error("user is blacklisted")]
    Blacklisted,
}

impl EligibilityError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::DuplicateActiveSubscription => "duplicate_active_subscription",
            Self::NoActiveSubscription => "no_active_subscription",
            Self::RenewalWindowNotOpen { .. } => "renewal_window_not_open",
            Self::RenewalAlreadyUsed => "renewal_already_used",
            Self::KeyLimitReached => "key_limit_reached",
            Self::Blacklisted => "blacklisted",
        }
    }
}

/// Service-level failure taxonomy: a business rejection, a remote panel
/// failure, or a storage/internal fault.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Rejected(#[from] EligibilityError),
    #[error(transparent)]
    Panel(#[from] PanelError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub(crate) fn is_unique_violation(e: &veles_db::sqlx::Error) -> bool {
    matches!(e, veles_db::sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The chat surface keys its messages off these; renaming one is a
    // breaking change for it.
    #[test]
    fn rejection_codes_are_stable() {
        assert_eq!(
            EligibilityError::InsufficientBalance { shortfall: 1 }.code(),
            "insufficient_balance"
        );
        assert_eq!(
            EligibilityError::DuplicateActiveSubscription.code(),
            "duplicate_active_subscription"
        );
        assert_eq!(
            EligibilityError::NoActiveSubscription.code(),
            "no_active_subscription"
        );
        assert_eq!(
            EligibilityError::RenewalWindowNotOpen { days_left: 5 }.code(),
            "renewal_window_not_open"
        );
        assert_eq!(
            EligibilityError::RenewalAlreadyUsed.code(),
            "renewal_already_used"
        );
        assert_eq!(EligibilityError::KeyLimitReached.code(), "key_limit_reached");
        assert_eq!(EligibilityError::Blacklisted.code(), "blacklisted");
    }
}
