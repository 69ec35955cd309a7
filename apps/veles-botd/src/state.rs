use std::sync::Arc;

use anyhow::Result;
use veles_db::models::store::Server;
use veles_db::repositories::{PaymentRepository, ServerRepository, UserRepository};
use veles_db::sqlx::SqlitePool;
use veles_xui::{PanelAuth, XuiClient};

use crate::clock::Clock;
use crate::config::Config;
use crate::services::billing_service::BillingService;
use crate::services::key_service::KeyService;
use crate::services::referral_service::ReferralService;
use crate::services::subscription_service::SubscriptionService;

/// Explicit application context passed to every collaborator; nothing in
/// this crate reads ambient global state.
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub users: UserRepository,
    pub servers: ServerRepository,
    pub payments: PaymentRepository,
    pub subscriptions: SubscriptionService,
    pub keys: KeyService,
    pub referrals: ReferralService,
    pub billing: BillingService,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            servers: ServerRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool.clone()),
            subscriptions: SubscriptionService::new(
                pool.clone(),
                clock.clone(),
                config.renewal_window_days,
            ),
            keys: KeyService::new(pool.clone(), clock.clone(), config.key_limit),
            referrals: ReferralService::new(
                pool.clone(),
                clock.clone(),
                config.referral_bonus,
                config.invitee_bonus,
            ),
            billing: BillingService::new(pool.clone(), clock.clone()),
            pool,
            config,
            clock,
        }
    }

    /// Builds a panel client for one configured server. Token auth wins over
    /// credentials when both are set.
    pub fn panel_for(&self, server: &Server) -> Result<XuiClient> {
        let auth = match (&server.api_token, &server.username, &server.password) {
            (Some(token), _, _) if !token.is_empty() => PanelAuth::Token(token.clone()),
            (_, Some(username), Some(password)) => PanelAuth::Credentials {
                username: username.clone(),
                password: password.clone(),
            },
            _ => anyhow::bail!(
                "Server {} ({}) has neither an API token nor credentials",
                server.id,
                server.name
            ),
        };

        Ok(XuiClient::new(
            &server.base_url,
            auth,
            server.inbound_id,
            self.config.fallbacks.clone(),
        )?)
    }
}
