use std::env;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Context, Result};
use veles_xui::FallbackDefaults;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Renewal opens this many days before a subscription's end date.
    pub renewal_window_days: i64,
    /// Active standalone keys allowed per user.
    pub key_limit: i64,
    /// Balance credits in minor units, paid out when an invite is consumed.
    pub referral_bonus: i64,
    pub invitee_bonus: i64,
    /// UTC hour of the daily expiry sweep.
    pub sweep_hour: u32,
    pub fallbacks: FallbackDefaults,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("VELES_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "sqlite://veles.db".to_string());

        let mut fallbacks = FallbackDefaults::default();
        if let Ok(v) = env::var("VELES_FALLBACK_SHORT_ID") {
            fallbacks.short_id = v;
        }
        if let Ok(v) = env::var("VELES_FALLBACK_SNI") {
            fallbacks.server_name = v;
        }
        if let Ok(v) = env::var("VELES_FALLBACK_FINGERPRINT") {
            fallbacks.fingerprint = v;
        }

        let sweep_hour: u32 = env_parse("VELES_SWEEP_HOUR", 3)?;
        anyhow::ensure!(sweep_hour < 24, "VELES_SWEEP_HOUR must be 0..=23");

        Ok(Self {
            database_url,
            renewal_window_days: env_parse("VELES_RENEWAL_WINDOW_DAYS", 3)?,
            key_limit: env_parse("VELES_KEY_LIMIT", 3)?,
            referral_bonus: env_parse("VELES_REFERRAL_BONUS", 5000)?,
            invitee_bonus: env_parse("VELES_INVITEE_BONUS", 2500)?,
            sweep_hour,
            fallbacks,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={raw} is invalid: {e}")),
        Err(_) => Ok(default),
    }
    .with_context(|| format!("Failed to read {key}"))
}
