use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription and key lifecycle states. `active` is the only non-terminal
/// state; `expired` is reached by the sweep or lazily on read, `cancelled`
/// by explicit user/admin action.
pub mod subscription_status {
    pub const ACTIVE: &str = "active";
    pub const EXPIRED: &str = "expired";
    pub const CANCELLED: &str = "cancelled";
}

pub mod payment_status {
    pub const PENDING: &str = "pending";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub full_name: Option<String>,
    /// Integer minor currency units, never floats.
    pub balance: i64,
    pub referral_code: Option<String>,
    pub referrer_id: Option<i64>,
    pub invited_count: i64,
    pub is_blacklisted: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One remote 3x-ui panel endpoint this service provisions against.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_token: Option<String>,
    pub inbound_id: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub server_id: i64,
    /// UUID the panel knows the credential by.
    pub client_id: String,
    pub connection_uri: String,
    /// 0 = unlimited.
    pub traffic_gb: i64,
    pub days: i64,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub renewal_used: bool,
    pub created_at: DateTime<Utc>,
}

/// Multi-key product generation: independent credentials, several per user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Key {
    pub id: i64,
    pub user_id: i64,
    pub server_id: i64,
    pub client_id: String,
    pub connection_uri: String,
    pub label: Option<String>,
    pub traffic_gb: i64,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub currency: String,
    pub plan_name: Option<String>,
    pub status: String,
    pub subscription_id: Option<i64>,
    pub method: Option<String>,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invite {
    pub id: i64,
    pub inviter_id: i64,
    pub code: String,
    pub used_by: Option<i64>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
