use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use veles_db::repositories::{ServerRepository, UserRepository};
use veles_db::sqlx::SqlitePool;
use veles_xui::{PanelError, Provision, ProvisionRequest, ProvisionedCredential};

use crate::services::Plan;

/// In-memory stand-in for the panel: hands out sequential credentials and
/// records every call, with an optional injected provisioning fault.
pub struct FakePanel {
    fail_provision: AtomicBool,
    provisioned: Mutex<Vec<String>>,
    revoked: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl FakePanel {
    pub fn new() -> Self {
        Self {
            fail_provision: AtomicBool::new(false),
            provisioned: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn failing() -> Self {
        let panel = Self::new();
        panel.fail_provision.store(true, Ordering::SeqCst);
        panel
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.provisioned.lock().unwrap().clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provision for FakePanel {
    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionedCredential, PanelError> {
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(PanelError::provision("injected panel failure"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let client_id = format!("fake-client-{n}");
        self.provisioned.lock().unwrap().push(client_id.clone());

        let expires_at_ms = request.expiry_override_ms.unwrap_or_else(|| {
            Utc::now().timestamp_millis() + request.days_valid * 86_400_000
        });
        Ok(ProvisionedCredential {
            connection_uri: format!("vless://{client_id}@node.test:443/?security=reality#test"),
            client_id,
            expires_at_ms,
        })
    }

    async fn revoke(&self, client_id: &str) {
        self.revoked.lock().unwrap().push(client_id.to_string());
    }
}

pub async fn test_pool() -> SqlitePool {
    veles_db::connect("sqlite::memory:")
        .await
        .expect("in-memory store")
}

pub async fn seed_user(pool: &SqlitePool, user_id: i64, balance: i64) {
    let users = UserRepository::new(pool.clone());
    users
        .upsert(user_id, Some("tester"), Some("Test User"), Utc::now())
        .await
        .expect("seed user");
    if balance != 0 {
        users.adjust_balance(user_id, balance).await.expect("seed balance");
    }
}

pub async fn seed_server(pool: &SqlitePool) -> i64 {
    ServerRepository::new(pool.clone())
        .create(
            "test-node",
            "https://panel.test:2053/",
            Some("admin"),
            Some("admin"),
            None,
            1,
            Utc::now(),
        )
        .await
        .expect("seed server")
}

pub fn plan(price: i64) -> Plan {
    Plan {
        name: "monthly".to_string(),
        price,
        traffic_gb: 30,
        days: 30,
    }
}
