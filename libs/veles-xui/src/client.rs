use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PanelError;
use crate::session::{PanelAuth, PanelSession};
use crate::transport::{self, FallbackDefaults};

const MS_PER_DAY: i64 = 86_400_000;

/// Fields a panel accepts back on an inbound update. Everything else
/// (traffic counters, client stats) is panel-maintained and must not be
/// echoed, or some forks reject the payload.
const INBOUND_UPDATE_FIELDS: &[&str] = &[
    "id",
    "streamSettings",
    "sniffing",
    "protocol",
    "port",
    "listen",
    "remark",
    "enable",
    "expiryTime",
    "trafficReset",
    "lastTrafficResetTime",
    "tag",
];

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub user_id: i64,
    pub label: String,
    /// 0 = unlimited.
    pub traffic_gb: i64,
    pub days_valid: i64,
    /// Epoch milliseconds; overrides the days_valid computation. Used by
    /// renewals to carry the old expiry forward.
    pub expiry_override_ms: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProvisionedCredential {
    pub client_id: String,
    pub connection_uri: String,
    pub expires_at_ms: i64,
}

/// The seam between the ledger and the remote panel. Production code uses
/// [`XuiClient`]; tests inject failing or recording stands-in.
#[async_trait]
pub trait Provision: Send + Sync {
    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionedCredential, PanelError>;

    /// Best-effort: a stranded remote credential is preferable to blocking
    /// the user-facing deletion flow, so this never fails the caller.
    async fn revoke(&self, client_id: &str);
}

/// Client for one 3x-ui panel inbound: creates and deletes VLESS client
/// credentials and assembles the shareable connection URI.
pub struct XuiClient {
    session: PanelSession,
    inbound_id: i64,
    defaults: FallbackDefaults,
}

impl XuiClient {
    pub fn new(
        base_url: &str,
        auth: PanelAuth,
        inbound_id: i64,
        defaults: FallbackDefaults,
    ) -> Result<Self, PanelError> {
        Ok(Self {
            session: PanelSession::new(base_url, auth)?,
            inbound_id,
            defaults,
        })
    }

    /// Sends one panel call, retrying once after re-authentication if the
    /// session appears to have expired mid-operation.
    async fn send_with_reauth(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, PanelError> {
        self.session.ensure_authenticated().await?;

        let response = self.send_once(method.clone(), path, body).await?;
        if !matches!(response.status().as_u16(), 401 | 403) {
            return Ok(response);
        }

        warn!(
            "panel call {} {} answered {}, re-authenticating once",
            method,
            path,
            response.status()
        );
        self.session.invalidate().await;
        self.session.ensure_authenticated().await?;
        self.send_once(method, path, body).await
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, PanelError> {
        let mut builder = self.session.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .send()
            .await
            .map_err(|e| PanelError::provision(format!("request to {path} failed: {e}")))
    }

    /// Re-fetches the inbound listing and picks out the configured inbound.
    async fn fetch_inbound(&self) -> Result<Value, PanelError> {
        let response = self
            .send_with_reauth(Method::GET, "panel/api/inbounds/list", None)
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| PanelError::provision(format!("inbound list unreadable: {e}")))?;

        body.get("obj")
            .and_then(Value::as_array)
            .and_then(|list| {
                list.iter()
                    .find(|i| i.get("id").and_then(Value::as_i64) == Some(self.inbound_id))
                    .cloned()
            })
            .ok_or(PanelError::InboundNotFound(self.inbound_id))
    }

    async fn try_revoke(&self, client_id: &str) -> Result<(), PanelError> {
        let inbound = self.fetch_inbound().await?;
        let settings = inbound.get("settings").cloned().unwrap_or(Value::Null);

        let (updated_settings, removed) = remove_client_entry(&settings, client_id);
        if !removed {
            info!(
                "client {} not found on inbound {}, skipping",
                client_id, self.inbound_id
            );
            return Ok(());
        }

        let payload = inbound_update_payload(&inbound, &updated_settings);
        let del_payload = json!({
            "id": self.inbound_id,
            "settings": json!({ "clients": [{ "id": client_id }] }).to_string(),
        });

        for (method, path, body) in delete_strategies(self.inbound_id, &payload, &del_payload) {
            match self.send_with_reauth(method.clone(), &path, Some(&body)).await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if status.is_success() && body_reports_success(&text) {
                        info!("deleted client {} via {} {}", client_id, method, path);
                        return Ok(());
                    }
                    debug!(
                        "delete strategy {} {} answered {}: {}",
                        method, path, status, text
                    );
                }
                Err(e) => debug!("delete strategy {} {} failed: {}", method, path, e),
            }
        }

        Err(PanelError::provision(format!(
            "all delete strategies exhausted for client {client_id}"
        )))
    }
}

#[async_trait]
impl Provision for XuiClient {
    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionedCredential, PanelError> {
        let now = Utc::now();
        let client_id = Uuid::new_v4().to_string();
        let email = client_email(request.user_id, now.timestamp());
        let expires_at_ms = expiry_ms(
            now.timestamp_millis(),
            request.days_valid,
            request.expiry_override_ms,
        );

        let client = json!({
            "id": client_id,
            "email": email,
            "enable": true,
            "flow": "xtls-rprx-vision",
            "limitIp": 3,
            "totalGB": quota_bytes(request.traffic_gb),
            "expiryTime": expires_at_ms,
            "tgId": email,
            "subId": "",
            "reset": 0,
        });
        let payload = json!({
            "id": self.inbound_id,
            "settings": json!({ "clients": [client] }).to_string(),
        });

        let response = self
            .send_with_reauth(Method::POST, "panel/api/inbounds/addClient", Some(&payload))
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PanelError::provision(format!(
                "addClient failed: status {status}, body: {body}"
            )));
        }
        if !body_reports_success(&body) {
            return Err(PanelError::provision(format!("addClient rejected: {body}")));
        }

        let inbound = self.fetch_inbound().await?;
        let stream_settings = inbound.get("streamSettings").cloned().unwrap_or(Value::Null);
        let listen = inbound
            .get("listen")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let port = inbound.get("port").and_then(Value::as_u64).unwrap_or(0) as u16;

        let params = transport::resolve(
            &stream_settings,
            listen,
            port,
            self.session.base_url(),
            &self.defaults,
        );
        let label = if request.label.is_empty() {
            email.split('@').next().unwrap_or_default().to_string()
        } else {
            request.label.clone()
        };
        let connection_uri = transport::build_vless_link(&client_id, &label, &params);

        info!(
            "provisioned client {} on inbound {} (expires {})",
            client_id, self.inbound_id, expires_at_ms
        );
        Ok(ProvisionedCredential {
            client_id,
            connection_uri,
            expires_at_ms,
        })
    }

    async fn revoke(&self, client_id: &str) {
        if let Err(e) = self.try_revoke(client_id).await {
            warn!(
                "could not delete client {} from panel, local bookkeeping proceeds: {}",
                client_id, e
            );
        }
    }
}

/// Panel answers carry a `success` flag; treat its absence as success since
/// older forks omit it on 200 responses.
fn body_reports_success(body: &str) -> bool {
    match serde_json::from_str::<Value>(body) {
        Ok(v) => v.get("success").and_then(Value::as_bool) != Some(false),
        Err(_) => true,
    }
}

/// Removes the matching entry from the inbound's nested client list.
/// Returns the rewritten settings object and whether anything was removed;
/// an absent client is a no-op, which is what makes revocation idempotent.
fn remove_client_entry(settings: &Value, client_id: &str) -> (Value, bool) {
    let mut decoded = match settings {
        Value::String(raw) => serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!({})),
        Value::Object(_) => settings.clone(),
        _ => json!({}),
    };
    if !decoded.is_object() {
        decoded = json!({});
    }

    let clients = decoded
        .get("clients")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let kept: Vec<Value> = clients
        .into_iter()
        .filter(|c| c.get("id").and_then(Value::as_str) != Some(client_id))
        .collect();

    let before = decoded
        .get("clients")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let removed = kept.len() != before;
    decoded["clients"] = Value::Array(kept);
    (decoded, removed)
}

/// Builds the inbound update body, copying only the fields panels accept
/// back and substituting the rewritten client list.
fn inbound_update_payload(inbound: &Value, updated_settings: &Value) -> Value {
    let mut payload = serde_json::Map::new();
    for field in INBOUND_UPDATE_FIELDS {
        if let Some(value) = inbound.get(*field) {
            payload.insert((*field).to_string(), value.clone());
        }
    }
    payload.insert(
        "settings".to_string(),
        Value::String(updated_settings.to_string()),
    );
    Value::Object(payload)
}

/// Ordered table of update endpoint variants seen across panel forks,
/// tried until one reports success. Data-driven so a new fork quirk is one
/// more row, not a new code path.
fn delete_strategies(
    inbound_id: i64,
    payload: &Value,
    del_payload: &Value,
) -> Vec<(Method, String, Value)> {
    vec![
        (
            Method::POST,
            format!("panel/api/inbounds/update/{inbound_id}"),
            payload.clone(),
        ),
        (
            Method::POST,
            "panel/api/inbounds/updateAll".to_string(),
            Value::Array(vec![payload.clone()]),
        ),
        (
            Method::POST,
            "panel/api/inbounds/update".to_string(),
            payload.clone(),
        ),
        (
            Method::PUT,
            format!("panel/api/inbounds/{inbound_id}"),
            payload.clone(),
        ),
        (
            Method::POST,
            "panel/api/inbounds/delClient".to_string(),
            del_payload.clone(),
        ),
    ]
}

fn client_email(user_id: i64, now_secs: i64) -> String {
    format!("tg_{user_id}_{now_secs}@xui")
}

fn quota_bytes(traffic_gb: i64) -> i64 {
    if traffic_gb <= 0 {
        0
    } else {
        traffic_gb * (1 << 30)
    }
}

fn expiry_ms(now_ms: i64, days_valid: i64, override_ms: Option<i64>) -> i64 {
    override_ms.unwrap_or(now_ms + days_valid * MS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_zero_means_unlimited() {
        assert_eq!(quota_bytes(0), 0);
        assert_eq!(quota_bytes(-5), 0);
        assert_eq!(quota_bytes(30), 30 * 1_073_741_824);
    }

    #[test]
    fn expiry_override_wins() {
        assert_eq!(expiry_ms(1_000, 30, None), 1_000 + 30 * MS_PER_DAY);
        assert_eq!(expiry_ms(1_000, 30, Some(99)), 99);
    }

    #[test]
    fn labels_stay_unique_across_reprovisioning() {
        assert_eq!(client_email(42, 1_700_000_000), "tg_42_1700000000@xui");
        assert_ne!(
            client_email(42, 1_700_000_000),
            client_email(42, 1_700_000_001)
        );
    }

    #[test]
    fn success_flag_parsing() {
        assert!(body_reports_success(r#"{"success":true,"obj":{}}"#));
        assert!(body_reports_success(r#"{"obj":{}}"#));
        assert!(body_reports_success("not json"));
        assert!(!body_reports_success(r#"{"success":false,"msg":"no"}"#));
    }

    #[test]
    fn remove_client_entry_is_idempotent() {
        let settings = json!({
            "clients": [
                { "id": "keep-me", "email": "a@xui" },
                { "id": "drop-me", "email": "b@xui" }
            ]
        })
        .to_string();

        let (updated, removed) = remove_client_entry(&Value::String(settings), "drop-me");
        assert!(removed);
        let kept = updated["clients"].as_array().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0]["id"], "keep-me");

        // Second pass: already gone, nothing removed, no error.
        let (again, removed_again) = remove_client_entry(&updated, "drop-me");
        assert!(!removed_again);
        assert_eq!(again["clients"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn update_payload_drops_panel_maintained_fields() {
        let inbound = json!({
            "id": 5,
            "port": 443,
            "listen": "",
            "protocol": "vless",
            "remark": "main",
            "enable": true,
            "settings": "{\"clients\":[]}",
            "streamSettings": "{}",
            "sniffing": "{}",
            "tag": "inbound-5",
            "up": 123456,
            "down": 654321,
            "total": 0,
            "clientStats": [{ "id": "x" }]
        });
        let payload = inbound_update_payload(&inbound, &json!({ "clients": [] }));

        assert_eq!(payload["id"], 5);
        assert_eq!(payload["port"], 443);
        assert!(payload.get("up").is_none());
        assert!(payload.get("down").is_none());
        assert!(payload.get("clientStats").is_none());
        assert_eq!(payload["settings"], json!({ "clients": [] }).to_string());
    }

    #[test]
    fn delete_strategies_keep_fallback_order() {
        let payload = json!({ "id": 7 });
        let del_payload = json!({ "id": 7, "settings": "{}" });
        let strategies = delete_strategies(7, &payload, &del_payload);

        let summary: Vec<(String, String)> = strategies
            .iter()
            .map(|(m, p, _)| (m.to_string(), p.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("POST".to_string(), "panel/api/inbounds/update/7".to_string()),
                ("POST".to_string(), "panel/api/inbounds/updateAll".to_string()),
                ("POST".to_string(), "panel/api/inbounds/update".to_string()),
                ("PUT".to_string(), "panel/api/inbounds/7".to_string()),
                ("POST".to_string(), "panel/api/inbounds/delClient".to_string()),
            ]
        );

        // The bulk variant wraps the payload in an array.
        assert!(strategies[1].2.is_array());
        // The dedicated delete endpoint uses its own narrow payload.
        assert_eq!(strategies[4].2, del_payload);
    }
}
