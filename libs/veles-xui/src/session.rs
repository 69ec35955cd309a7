use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::PanelError;

/// How a panel expects to be talked to. Most 3x-ui deployments use the
/// session cookie obtained from a form login; some forks issue a static
/// bearer token instead.
#[derive(Debug, Clone)]
pub enum PanelAuth {
    Token(String),
    Credentials { username: String, password: String },
}

/// Authenticated HTTP context for one panel endpoint. One session per
/// configured server; the cookie jar lives as long as the session does.
pub struct PanelSession {
    http: Client,
    base_url: String,
    auth: PanelAuth,
    authorized: Mutex<bool>,
}

impl PanelSession {
    pub fn new(base_url: &str, auth: PanelAuth) -> Result<Self, PanelError> {
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };

        // Panels routinely run on self-signed certs, so certificate
        // validation is off, matching how operators actually deploy them.
        let http = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(20))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| PanelError::authentication(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            auth,
            authorized: Mutex::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, self.endpoint(path));
        if let PanelAuth::Token(token) = &self.auth {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Idempotent: only the first caller in the session's lifetime performs
    /// the login. The mutex serializes racing callers so a login form is
    /// never double-submitted.
    pub async fn ensure_authenticated(&self) -> Result<(), PanelError> {
        let mut authorized = self.authorized.lock().await;
        if *authorized {
            return Ok(());
        }
        self.login().await?;
        *authorized = true;
        Ok(())
    }

    /// Drops session state so the next call logs in again. Used after a
    /// mid-operation 401/403, which usually means the cookie expired.
    pub async fn invalidate(&self) {
        *self.authorized.lock().await = false;
    }

    async fn login(&self) -> Result<(), PanelError> {
        let (username, password) = match &self.auth {
            PanelAuth::Token(_) => {
                debug!("panel {}: static token configured, no login needed", self.base_url);
                return Ok(());
            }
            PanelAuth::Credentials { username, password } => (username, password),
        };

        let response = self
            .http
            .post(self.endpoint("login"))
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(|e| PanelError::authentication(format!("login request failed: {e}")))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            info!("panel {}: session established", self.base_url);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(PanelError::authentication(format!(
            "login rejected: status {status}, body: {body}"
        )))
    }
}
