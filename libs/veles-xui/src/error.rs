use thiserror::Error;

/// Failures talking to the remote panel. Timeouts surface through the same
/// variants as hard failures — callers abort the purchase attempt either
/// way, so they never need to tell "slow" from "broken".
#[derive(Debug, Error)]
pub enum PanelError {
    /// The panel rejected our credentials, or the login round trip failed
    /// at the transport level. The detail carries the upstream status and
    /// body for operator diagnosis.
    #[error("panel authentication failed: {detail}")]
    Authentication { detail: String },

    /// Create-client was rejected, or a required follow-up call failed.
    #[error("panel provisioning failed: {detail}")]
    Provision { detail: String },

    /// The configured inbound is gone from the panel — configuration drift.
    #[error("inbound {0} not found on panel")]
    InboundNotFound(i64),
}

impl PanelError {
    pub fn authentication(detail: impl Into<String>) -> Self {
        Self::Authentication {
            detail: detail.into(),
        }
    }

    pub fn provision(detail: impl Into<String>) -> Self {
        Self::Provision {
            detail: detail.into(),
        }
    }
}
