use serde_json::Value;
use tracing::warn;

/// Placeholder values used when the panel's transport configuration is
/// missing a parameter. They keep the link syntactically valid but are not
/// validated against the server; every use is logged so operators can spot
/// links built from guesses.
#[derive(Debug, Clone)]
pub struct FallbackDefaults {
    pub short_id: String,
    pub server_name: String,
    pub fingerprint: String,
}

impl Default for FallbackDefaults {
    fn default() -> Self {
        Self {
            short_id: "3d".to_string(),
            server_name: "google.com".to_string(),
            fingerprint: "chrome".to_string(),
        }
    }
}

/// Everything needed to assemble a REALITY connection URI, extracted from
/// the panel's loosely-typed settings tree. The ambiguity of that tree
/// stops here; downstream code only ever sees this struct.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RealityParams {
    pub public_key: Option<String>,
    pub short_id: String,
    pub server_name: String,
    pub fingerprint: String,
    pub host: String,
    pub port: u16,
}

/// Extracts REALITY parameters from an inbound's `streamSettings`.
///
/// Panel forks disagree on the shape: the tree may arrive JSON-encoded as a
/// string, `settings` inside `realitySettings` may be double-encoded, and
/// several fields flip between scalar and list. Resolution never fails —
/// missing data degrades to the configured placeholders.
pub fn resolve(
    stream_settings: &Value,
    listen: &str,
    port: u16,
    panel_base_url: &str,
    defaults: &FallbackDefaults,
) -> RealityParams {
    let stream = decode_nested(stream_settings);
    let reality = stream.get("realitySettings").cloned().unwrap_or(Value::Null);
    let settings = reality
        .get("settings")
        .map(decode_nested)
        .unwrap_or(Value::Null);

    let public_key = settings
        .get("publicKey")
        .and_then(string_or_first)
        .filter(|s| !s.is_empty());
    if public_key.is_none() {
        warn!("inbound has no REALITY publicKey; link will omit pbk");
    }

    let short_id = lookup_short_id(&reality, &settings).unwrap_or_else(|| {
        warn!(
            "inbound has no shortId; falling back to placeholder '{}'",
            defaults.short_id
        );
        defaults.short_id.clone()
    });

    let server_name = reality
        .get("serverNames")
        .and_then(string_or_first)
        .unwrap_or_else(|| {
            warn!(
                "inbound has no serverNames; falling back to placeholder '{}'",
                defaults.server_name
            );
            defaults.server_name.clone()
        });

    let fingerprint = settings
        .get("fingerprints")
        .and_then(string_or_first)
        .or_else(|| reality.get("fingerprints").and_then(string_or_first))
        .unwrap_or_else(|| {
            warn!(
                "inbound has no fingerprints; falling back to '{}'",
                defaults.fingerprint
            );
            defaults.fingerprint.clone()
        });

    let host = resolve_host(listen, panel_base_url);

    RealityParams {
        public_key,
        short_id,
        server_name,
        fingerprint,
        host,
        port,
    }
}

/// Assembles the shareable URI. Field order is fixed so links stay
/// reproducible across runs.
pub fn build_vless_link(client_id: &str, label: &str, params: &RealityParams) -> String {
    let mut link = format!(
        "vless://{}@{}:{}/?type=tcp&encryption=none&security=reality",
        client_id, params.host, params.port
    );
    if let Some(pbk) = &params.public_key {
        link.push_str("&pbk=");
        link.push_str(pbk);
    }
    link.push_str("&fp=");
    link.push_str(&params.fingerprint);
    link.push_str("&sni=");
    link.push_str(&params.server_name);
    link.push_str("&sid=");
    link.push_str(&params.short_id);
    link.push_str("&spx=%2F&flow=xtls-rprx-vision");
    link.push('#');
    link.push_str(&urlencoding::encode(label));
    link
}

/// Lookup order: realitySettings.shortId, first of realitySettings.shortIds,
/// then the same two one level deeper under settings.
fn lookup_short_id(reality: &Value, settings: &Value) -> Option<String> {
    reality
        .get("shortId")
        .and_then(string_or_first)
        .or_else(|| reality.get("shortIds").and_then(string_or_first))
        .or_else(|| settings.get("shortId").and_then(string_or_first))
        .or_else(|| settings.get("shortIds").and_then(string_or_first))
}

/// Some panels hand nested objects back JSON-encoded as strings.
fn decode_nested(value: &Value) -> Value {
    match value {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

/// Accepts a scalar string, a list (first element wins), or a string that
/// is itself a JSON-encoded list. Empty strings count as absent.
fn string_or_first(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            if s.trim_start().starts_with('[') {
                if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(s) {
                    return items
                        .first()
                        .and_then(Value::as_str)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string);
                }
            }
            if s.is_empty() { None } else { Some(s.clone()) }
        }
        Value::Array(items) => items
            .first()
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// Prefer the inbound's listen address; the wildcard or an empty value
/// means "derive the host from the panel's own URL".
fn resolve_host(listen: &str, panel_base_url: &str) -> String {
    let listen = listen.trim();
    if !listen.is_empty() && listen != "0.0.0.0" && listen != "::" {
        return listen.to_string();
    }
    url::Url::parse(panel_base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| listen.to_string())
}
