//! Process configuration
//!
//! Settings are read once at startup from a TOML file (path taken from
//! `RELAY_CONFIG`, falling back to `relay.toml` in the working directory or
//! the user config directory) and overlaid with environment variables.

use once_cell::sync::Lazy;
use std::{fs, path::PathBuf};

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Bind address for the gateway listener.
    pub host: String,
    pub port: u16,
    /// Connection string for the backing key-value store.
    pub redis_url: String,
    /// Secret used to derive the credential-vault key.
    pub encryption_secret: String,
    /// Fixed UTC offset (hours) used for daily/monthly usage bucket
    /// boundaries so "today" is stable across hosts.
    pub timezone_offset_hours: i32,
    /// Sticky session lifetime.
    pub sticky_session_ttl_secs: u64,
    /// Global session binding (claude-official only).
    pub session_binding_enabled: bool,
    pub session_binding_ttl_days: i64,
    pub session_binding_error_message: String,
    /// Webhook target for account anomaly/recovery notifications.
    pub webhook_url: Option<String>,
    /// Upstream request timeout for streaming endpoints.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Default rate-limit quarantine applied to an account when the
    /// upstream does not advertise a reset time (minutes).
    pub default_rate_limit_minutes: i64,
    /// Upstream bases.
    pub claude_api_base: String,
    pub anthropic_version: String,
    pub codex_api_base: String,
    pub gemini_cloud_code_base: String,
    pub gemini_api_base: String,
    /// OAuth client credentials used only to refresh tokens we already hold.
    pub claude_oauth_client_id: String,
    pub gemini_oauth_client_id: String,
    pub gemini_oauth_client_secret: String,
    pub openai_oauth_client_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            redis_url: "redis://127.0.0.1:6379/".to_string(),
            encryption_secret: String::new(),
            timezone_offset_hours: 8,
            sticky_session_ttl_secs: 3600,
            session_binding_enabled: false,
            session_binding_ttl_days: 30,
            session_binding_error_message:
                "This session is bound to an account that is no longer available".to_string(),
            webhook_url: None,
            request_timeout_secs: 600,
            connect_timeout_secs: 10,
            default_rate_limit_minutes: 60,
            claude_api_base: "https://api.anthropic.com".to_string(),
            anthropic_version: "2023-06-01".to_string(),
            codex_api_base: "https://chatgpt.com/backend-api/codex".to_string(),
            gemini_cloud_code_base: "https://cloudcode-pa.googleapis.com".to_string(),
            gemini_api_base: "https://generativelanguage.googleapis.com".to_string(),
            claude_oauth_client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
            gemini_oauth_client_id: String::new(),
            gemini_oauth_client_secret: String::new(),
            openai_oauth_client_id: String::new(),
        }
    }
}

fn settings_path() -> PathBuf {
    if let Ok(p) = std::env::var("RELAY_CONFIG") {
        return PathBuf::from(p);
    }
    let local = PathBuf::from("relay.toml");
    if local.exists() {
        return local;
    }
    let mut p = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("relay-gateway");
    p.push("relay.toml");
    p
}

fn apply_env_overrides(cfg: &mut Settings) {
    if let Ok(v) = std::env::var("REDIS_URL") {
        cfg.redis_url = v;
    }
    if let Ok(v) = std::env::var("ENCRYPTION_SECRET") {
        cfg.encryption_secret = v;
    }
    if let Ok(v) = std::env::var("WEBHOOK_URL") {
        cfg.webhook_url = Some(v);
    }
    if let Ok(v) = std::env::var("HOST") {
        cfg.host = v;
    }
    if let Ok(v) = std::env::var("PORT") {
        if let Ok(port) = v.parse() {
            cfg.port = port;
        }
    }
}

static SETTINGS: Lazy<Settings> = Lazy::new(|| {
    let p = settings_path();
    let mut cfg = if p.exists() {
        let s = fs::read_to_string(&p).unwrap_or_default();
        toml::from_str(&s).unwrap_or_else(|e| {
            eprintln!("Failed to parse config {:?}: {}", p, e);
            Settings::default()
        })
    } else {
        Settings::default()
    };
    apply_env_overrides(&mut cfg);
    if cfg.encryption_secret.is_empty() {
        // Derived key still works, but tokens are only as secret as this default.
        eprintln!("ENCRYPTION_SECRET is not set; using an insecure built-in default");
        cfg.encryption_secret = "relay-gateway-insecure-default".to_string();
    }
    cfg
});

/// Current settings snapshot.
pub fn load() -> Settings {
    SETTINGS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Settings::default();
        assert_eq!(cfg.timezone_offset_hours, 8);
        assert_eq!(cfg.request_timeout_secs, 600);
        assert_eq!(cfg.default_rate_limit_minutes, 60);
        assert!(cfg.claude_api_base.starts_with("https://"));
    }
}
