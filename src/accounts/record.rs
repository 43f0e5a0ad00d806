//! Account records and platform taxonomy
//!
//! Accounts persist as store hashes of string fields; structured fields
//! (`proxy`, `supportedModels`) are JSON strings inside the hash. Secret
//! fields hold vault blobs, never plaintext.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Claude,
    ClaudeConsole,
    Gemini,
    GeminiApi,
    Openai,
    OpenaiResponses,
    AzureOpenai,
    Bedrock,
    Droid,
    Ccr,
}

impl Platform {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(Platform::Claude),
            "claude-console" => Some(Platform::ClaudeConsole),
            "gemini" => Some(Platform::Gemini),
            "gemini-api" => Some(Platform::GeminiApi),
            "openai" => Some(Platform::Openai),
            "openai-responses" => Some(Platform::OpenaiResponses),
            "azure-openai" => Some(Platform::AzureOpenai),
            "bedrock" => Some(Platform::Bedrock),
            "droid" => Some(Platform::Droid),
            "ccr" => Some(Platform::Ccr),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Claude => "claude",
            Platform::ClaudeConsole => "claude-console",
            Platform::Gemini => "gemini",
            Platform::GeminiApi => "gemini-api",
            Platform::Openai => "openai",
            Platform::OpenaiResponses => "openai-responses",
            Platform::AzureOpenai => "azure-openai",
            Platform::Bedrock => "bedrock",
            Platform::Droid => "droid",
            Platform::Ccr => "ccr",
        }
    }

    fn snake(&self) -> &'static str {
        match self {
            Platform::Claude => "claude",
            Platform::ClaudeConsole => "claude_console",
            Platform::Gemini => "gemini",
            Platform::GeminiApi => "gemini_api",
            Platform::Openai => "openai",
            Platform::OpenaiResponses => "openai_responses",
            Platform::AzureOpenai => "azure_openai",
            Platform::Bedrock => "bedrock",
            Platform::Droid => "droid",
            Platform::Ccr => "ccr",
        }
    }

    /// Store key for one account record.
    pub fn record_key(&self, id: &str) -> String {
        format!("{}_account:{}", self.snake(), id)
    }

    /// Pattern matching every record of this family (dedicated accounts
    /// included), used by the SCAN fallback in `list_all`.
    pub fn record_pattern(&self) -> String {
        format!("{}_account:*", self.snake())
    }

    /// Store set holding ids of shared accounts of this family.
    pub fn shared_set_key(&self) -> String {
        format!("shared_{}_accounts", self.snake())
    }

    pub fn group_key(&self, group_id: &str) -> String {
        format!("{}_account_group:{}", self.snake(), group_id)
    }

    pub fn group_members_key(&self, group_id: &str) -> String {
        format!("{}_account_group_members:{}", self.snake(), group_id)
    }

    /// OAuth families carry access/refresh token pairs we must refresh.
    pub fn is_oauth(&self) -> bool {
        matches!(self, Platform::Claude | Platform::Gemini | Platform::Openai)
    }

    /// API-key families carry a raw provider key plus base URL.
    pub fn is_api_key_family(&self) -> bool {
        matches!(
            self,
            Platform::ClaudeConsole
                | Platform::GeminiApi
                | Platform::OpenaiResponses
                | Platform::AzureOpenai
                | Platform::Droid
                | Platform::Ccr
        )
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inbound route families. A route demands one family; the scheduler picks
/// among that family's platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFamily {
    Claude,
    Gemini,
    Openai,
}

impl RouteFamily {
    /// Platforms eligible for dispatch on this family. Bedrock records are
    /// managed by the repositories but are not dispatchable in this build.
    pub fn platforms(&self) -> &'static [Platform] {
        match self {
            RouteFamily::Claude => &[
                Platform::Claude,
                Platform::ClaudeConsole,
                Platform::Ccr,
                Platform::Droid,
            ],
            RouteFamily::Gemini => &[Platform::Gemini, Platform::GeminiApi],
            RouteFamily::Openai => &[
                Platform::Openai,
                Platform::OpenaiResponses,
                Platform::AzureOpenai,
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteFamily::Claude => "claude",
            RouteFamily::Gemini => "gemini",
            RouteFamily::Openai => "openai",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    RateLimited,
    Unauthorized,
    Error,
    Created,
    Paused,
}

impl AccountStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "rateLimited" => Some(AccountStatus::RateLimited),
            "unauthorized" => Some(AccountStatus::Unauthorized),
            "error" => Some(AccountStatus::Error),
            "created" => Some(AccountStatus::Created),
            "paused" => Some(AccountStatus::Paused),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::RateLimited => "rateLimited",
            AccountStatus::Unauthorized => "unauthorized",
            AccountStatus::Error => "error",
            AccountStatus::Created => "created",
            AccountStatus::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountKind {
    #[default]
    Shared,
    Dedicated,
}

impl AccountKind {
    pub fn from_str(s: &str) -> Self {
        match s {
            "dedicated" => AccountKind::Dedicated,
            _ => AccountKind::Shared,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Shared => "shared",
            AccountKind::Dedicated => "dedicated",
        }
    }
}

/// Account-scoped egress proxy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// "http", "https" or "socks5".
    #[serde(rename = "type")]
    pub proxy_type: String,
    /// Proxy URL; scheme may be omitted and is filled from `proxy_type`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One upstream credential record.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub platform: Platform,
    pub name: String,
    /// 1..=100, lower is preferred.
    pub priority: u8,
    pub kind: AccountKind,
    pub is_active: bool,
    pub schedulable: bool,
    pub status: AccountStatus,
    pub proxy: Option<ProxyConfig>,
    /// Empty set means every model is supported.
    pub supported_models: HashSet<String>,

    pub rate_limited_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub rate_limit_duration_minutes: i64,
    pub rate_limit_status: Option<String>,

    pub unauthorized_at: Option<DateTime<Utc>>,
    pub unauthorized_count: i64,
    pub error_message: Option<String>,

    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,

    // OAuth family secrets (vault blobs).
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub project_id: Option<String>,
    pub temp_project_id: Option<String>,
    pub chatgpt_user_id: Option<String>,

    // API-key family secrets.
    pub api_key: String,
    pub base_url: Option<String>,

    // Bedrock.
    pub aws_credentials: String,
    pub region: Option<String>,
    pub credential_type: Option<String>,
}

impl Account {
    pub fn new(id: String, platform: Platform, name: String) -> Self {
        Self {
            id,
            platform,
            name,
            priority: 50,
            kind: AccountKind::Shared,
            is_active: true,
            schedulable: true,
            status: AccountStatus::Created,
            proxy: None,
            supported_models: HashSet::new(),
            rate_limited_at: None,
            rate_limit_reset_at: None,
            rate_limit_duration_minutes: 60,
            rate_limit_status: None,
            unauthorized_at: None,
            unauthorized_count: 0,
            error_message: None,
            last_used_at: None,
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
            access_token: String::new(),
            refresh_token: String::new(),
            expires_at: None,
            project_id: None,
            temp_project_id: None,
            chatgpt_user_id: None,
            api_key: String::new(),
            base_url: None,
            aws_credentials: String::new(),
            region: None,
            credential_type: None,
        }
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty() || self.supported_models.contains(model)
    }

    /// OAuth token expiry check with a small clock-skew buffer.
    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        if !self.platform.is_oauth() {
            return false;
        }
        match self.expires_at {
            Some(expires) => expires <= now + chrono::Duration::seconds(60),
            None => false,
        }
    }

    pub fn to_hash(&self) -> Vec<(String, String)> {
        let mut fields: Vec<(String, String)> = vec![
            ("id".into(), self.id.clone()),
            ("platform".into(), self.platform.as_str().into()),
            ("name".into(), self.name.clone()),
            ("priority".into(), self.priority.to_string()),
            ("accountType".into(), self.kind.as_str().into()),
            ("isActive".into(), self.is_active.to_string()),
            ("schedulable".into(), self.schedulable.to_string()),
            ("status".into(), self.status.as_str().into()),
            (
                "supportedModels".into(),
                serde_json::to_string(&self.supported_models.iter().collect::<Vec<_>>())
                    .unwrap_or_else(|_| "[]".into()),
            ),
            (
                "rateLimitDuration".into(),
                self.rate_limit_duration_minutes.to_string(),
            ),
            (
                "unauthorizedCount".into(),
                self.unauthorized_count.to_string(),
            ),
            ("accessToken".into(), self.access_token.clone()),
            ("refreshToken".into(), self.refresh_token.clone()),
            ("apiKey".into(), self.api_key.clone()),
            ("awsCredentials".into(), self.aws_credentials.clone()),
        ];

        if let Some(proxy) = &self.proxy {
            if let Ok(json) = serde_json::to_string(proxy) {
                fields.push(("proxy".into(), json));
            }
        }
        push_time(&mut fields, "rateLimitedAt", self.rate_limited_at);
        push_time(&mut fields, "rateLimitResetAt", self.rate_limit_reset_at);
        push_opt(&mut fields, "rateLimitStatus", &self.rate_limit_status);
        push_time(&mut fields, "unauthorizedAt", self.unauthorized_at);
        push_opt(&mut fields, "errorMessage", &self.error_message);
        push_time(&mut fields, "lastUsedAt", self.last_used_at);
        push_time(&mut fields, "createdAt", self.created_at);
        push_time(&mut fields, "updatedAt", self.updated_at);
        push_time(&mut fields, "expiresAt", self.expires_at);
        push_opt(&mut fields, "projectId", &self.project_id);
        push_opt(&mut fields, "tempProjectId", &self.temp_project_id);
        push_opt(&mut fields, "chatgptUserId", &self.chatgpt_user_id);
        push_opt(&mut fields, "baseUrl", &self.base_url);
        push_opt(&mut fields, "region", &self.region);
        push_opt(&mut fields, "credentialType", &self.credential_type);
        fields
    }

    pub fn from_hash(hash: &HashMap<String, String>) -> Option<Self> {
        let id = hash.get("id")?.clone();
        let platform = Platform::from_str(hash.get("platform")?)?;
        let mut account = Account::new(id, platform, get_str(hash, "name"));
        account.priority = hash
            .get("priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);
        account.kind = AccountKind::from_str(hash.get("accountType").map(|s| s.as_str()).unwrap_or(""));
        account.is_active = get_bool(hash, "isActive");
        account.schedulable = get_bool(hash, "schedulable");
        account.status = hash
            .get("status")
            .and_then(|s| AccountStatus::from_str(s))
            .unwrap_or(AccountStatus::Created);
        account.proxy = hash
            .get("proxy")
            .and_then(|json| serde_json::from_str(json).ok());
        account.supported_models = hash
            .get("supportedModels")
            .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
            .map(|models| models.into_iter().collect())
            .unwrap_or_default();
        account.rate_limited_at = get_time(hash, "rateLimitedAt");
        account.rate_limit_reset_at = get_time(hash, "rateLimitResetAt");
        account.rate_limit_duration_minutes = hash
            .get("rateLimitDuration")
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        account.rate_limit_status = get_opt(hash, "rateLimitStatus");
        account.unauthorized_at = get_time(hash, "unauthorizedAt");
        account.unauthorized_count = hash
            .get("unauthorizedCount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        account.error_message = get_opt(hash, "errorMessage");
        account.last_used_at = get_time(hash, "lastUsedAt");
        account.created_at = get_time(hash, "createdAt");
        account.updated_at = get_time(hash, "updatedAt");
        account.access_token = get_str(hash, "accessToken");
        account.refresh_token = get_str(hash, "refreshToken");
        account.expires_at = get_time(hash, "expiresAt");
        account.project_id = get_opt(hash, "projectId");
        account.temp_project_id = get_opt(hash, "tempProjectId");
        account.chatgpt_user_id = get_opt(hash, "chatgptUserId");
        account.api_key = get_str(hash, "apiKey");
        account.base_url = get_opt(hash, "baseUrl");
        account.aws_credentials = get_str(hash, "awsCredentials");
        account.region = get_opt(hash, "region");
        account.credential_type = get_opt(hash, "credentialType");
        Some(account)
    }
}

fn push_opt(fields: &mut Vec<(String, String)>, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        fields.push((name.to_string(), value.clone()));
    }
}

fn push_time(fields: &mut Vec<(String, String)>, name: &str, value: Option<DateTime<Utc>>) {
    if let Some(value) = value {
        fields.push((name.to_string(), value.to_rfc3339()));
    }
}

fn get_str(hash: &HashMap<String, String>, name: &str) -> String {
    hash.get(name).cloned().unwrap_or_default()
}

fn get_opt(hash: &HashMap<String, String>, name: &str) -> Option<String> {
    hash.get(name).filter(|v| !v.is_empty()).cloned()
}

fn get_bool(hash: &HashMap<String, String>, name: &str) -> bool {
    hash.get(name).map(|v| v == "true").unwrap_or(false)
}

fn get_time(hash: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    hash.get(name)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_round_trip() {
        let mut account = Account::new(
            "a1".to_string(),
            Platform::Gemini,
            "primary".to_string(),
        );
        account.priority = 10;
        account.kind = AccountKind::Dedicated;
        account.status = AccountStatus::Active;
        account.schedulable = true;
        account.supported_models.insert("gemini-2.5-flash".to_string());
        account.access_token = "00ff:aabb".to_string();
        account.project_id = Some("proj-1".to_string());
        account.rate_limit_reset_at = Some(Utc::now());
        account.proxy = Some(ProxyConfig {
            proxy_type: "socks5".to_string(),
            url: "socks5://127.0.0.1:1080".to_string(),
            username: None,
            password: None,
        });

        let hash: HashMap<String, String> = account.to_hash().into_iter().collect();
        let parsed = Account::from_hash(&hash).unwrap();
        assert_eq!(parsed.id, "a1");
        assert_eq!(parsed.platform, Platform::Gemini);
        assert_eq!(parsed.priority, 10);
        assert_eq!(parsed.kind, AccountKind::Dedicated);
        assert_eq!(parsed.status, AccountStatus::Active);
        assert!(parsed.supports_model("gemini-2.5-flash"));
        assert!(!parsed.supports_model("gemini-2.5-pro"));
        assert_eq!(parsed.project_id.as_deref(), Some("proj-1"));
        assert_eq!(parsed.proxy.as_ref().unwrap().proxy_type, "socks5");
        assert!(parsed.rate_limit_reset_at.is_some());
    }

    #[test]
    fn empty_supported_models_allows_everything() {
        let account = Account::new("a".into(), Platform::Claude, "n".into());
        assert!(account.supports_model("claude-sonnet-4-20250514"));
    }

    #[test]
    fn token_expiry_only_applies_to_oauth() {
        let now = Utc::now();
        let mut oauth = Account::new("a".into(), Platform::Openai, "n".into());
        oauth.expires_at = Some(now - chrono::Duration::minutes(1));
        assert!(oauth.is_token_expired(now));

        let mut keyed = Account::new("b".into(), Platform::GeminiApi, "n".into());
        keyed.expires_at = Some(now - chrono::Duration::minutes(1));
        assert!(!keyed.is_token_expired(now));

        let mut fresh = Account::new("c".into(), Platform::Gemini, "n".into());
        fresh.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(!fresh.is_token_expired(now));
    }

    #[test]
    fn family_platforms_exclude_bedrock() {
        for family in [RouteFamily::Claude, RouteFamily::Gemini, RouteFamily::Openai] {
            assert!(!family.platforms().contains(&Platform::Bedrock));
        }
    }
}
