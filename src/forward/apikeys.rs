//! Tenant API keys
//!
//! The tenant-facing bearer records: hashed lookup, permissions, limits
//! and restrictions, plus the per-provider binding slots consumed by the
//! scheduler. Raw keys are never stored; lookup goes through a SHA-256
//! index.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::accounts::record::RouteFamily;
use crate::cost_rank::CostRankService;
use crate::store::{Store, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    All,
    Claude,
    Gemini,
    Openai,
}

impl Permission {
    pub fn from_str(s: &str) -> Self {
        match s {
            "claude" => Permission::Claude,
            "gemini" => Permission::Gemini,
            "openai" => Permission::Openai,
            _ => Permission::All,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::All => "all",
            Permission::Claude => "claude",
            Permission::Gemini => "gemini",
            Permission::Openai => "openai",
        }
    }

    pub fn allows(&self, family: RouteFamily) -> bool {
        match self {
            Permission::All => true,
            Permission::Claude => family == RouteFamily::Claude,
            Permission::Gemini => family == RouteFamily::Gemini,
            Permission::Openai => family == RouteFamily::Openai,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub description: String,
    pub hashed_key: String,
    pub permissions: Permission,
    /// Lifetime token budget; 0 means unlimited.
    pub token_limit: i64,
    /// Sliding-window request limit; 0 means unlimited.
    pub rate_limit_requests: i64,
    pub rate_limit_window_minutes: i64,
    /// Concurrent in-flight requests; 0 means unlimited.
    pub concurrency_limit: i64,
    /// Daily USD budget; 0.0 means unlimited.
    pub daily_cost_limit: f64,
    pub enable_model_restriction: bool,
    pub restricted_models: HashSet<String>,
    pub enable_client_restriction: bool,
    pub allowed_clients: Vec<String>,
    /// Exclusive binding slots, one per provider family. A slot may hold a
    /// bare account id or `group:<id>`.
    pub claude_account_id: Option<String>,
    pub gemini_account_id: Option<String>,
    pub openai_account_id: Option<String>,
    pub is_deleted: bool,
}

impl ApiKey {
    pub fn binding_for(&self, family: RouteFamily) -> Option<&str> {
        match family {
            RouteFamily::Claude => self.claude_account_id.as_deref(),
            RouteFamily::Gemini => self.gemini_account_id.as_deref(),
            RouteFamily::Openai => self.openai_account_id.as_deref(),
        }
        .filter(|v| !v.is_empty())
    }

    /// Model restriction check. An empty restriction list blocks nothing.
    pub fn allows_model(&self, model: &str) -> bool {
        if !self.enable_model_restriction || self.restricted_models.is_empty() {
            return true;
        }
        !self.restricted_models.contains(model)
    }

    /// Client restriction: the User-Agent must carry one of the allowed
    /// client identifiers.
    pub fn allows_client(&self, user_agent: &str) -> bool {
        if !self.enable_client_restriction || self.allowed_clients.is_empty() {
            return true;
        }
        let ua = user_agent.to_ascii_lowercase();
        self.allowed_clients
            .iter()
            .any(|client| !client.is_empty() && ua.contains(&client.to_ascii_lowercase()))
    }

    fn from_hash(hash: &HashMap<String, String>) -> Option<Self> {
        let id = hash.get("id")?.clone();
        let get = |name: &str| hash.get(name).cloned().unwrap_or_default();
        let get_bool = |name: &str| hash.get(name).map(|v| v == "true").unwrap_or(false);
        let get_i64 = |name: &str| {
            hash.get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0i64)
        };
        Some(Self {
            id,
            name: get("name"),
            description: get("description"),
            hashed_key: get("hashedKey"),
            permissions: Permission::from_str(&get("permissions")),
            token_limit: get_i64("tokenLimit"),
            rate_limit_requests: get_i64("rateLimitRequests"),
            rate_limit_window_minutes: {
                let v = get_i64("rateLimitWindow");
                if v <= 0 {
                    1
                } else {
                    v
                }
            },
            concurrency_limit: get_i64("concurrencyLimit"),
            daily_cost_limit: hash
                .get("dailyCostLimit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            enable_model_restriction: get_bool("enableModelRestriction"),
            restricted_models: hash
                .get("restrictedModels")
                .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
                .map(|models| models.into_iter().collect())
                .unwrap_or_default(),
            enable_client_restriction: get_bool("enableClientRestriction"),
            allowed_clients: hash
                .get("allowedClients")
                .and_then(|json| serde_json::from_str(json).ok())
                .unwrap_or_default(),
            claude_account_id: hash.get("claudeAccountId").filter(|v| !v.is_empty()).cloned(),
            gemini_account_id: hash.get("geminiAccountId").filter(|v| !v.is_empty()).cloned(),
            openai_account_id: hash.get("openaiAccountId").filter(|v| !v.is_empty()).cloned(),
            is_deleted: get_bool("isDeleted"),
        })
    }
}

/// SHA-256 hex of a raw bearer, the stored/indexed form.
pub fn hash_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

#[derive(Debug, Clone, Default)]
pub struct NewApiKey {
    pub name: String,
    pub description: String,
    pub permissions: Option<Permission>,
    pub token_limit: i64,
    pub rate_limit_requests: i64,
    pub rate_limit_window_minutes: i64,
    pub concurrency_limit: i64,
    pub daily_cost_limit: f64,
    pub restricted_models: HashSet<String>,
    pub allowed_clients: Vec<String>,
}

#[derive(Clone)]
pub struct ApiKeyRepo {
    store: Store,
    cost_rank: CostRankService,
}

impl ApiKeyRepo {
    pub fn new(store: Store, cost_rank: CostRankService) -> Self {
        Self { store, cost_rank }
    }

    fn record_key(id: &str) -> String {
        format!("apikey:{}", id)
    }

    fn hash_index_key(hashed: &str) -> String {
        format!("apikey:hash:{}", hashed)
    }

    /// Create a key record. Returns the record and the raw bearer; the
    /// only time the raw value exists outside the caller.
    pub async fn create(&self, input: NewApiKey) -> StoreResult<(ApiKey, String)> {
        let id = Uuid::new_v4().to_string();
        let raw = format!("sk-rg-{}", Uuid::new_v4().simple());
        let hashed = hash_key(&raw);
        let now = Utc::now().to_rfc3339();

        let fields: Vec<(String, String)> = vec![
            ("id".into(), id.clone()),
            ("name".into(), input.name.clone()),
            ("description".into(), input.description.clone()),
            ("hashedKey".into(), hashed.clone()),
            (
                "permissions".into(),
                input.permissions.unwrap_or(Permission::All).as_str().into(),
            ),
            ("tokenLimit".into(), input.token_limit.to_string()),
            (
                "rateLimitRequests".into(),
                input.rate_limit_requests.to_string(),
            ),
            (
                "rateLimitWindow".into(),
                input.rate_limit_window_minutes.max(1).to_string(),
            ),
            (
                "concurrencyLimit".into(),
                input.concurrency_limit.to_string(),
            ),
            ("dailyCostLimit".into(), input.daily_cost_limit.to_string()),
            (
                "enableModelRestriction".into(),
                (!input.restricted_models.is_empty()).to_string(),
            ),
            (
                "restrictedModels".into(),
                serde_json::to_string(&input.restricted_models.iter().collect::<Vec<_>>())
                    .unwrap_or_else(|_| "[]".into()),
            ),
            (
                "enableClientRestriction".into(),
                (!input.allowed_clients.is_empty()).to_string(),
            ),
            (
                "allowedClients".into(),
                serde_json::to_string(&input.allowed_clients).unwrap_or_else(|_| "[]".into()),
            ),
            ("isDeleted".into(), "false".into()),
            ("createdAt".into(), now.clone()),
            ("updatedAt".into(), now),
        ];

        self.store.hset_map(&Self::record_key(&id), &fields).await?;
        self.store.set(&Self::hash_index_key(&hashed), &id).await?;
        self.store.sadd("apikeys", &id).await?;
        if let Err(e) = self.cost_rank.on_key_created(&id).await {
            crate::logger::warn(
                "apikeys",
                &format!("Cost-rank seed failed for new key {}: {}", id, e),
            );
        }

        let key = self.get(&id).await?.ok_or_else(|| {
            crate::store::StoreError::Command("created key record did not read back".to_string())
        })?;
        Ok((key, raw))
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<ApiKey>> {
        let hash = self.store.hget_all(&Self::record_key(id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(ApiKey::from_hash(&hash))
    }

    /// Resolve a raw bearer to its record via the hash index.
    pub async fn find_by_raw(&self, raw: &str) -> StoreResult<Option<ApiKey>> {
        let hashed = hash_key(raw);
        let Some(id) = self.store.get(&Self::hash_index_key(&hashed)).await? else {
            return Ok(None);
        };
        self.get(&id).await
    }

    /// Soft delete: the record stays for audit, the key stops resolving
    /// and leaves the cost-rank index.
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let Some(key) = self.get(id).await? else {
            return Ok(());
        };
        self.store
            .hset_map(
                &Self::record_key(id),
                &[
                    ("isDeleted".into(), "true".into()),
                    ("updatedAt".into(), Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        self.store.del(&Self::hash_index_key(&key.hashed_key)).await?;
        self.store.srem("apikeys", id).await?;
        if let Err(e) = self.cost_rank.on_key_deleted(id).await {
            crate::logger::warn(
                "apikeys",
                &format!("Cost-rank removal failed for key {}: {}", id, e),
            );
        }
        Ok(())
    }

    /// Pin or clear a binding slot. `binding` accepts an account id or
    /// `group:<id>`.
    pub async fn set_binding(
        &self,
        id: &str,
        family: RouteFamily,
        binding: Option<&str>,
    ) -> StoreResult<()> {
        let field = match family {
            RouteFamily::Claude => "claudeAccountId",
            RouteFamily::Gemini => "geminiAccountId",
            RouteFamily::Openai => "openaiAccountId",
        };
        self.store
            .hset_map(
                &Self::record_key(id),
                &[
                    (field.into(), binding.unwrap_or_default().into()),
                    ("updatedAt".into(), Utc::now().to_rfc3339()),
                ],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_with(f: impl FnOnce(&mut ApiKey)) -> ApiKey {
        let mut key = ApiKey {
            id: "k1".into(),
            name: "test".into(),
            description: String::new(),
            hashed_key: String::new(),
            permissions: Permission::All,
            token_limit: 0,
            rate_limit_requests: 0,
            rate_limit_window_minutes: 1,
            concurrency_limit: 0,
            daily_cost_limit: 0.0,
            enable_model_restriction: false,
            restricted_models: HashSet::new(),
            enable_client_restriction: false,
            allowed_clients: Vec::new(),
            claude_account_id: None,
            gemini_account_id: None,
            openai_account_id: None,
            is_deleted: false,
        };
        f(&mut key);
        key
    }

    #[test]
    fn hash_is_stable_hex() {
        let a = hash_key("sk-rg-abc");
        assert_eq!(a.len(), 64);
        assert_eq!(a, hash_key("sk-rg-abc"));
        assert_ne!(a, hash_key("sk-rg-abd"));
    }

    #[test]
    fn permission_scoping() {
        assert!(Permission::All.allows(RouteFamily::Gemini));
        assert!(Permission::Gemini.allows(RouteFamily::Gemini));
        assert!(!Permission::Gemini.allows(RouteFamily::Claude));
        assert!(!Permission::Claude.allows(RouteFamily::Openai));
    }

    #[test]
    fn model_restriction_blocks_listed_models() {
        let key = key_with(|k| {
            k.enable_model_restriction = true;
            k.restricted_models.insert("claude-opus-4-20250514".into());
        });
        assert!(!key.allows_model("claude-opus-4-20250514"));
        assert!(key.allows_model("claude-sonnet-4-20250514"));
    }

    #[test]
    fn client_restriction_matches_user_agent() {
        let key = key_with(|k| {
            k.enable_client_restriction = true;
            k.allowed_clients.push("claude-cli".into());
        });
        assert!(key.allows_client("claude-cli/1.0.119 (external)"));
        assert!(!key.allows_client("curl/8.0"));
        // Restriction disabled means anything goes.
        let open = key_with(|_| {});
        assert!(open.allows_client("curl/8.0"));
    }

    #[test]
    fn binding_slots_are_per_family() {
        let key = key_with(|k| {
            k.gemini_account_id = Some("group:g7".into());
        });
        assert_eq!(key.binding_for(RouteFamily::Gemini), Some("group:g7"));
        assert_eq!(key.binding_for(RouteFamily::Claude), None);
    }
}
