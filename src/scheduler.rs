//! Unified account scheduler
//!
//! Given (apiKey, sessionHash, model, options) the scheduler resolves the
//! binding slot for the demanded provider family, gates out unusable
//! accounts, honors sticky sessions and picks deterministically: priority
//! partitions walked lowest-first, least-recently-used account within the
//! partition, ties broken by id.
//!
//! Scheduling is strictly a pre-dispatch decision. When the upstream fails
//! mid-request the dispatcher marks the account and the failure propagates
//! to the client; the scheduler never silently retries another account.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::accounts::groups::{parse_binding, Binding, GroupRepo};
use crate::accounts::record::{Account, AccountStatus, Platform, RouteFamily};
use crate::accounts::repo::AccountRepo;
use crate::accounts::{oauth, state};
use crate::config;
use crate::forward::apikeys::ApiKey;
use crate::forward::error::{ForwardError, ForwardResult};
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions {
    /// API-key-family accounts are excluded unless explicitly allowed by
    /// the route (e.g. the public Gemini endpoints).
    pub allow_api_accounts: bool,
}

/// Scheduler verdict: which account serves the request. `account_type` is
/// the platform string of the chosen account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    #[serde(rename = "accountId")]
    pub account_id: String,
    #[serde(rename = "accountType")]
    pub account_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionBinding {
    #[serde(rename = "accountId")]
    account_id: String,
    #[serde(rename = "accountType")]
    account_type: String,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(rename = "lastUsedAt")]
    last_used_at: String,
}

/// Sticky-session hash over client-stable inputs. Only ever used for
/// sticky lookups, never for authentication or accounting.
pub fn session_hash(user_agent: &str, ip: &str, key_header: &str) -> String {
    let prefix: String = key_header.chars().take(10).collect();
    let joined = [user_agent, ip, prefix.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(":");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

static ORIGINAL_SESSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"session_([0-9a-fA-F-]{36})$").expect("static regex"));

/// Extract the upstream-embedded session id from `metadata.user_id`
/// (pattern `...session_<uuid>$`).
pub fn extract_original_session_id(payload: &Value) -> Option<String> {
    let user_id = payload
        .pointer("/metadata/user_id")
        .and_then(|v| v.as_str())?;
    ORIGINAL_SESSION_RE
        .captures(user_id)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Deterministic pick over an already-gated candidate set: lowest priority
/// partition, then least-recent `lastUsedAt` (never-used first), then id.
pub fn pick_account(candidates: &[Account]) -> Option<&Account> {
    let lowest_priority = candidates.iter().map(|a| a.priority).min()?;
    candidates
        .iter()
        .filter(|a| a.priority == lowest_priority)
        .min_by(|a, b| {
            let used_a = a.last_used_at.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
            let used_b = b.last_used_at.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
            used_a.cmp(&used_b).then_with(|| a.id.cmp(&b.id))
        })
}

#[derive(Clone)]
pub struct UnifiedScheduler {
    store: Store,
    accounts: AccountRepo,
    groups: GroupRepo,
}

impl UnifiedScheduler {
    pub fn new(store: Store, accounts: AccountRepo, groups: GroupRepo) -> Self {
        Self {
            store,
            accounts,
            groups,
        }
    }

    /// Select an account for the demanded family.
    pub async fn select(
        &self,
        api_key: &ApiKey,
        family: RouteFamily,
        session_hash: Option<&str>,
        requested_model: Option<&str>,
        opts: SelectOptions,
    ) -> ForwardResult<Selection> {
        let binding = api_key.binding_for(family).map(|b| b.to_string());

        // Model restriction cross-check for explicitly bound sessions.
        // Shared-pool requests were already gated at the route layer.
        if binding.is_some() {
            if let Some(model) = requested_model {
                if !api_key.allows_model(model) {
                    return Err(ForwardError::PermissionDenied(format!(
                        "Model '{}' is not allowed for this API key",
                        model
                    )));
                }
            }
        }

        let raw_candidates = self.build_candidates(family, binding.as_deref()).await?;
        let mut candidates = Vec::new();
        for account in raw_candidates {
            if let Some(account) = self.gate(account, requested_model, opts).await? {
                candidates.push(account);
            }
        }

        if candidates.is_empty() {
            return Err(ForwardError::NoAvailableAccount(format!(
                "No available {} account",
                family.as_str()
            )));
        }

        // Sticky session wins when it still points into the eligible set.
        if let Some(hash) = session_hash {
            if let Some(selection) = self.sticky_lookup(hash).await? {
                if candidates.iter().any(|a| a.id == selection.account_id) {
                    self.refresh_sticky(hash).await?;
                    return Ok(selection);
                }
            }
        }

        let chosen = pick_account(&candidates)
            .cloned()
            .ok_or_else(|| ForwardError::Internal("selection over empty set".to_string()))?;
        let selection = Selection {
            account_id: chosen.id.clone(),
            account_type: chosen.platform.as_str().to_string(),
        };

        if let Some(hash) = session_hash {
            self.write_sticky(hash, &selection).await?;
        }

        crate::logger::debug(
            "scheduler",
            &format!(
                "Selected account: family={}, id={}, platform={}",
                family.as_str(),
                selection.account_id,
                selection.account_type
            ),
        );
        Ok(selection)
    }

    async fn build_candidates(
        &self,
        family: RouteFamily,
        binding: Option<&str>,
    ) -> ForwardResult<Vec<Account>> {
        match binding.map(parse_binding) {
            Some(Binding::Account(id)) => {
                let account = self
                    .accounts
                    .find_in_platforms(family.platforms(), id)
                    .await?
                    .ok_or_else(|| {
                        ForwardError::AccountNotFound(format!("Bound account '{}' not found", id))
                    })?;
                Ok(vec![account])
            }
            Some(Binding::Group(group_id)) => {
                let mut members = Vec::new();
                for platform in family.platforms() {
                    if self.groups.get(*platform, group_id).await?.is_some() {
                        for member_id in self.groups.members(*platform, group_id).await? {
                            if let Some(account) = self
                                .accounts
                                .find_in_platforms(family.platforms(), &member_id)
                                .await?
                            {
                                members.push(account);
                            }
                        }
                        break;
                    }
                }
                if members.is_empty() {
                    return Err(ForwardError::AccountNotFound(format!(
                        "Bound group '{}' has no members in family {}",
                        group_id,
                        family.as_str()
                    )));
                }
                Ok(members)
            }
            None => {
                let mut shared = Vec::new();
                for platform in family.platforms() {
                    for id in self.accounts.shared_ids(*platform).await? {
                        if let Some(account) = self.accounts.get(*platform, &id).await? {
                            shared.push(account);
                        }
                    }
                }
                Ok(shared)
            }
        }
    }

    /// Apply the gating rules to one candidate. Returns the (possibly
    /// refreshed) account when it stays eligible.
    async fn gate(
        &self,
        mut account: Account,
        requested_model: Option<&str>,
        opts: SelectOptions,
    ) -> ForwardResult<Option<Account>> {
        if !account.is_active {
            return Ok(None);
        }
        if account.platform.is_api_key_family() && !opts.allow_api_accounts {
            return Ok(None);
        }
        if let Some(model) = requested_model {
            if !account.supports_model(model) {
                return Ok(None);
            }
        }

        let now = Utc::now();

        // Lazy rate-limit sweep: a quarantined account whose window elapsed
        // recovers on the first pass that sees it.
        if account.status == AccountStatus::RateLimited {
            let recoverable = state::next_status(
                account.status,
                state::Trigger::RateLimitClear,
                now,
                account.rate_limit_reset_at,
            )
            .is_some();
            if !recoverable {
                return Ok(None);
            }
            self.accounts
                .set_rate_limited(account.platform, &account.id, false, None)
                .await?;
            account.status = AccountStatus::Active;
            account.schedulable = true;
            account.rate_limit_reset_at = None;
        }

        if !account.schedulable || account.status != AccountStatus::Active {
            return Ok(None);
        }

        // Expired OAuth tokens get one lazy refresh attempt; failure gates
        // the account out and quarantines it.
        if account.is_token_expired(now) {
            let refresh_token = self.accounts.refresh_token(&account);
            match oauth::refresh_access_token(account.platform, &refresh_token).await {
                Ok(tokens) => {
                    self.accounts
                        .persist_refreshed_tokens(
                            &account,
                            &tokens.access_token,
                            tokens.refresh_token.as_deref(),
                            tokens.expires_at,
                        )
                        .await?;
                    match self.accounts.get(account.platform, &account.id).await? {
                        Some(fresh) => account = fresh,
                        None => return Ok(None),
                    }
                }
                Err(reason) => {
                    crate::logger::warn(
                        "scheduler",
                        &format!(
                            "Token refresh failed: platform={}, id={}, reason={}",
                            account.platform, account.id, reason
                        ),
                    );
                    self.accounts
                        .mark_unauthorized(account.platform, &account.id, "token refresh failed")
                        .await?;
                    return Ok(None);
                }
            }
        }

        Ok(Some(account))
    }

    // ------------------------------------------------------------------
    // Sticky sessions
    // ------------------------------------------------------------------

    fn sticky_key(hash: &str) -> String {
        format!("session:{}", hash)
    }

    async fn sticky_lookup(&self, hash: &str) -> ForwardResult<Option<Selection>> {
        let Some(json) = self.store.get(&Self::sticky_key(hash)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&json).ok())
    }

    async fn refresh_sticky(&self, hash: &str) -> ForwardResult<()> {
        let ttl = config::load().sticky_session_ttl_secs;
        self.store.expire(&Self::sticky_key(hash), ttl).await?;
        Ok(())
    }

    async fn write_sticky(&self, hash: &str, selection: &Selection) -> ForwardResult<()> {
        let ttl = config::load().sticky_session_ttl_secs;
        let json = serde_json::to_string(selection)
            .map_err(|e| ForwardError::Internal(e.to_string()))?;
        self.store.set_ex(&Self::sticky_key(hash), &json, ttl).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Global session binding (claude-official only)
    // ------------------------------------------------------------------

    fn binding_key(session_id: &str) -> String {
        format!("original_session_binding:{}", session_id)
    }

    /// Whether the strict session-binding mode is on. The store flag (part
    /// of the runtime feature config) overrides the static setting.
    pub async fn session_binding_enabled(&self) -> bool {
        if let Ok(Some(json)) = self.store.get("claude_relay_config").await {
            if let Ok(value) = serde_json::from_str::<Value>(&json) {
                if let Some(flag) = value.get("sessionBindingEnabled").and_then(|v| v.as_bool()) {
                    return flag;
                }
            }
        }
        config::load().session_binding_enabled
    }

    /// Claude-family selection under global session binding. When the
    /// request carries an original session id with an existing binding the
    /// bound account is force-selected, bypassing normal selection; an
    /// invalid bound account rejects the request outright.
    pub async fn select_claude(
        &self,
        api_key: &ApiKey,
        session_hash: Option<&str>,
        requested_model: Option<&str>,
        payload: &Value,
    ) -> ForwardResult<Selection> {
        let opts = SelectOptions {
            allow_api_accounts: true,
        };
        if !self.session_binding_enabled().await {
            return self
                .select(api_key, RouteFamily::Claude, session_hash, requested_model, opts)
                .await;
        }

        let original_session = extract_original_session_id(payload);
        if let Some(session_id) = original_session.as_deref() {
            if let Some(binding) = self.binding_lookup(session_id).await? {
                let account = self
                    .accounts
                    .get(Platform::Claude, &binding.account_id)
                    .await?;
                let valid = account
                    .as_ref()
                    .map(|a| a.is_active && a.status != AccountStatus::Error)
                    .unwrap_or(false);
                if !valid {
                    return Err(ForwardError::SessionBindingInvalid(
                        config::load().session_binding_error_message,
                    ));
                }
                self.touch_binding(session_id, &binding).await?;
                return Ok(Selection {
                    account_id: binding.account_id,
                    account_type: binding.account_type,
                });
            }
        }

        let selection = self
            .select(api_key, RouteFamily::Claude, session_hash, requested_model, opts)
            .await?;

        // Only claude-official selections ever create a binding.
        if selection.account_type == Platform::Claude.as_str() {
            if let Some(session_id) = original_session.as_deref() {
                self.write_binding(session_id, &selection).await?;
            }
        }
        Ok(selection)
    }

    async fn binding_lookup(&self, session_id: &str) -> ForwardResult<Option<SessionBinding>> {
        let Some(json) = self.store.get(&Self::binding_key(session_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&json).ok())
    }

    async fn touch_binding(&self, session_id: &str, binding: &SessionBinding) -> ForwardResult<()> {
        let cfg = config::load();
        let mut refreshed = binding.clone();
        refreshed.last_used_at = Utc::now().to_rfc3339();
        let json = serde_json::to_string(&refreshed)
            .map_err(|e| ForwardError::Internal(e.to_string()))?;
        let ttl = (cfg.session_binding_ttl_days.max(1) as u64) * 24 * 3600;
        self.store
            .set_ex(&Self::binding_key(session_id), &json, ttl)
            .await?;
        Ok(())
    }

    async fn write_binding(&self, session_id: &str, selection: &Selection) -> ForwardResult<()> {
        let cfg = config::load();
        let now = Utc::now().to_rfc3339();
        let binding = SessionBinding {
            account_id: selection.account_id.clone(),
            account_type: selection.account_type.clone(),
            created_at: now.clone(),
            last_used_at: now,
        };
        let json = serde_json::to_string(&binding)
            .map_err(|e| ForwardError::Internal(e.to_string()))?;
        let ttl = (cfg.session_binding_ttl_days.max(1) as u64) * 24 * 3600;
        self.store
            .set_ex(&Self::binding_key(session_id), &json, ttl)
            .await?;
        crate::logger::info(
            "scheduler",
            &format!(
                "Created session binding: session={}, account={}",
                session_id, selection.account_id
            ),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account(id: &str, priority: u8, last_used_secs_ago: Option<i64>) -> Account {
        let mut account = Account::new(id.to_string(), Platform::Claude, id.to_string());
        account.priority = priority;
        account.status = AccountStatus::Active;
        account.schedulable = true;
        account.last_used_at = last_used_secs_ago.map(|secs| Utc::now() - Duration::seconds(secs));
        account
    }

    #[test]
    fn session_hash_drops_empty_fields() {
        let with_ip = session_hash("agent/1.0", "10.0.0.1", "sk-rg-abcdef012345");
        let without_ip = session_hash("agent/1.0", "", "sk-rg-abcdef012345");
        assert_ne!(with_ip, without_ip);
        // Only the first ten characters of the key header participate.
        let same = session_hash("agent/1.0", "", "sk-rg-abcdXXXXXX");
        assert_eq!(without_ip, same);
        assert_eq!(with_ip.len(), 64);
    }

    #[test]
    fn original_session_id_extraction() {
        let payload = serde_json::json!({
            "metadata": {
                "user_id": "user_abc_account__session_0f8d3c1a-2b4e-4d6f-8a90-1b2c3d4e5f60"
            }
        });
        assert_eq!(
            extract_original_session_id(&payload).as_deref(),
            Some("0f8d3c1a-2b4e-4d6f-8a90-1b2c3d4e5f60")
        );
        // Session id must terminate the string.
        let trailing = serde_json::json!({
            "metadata": {"user_id": "session_0f8d3c1a-2b4e-4d6f-8a90-1b2c3d4e5f60_suffix"}
        });
        assert_eq!(extract_original_session_id(&trailing), None);
        assert_eq!(extract_original_session_id(&serde_json::json!({})), None);
    }

    #[test]
    fn pick_prefers_lowest_priority_partition() {
        let candidates = vec![
            account("b", 50, Some(100)),
            account("a", 10, Some(5)),
            account("c", 10, Some(500)),
        ];
        // Priority 10 partition wins; within it, "c" is least recently used.
        assert_eq!(pick_account(&candidates).unwrap().id, "c");
    }

    #[test]
    fn pick_is_lru_within_partition() {
        let first = vec![account("c1", 50, Some(10)), account("c2", 50, Some(5))];
        assert_eq!(pick_account(&first).unwrap().id, "c1");
        // After c1 is used, c2 becomes the least recent.
        let second = vec![account("c1", 50, Some(0)), account("c2", 50, Some(5))];
        assert_eq!(pick_account(&second).unwrap().id, "c2");
    }

    #[test]
    fn pick_prefers_never_used_and_breaks_ties_by_id() {
        let candidates = vec![
            account("z", 50, Some(1)),
            account("m", 50, None),
            account("a", 50, None),
        ];
        assert_eq!(pick_account(&candidates).unwrap().id, "a");
        assert!(pick_account(&[]).is_none());
    }
}
