//! Account repository
//!
//! CRUD and status mutation for provider accounts of every family. Hides
//! the hash field packing and the vault encryption of secret fields; status
//! changes go through the state machine and emit webhooks where required.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::crypto::Vault;
use crate::store::{Store, StoreResult};
use crate::webhook::{AccountEvent, WebhookNotifier};

use super::record::{Account, AccountKind, AccountStatus, Platform, ProxyConfig};
use super::state::{self, Trigger};

const SECRET_MASK: &str = "***";

/// Input for account creation; secret fields arrive in plaintext and are
/// encrypted before they reach the store.
#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub name: String,
    pub priority: u8,
    pub kind: AccountKind,
    pub proxy: Option<ProxyConfig>,
    pub supported_models: HashSet<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub project_id: Option<String>,
    pub chatgpt_user_id: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub aws_credentials: Option<String>,
    pub region: Option<String>,
    pub credential_type: Option<String>,
}

#[derive(Clone)]
pub struct AccountRepo {
    store: Store,
    vault: Vault,
    webhooks: WebhookNotifier,
}

impl AccountRepo {
    pub fn new(store: Store, vault: Vault, webhooks: WebhookNotifier) -> Self {
        Self {
            store,
            vault,
            webhooks,
        }
    }

    pub async fn create(&self, platform: Platform, input: NewAccount) -> StoreResult<Account> {
        let id = Uuid::new_v4().to_string();
        let mut account = Account::new(id, platform, input.name);
        account.priority = input.priority.clamp(1, 100);
        account.kind = input.kind;
        account.proxy = input.proxy;
        account.supported_models = input.supported_models;
        account.expires_at = input.expires_at;
        account.project_id = input.project_id;
        account.chatgpt_user_id = input.chatgpt_user_id;
        account.base_url = input.base_url.map(|u| normalize_base_url(&u));
        account.region = input.region;
        account.credential_type = input.credential_type;

        let mut has_credentials = false;
        if let Some(token) = input.access_token.as_deref().filter(|t| !t.is_empty()) {
            account.access_token = self.vault.encrypt(token);
            has_credentials = true;
        }
        if let Some(token) = input.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            account.refresh_token = self.vault.encrypt(token);
            has_credentials = true;
        }
        if let Some(key) = input.api_key.as_deref().filter(|k| !k.is_empty()) {
            account.api_key = self.vault.encrypt(key);
            has_credentials = true;
        }
        if let Some(creds) = input.aws_credentials.as_deref().filter(|c| !c.is_empty()) {
            account.aws_credentials = self.vault.encrypt(creds);
            has_credentials = true;
        }

        account.status = if has_credentials {
            AccountStatus::Active
        } else {
            AccountStatus::Created
        };
        account.schedulable = has_credentials;

        self.store
            .hset_map(&platform.record_key(&account.id), &account.to_hash())
            .await?;
        if account.kind == AccountKind::Shared {
            self.store
                .sadd(&platform.shared_set_key(), &account.id)
                .await?;
        }
        crate::logger::info(
            "accounts",
            &format!(
                "Created {} account: id={}, name={}",
                platform, account.id, account.name
            ),
        );
        Ok(account)
    }

    pub async fn get(&self, platform: Platform, id: &str) -> StoreResult<Option<Account>> {
        let hash = self.store.hget_all(&platform.record_key(id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Account::from_hash(&hash))
    }

    /// Look an account up by id across a set of candidate platforms.
    /// Explicit apiKey bindings store the account id without its platform.
    pub async fn find_in_platforms(
        &self,
        platforms: &[Platform],
        id: &str,
    ) -> StoreResult<Option<Account>> {
        for platform in platforms {
            if let Some(account) = self.get(*platform, id).await? {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }

    /// Shallow field patch. Secret fields must already be encrypted by the
    /// caller-facing helpers below; this bumps `updatedAt`.
    pub async fn update_fields(
        &self,
        platform: Platform,
        id: &str,
        mut fields: Vec<(String, String)>,
    ) -> StoreResult<()> {
        fields.push(("updatedAt".into(), Utc::now().to_rfc3339()));
        self.store
            .hset_map(&platform.record_key(id), &fields)
            .await
    }

    pub async fn delete(&self, platform: Platform, id: &str) -> StoreResult<()> {
        self.store.del(&platform.record_key(id)).await?;
        self.store.srem(&platform.shared_set_key(), id).await?;
        crate::logger::info(
            "accounts",
            &format!("Deleted {} account: id={}", platform, id),
        );
        Ok(())
    }

    /// All accounts of one family: the shared set unioned with a key scan,
    /// so dedicated accounts outside the shared set are found too. Secrets
    /// are masked.
    pub async fn list_all(
        &self,
        platform: Platform,
        include_inactive: bool,
    ) -> StoreResult<Vec<Account>> {
        let mut ids: Vec<String> = self.store.smembers(&platform.shared_set_key()).await?;
        let prefix = platform.record_key("");
        for key in self.store.scan_match(&platform.record_pattern()).await? {
            if let Some(id) = key.strip_prefix(&prefix) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        ids.dedup();

        let mut accounts = Vec::new();
        for id in ids {
            if let Some(mut account) = self.get(platform, &id).await? {
                if !include_inactive && !account.is_active {
                    continue;
                }
                mask_secrets(&mut account);
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    pub async fn shared_ids(&self, platform: Platform) -> StoreResult<Vec<String>> {
        self.store.smembers(&platform.shared_set_key()).await
    }

    pub async fn mark_used(&self, platform: Platform, id: &str) -> StoreResult<()> {
        self.update_fields(
            platform,
            id,
            vec![("lastUsedAt".into(), Utc::now().to_rfc3339())],
        )
        .await
    }

    /// Apply or clear a rate-limit quarantine.
    ///
    /// Applying sets `status=rateLimited`, `schedulable=false` and the reset
    /// timestamp (`duration` falls back to the account's configured value).
    /// Clearing is only honored once the reset time has passed; clearing an
    /// already-active account is a no-op apart from `updatedAt`.
    pub async fn set_rate_limited(
        &self,
        platform: Platform,
        id: &str,
        limited: bool,
        duration_minutes: Option<i64>,
    ) -> StoreResult<()> {
        let Some(account) = self.get(platform, id).await? else {
            return Ok(());
        };
        let now = Utc::now();

        if limited {
            let Some(next) =
                state::next_status(account.status, Trigger::UpstreamRateLimit, now, None)
            else {
                return Ok(());
            };
            let duration = duration_minutes.unwrap_or(account.rate_limit_duration_minutes);
            let reset_at = now + Duration::minutes(duration.max(1));
            self.update_fields(
                platform,
                id,
                vec![
                    ("status".into(), next.as_str().into()),
                    ("schedulable".into(), "false".into()),
                    ("rateLimitedAt".into(), now.to_rfc3339()),
                    ("rateLimitResetAt".into(), reset_at.to_rfc3339()),
                    ("rateLimitStatus".into(), "limited".into()),
                ],
            )
            .await?;
            crate::logger::warn(
                "accounts",
                &format!(
                    "Account rate limited: platform={}, id={}, resets_at={}",
                    platform,
                    id,
                    reset_at.to_rfc3339()
                ),
            );
            return Ok(());
        }

        match state::next_status(
            account.status,
            Trigger::RateLimitClear,
            now,
            account.rate_limit_reset_at,
        ) {
            Some(next) => {
                self.update_fields(
                    platform,
                    id,
                    vec![
                        ("status".into(), next.as_str().into()),
                        (
                            "schedulable".into(),
                            state::schedulable_after(next, true).to_string(),
                        ),
                        ("rateLimitStatus".into(), String::new()),
                    ],
                )
                .await?;
                self.store
                    .hdel(
                        &platform.record_key(id),
                        &["rateLimitedAt", "rateLimitResetAt"],
                    )
                    .await?;
                if let Some(code) = state::webhook_code(account.status, next) {
                    self.emit(&account, next, code, "rate limit window elapsed");
                }
                crate::logger::info(
                    "accounts",
                    &format!("Account recovered from rate limit: platform={}, id={}", platform, id),
                );
            }
            None => {
                // Either still inside the window or already active.
                self.update_fields(platform, id, Vec::new()).await?;
            }
        }
        Ok(())
    }

    /// Upstream 401/402 observed: quarantine until an admin resets.
    pub async fn mark_unauthorized(
        &self,
        platform: Platform,
        id: &str,
        reason: &str,
    ) -> StoreResult<()> {
        let Some(account) = self.get(platform, id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let Some(next) =
            state::next_status(account.status, Trigger::UpstreamUnauthorized, now, None)
        else {
            return Ok(());
        };
        self.update_fields(
            platform,
            id,
            vec![
                ("status".into(), next.as_str().into()),
                ("schedulable".into(), "false".into()),
                ("unauthorizedAt".into(), now.to_rfc3339()),
                (
                    "unauthorizedCount".into(),
                    (account.unauthorized_count + 1).to_string(),
                ),
                ("errorMessage".into(), reason.to_string()),
            ],
        )
        .await?;
        if let Some(code) = state::webhook_code(account.status, next) {
            self.emit(&account, next, code, reason);
        }
        crate::logger::error(
            "accounts",
            &format!(
                "Account unauthorized: platform={}, id={}, reason={}",
                platform, id, reason
            ),
        );
        Ok(())
    }

    /// Admin reset: back to active from any status, clearing failure state.
    pub async fn reset_status(&self, platform: Platform, id: &str) -> StoreResult<()> {
        let Some(account) = self.get(platform, id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let next = state::next_status(account.status, Trigger::AdminReset, now, None)
            .unwrap_or(AccountStatus::Active);
        self.update_fields(
            platform,
            id,
            vec![
                ("status".into(), next.as_str().into()),
                (
                    "schedulable".into(),
                    state::schedulable_after(next, true).to_string(),
                ),
                ("rateLimitStatus".into(), String::new()),
                ("errorMessage".into(), String::new()),
            ],
        )
        .await?;
        self.store
            .hdel(
                &platform.record_key(id),
                &["rateLimitedAt", "rateLimitResetAt", "unauthorizedAt"],
            )
            .await?;
        if let Some(code) = state::webhook_code(account.status, next) {
            self.emit(&account, next, code, "admin reset");
        }
        Ok(())
    }

    /// Flip the schedulable flag. Pausing is only legal from active;
    /// resuming from paused returns the account to active.
    pub async fn toggle_schedulable(&self, platform: Platform, id: &str) -> StoreResult<bool> {
        let Some(account) = self.get(platform, id).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        if account.schedulable {
            let Some(next) = state::next_status(account.status, Trigger::SchedulableOff, now, None)
            else {
                return Ok(account.schedulable);
            };
            self.update_fields(
                platform,
                id,
                vec![
                    ("status".into(), next.as_str().into()),
                    ("schedulable".into(), "false".into()),
                ],
            )
            .await?;
            if let Some(code) = state::webhook_code(account.status, next) {
                self.emit(&account, next, code, "manually disabled");
            }
            Ok(false)
        } else {
            let next = match state::next_status(account.status, Trigger::SchedulableOn, now, None) {
                Some(next) => next,
                // Schedulable can be re-enabled in place when the status is
                // already active.
                None if account.status == AccountStatus::Active => AccountStatus::Active,
                None => return Ok(false),
            };
            self.update_fields(
                platform,
                id,
                vec![
                    ("status".into(), next.as_str().into()),
                    ("schedulable".into(), "true".into()),
                ],
            )
            .await?;
            if let Some(code) = state::webhook_code(account.status, next) {
                self.emit(&account, next, code, "manually enabled");
            }
            Ok(true)
        }
    }

    /// Persist freshly refreshed OAuth tokens, re-encrypted.
    pub async fn persist_refreshed_tokens(
        &self,
        account: &Account,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: chrono::DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut fields = vec![
            ("accessToken".into(), self.vault.encrypt(access_token)),
            ("expiresAt".into(), expires_at.to_rfc3339()),
        ];
        if let Some(refresh) = refresh_token.filter(|t| !t.is_empty()) {
            fields.push(("refreshToken".into(), self.vault.encrypt(refresh)));
        }
        self.update_fields(account.platform, &account.id, fields).await
    }

    /// Record a discovered Cloud Code project id without overwriting an
    /// explicitly configured one.
    pub async fn save_temp_project_id(
        &self,
        platform: Platform,
        id: &str,
        project: &str,
    ) -> StoreResult<()> {
        self.update_fields(platform, id, vec![("tempProjectId".into(), project.into())])
            .await
    }

    // ------------------------------------------------------------------
    // Secret access
    // ------------------------------------------------------------------

    pub fn access_token(&self, account: &Account) -> String {
        self.vault.decrypt(&account.access_token)
    }

    pub fn refresh_token(&self, account: &Account) -> String {
        self.vault.decrypt(&account.refresh_token)
    }

    pub fn api_key(&self, account: &Account) -> String {
        self.vault.decrypt(&account.api_key)
    }

    fn emit(&self, account: &Account, status: AccountStatus, code: &str, reason: &str) {
        self.webhooks.notify(AccountEvent {
            account_id: account.id.clone(),
            account_name: account.name.clone(),
            platform: account.platform.as_str().to_string(),
            status: status.as_str().to_string(),
            error_code: code.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        });
    }
}

/// Base URLs are stored without a trailing slash.
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn mask_secrets(account: &mut Account) {
    for secret in [
        &mut account.access_token,
        &mut account.refresh_token,
        &mut account.api_key,
        &mut account.aws_credentials,
    ] {
        if !secret.is_empty() {
            *secret = SECRET_MASK.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("https://api.example.com/"), "https://api.example.com");
        assert_eq!(normalize_base_url("https://api.example.com"), "https://api.example.com");
        assert_eq!(
            normalize_base_url(" https://api.example.com/v1beta/models/ "),
            "https://api.example.com/v1beta/models"
        );
    }

    #[test]
    fn masking_leaves_empty_fields_alone() {
        let mut account = Account::new("a".into(), Platform::Claude, "n".into());
        account.access_token = "00:ff".into();
        mask_secrets(&mut account);
        assert_eq!(account.access_token, SECRET_MASK);
        assert_eq!(account.api_key, "");
    }
}
