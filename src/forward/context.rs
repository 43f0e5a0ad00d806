//! Forward context structures
//!
//! The dispatcher resolves the scheduler's verdict into an `AccountRef`
//! (a closed sum over the credential shapes an upstream call can use)
//! plus a `UsageRecorder` that defers ledger writes off the response path.

use crate::accounts::record::{Account, Platform, ProxyConfig};
use crate::accounts::repo::AccountRepo;
use crate::scheduler::Selection;
use crate::usage::{UsageDelta, UsageLedger};
use crate::AppState;

use super::apikeys::ApiKey;
use super::error::{ForwardError, ForwardResult};

/// Decrypted credentials for one dispatch. Secrets live only for the
/// lifetime of the request.
#[derive(Debug, Clone)]
pub enum AccountRef {
    Oauth {
        id: String,
        platform: Platform,
        name: String,
        access_token: String,
        project_id: Option<String>,
        temp_project_id: Option<String>,
        chatgpt_user_id: Option<String>,
        proxy: Option<ProxyConfig>,
    },
    ApiKey {
        id: String,
        platform: Platform,
        name: String,
        api_key: String,
        base_url: Option<String>,
        proxy: Option<ProxyConfig>,
    },
    AwsCreds {
        id: String,
        platform: Platform,
        name: String,
        region: Option<String>,
        credential_type: Option<String>,
        proxy: Option<ProxyConfig>,
    },
}

impl AccountRef {
    pub fn from_account(repo: &AccountRepo, account: &Account) -> Self {
        if account.platform == Platform::Bedrock {
            return AccountRef::AwsCreds {
                id: account.id.clone(),
                platform: account.platform,
                name: account.name.clone(),
                region: account.region.clone(),
                credential_type: account.credential_type.clone(),
                proxy: account.proxy.clone(),
            };
        }
        if account.platform.is_oauth() {
            AccountRef::Oauth {
                id: account.id.clone(),
                platform: account.platform,
                name: account.name.clone(),
                access_token: repo.access_token(account),
                project_id: account.project_id.clone(),
                temp_project_id: account.temp_project_id.clone(),
                chatgpt_user_id: account.chatgpt_user_id.clone(),
                proxy: account.proxy.clone(),
            }
        } else {
            AccountRef::ApiKey {
                id: account.id.clone(),
                platform: account.platform,
                name: account.name.clone(),
                api_key: repo.api_key(account),
                base_url: account.base_url.clone(),
                proxy: account.proxy.clone(),
            }
        }
    }

    pub fn id(&self) -> &str {
        match self {
            AccountRef::Oauth { id, .. }
            | AccountRef::ApiKey { id, .. }
            | AccountRef::AwsCreds { id, .. } => id,
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            AccountRef::Oauth { platform, .. }
            | AccountRef::ApiKey { platform, .. }
            | AccountRef::AwsCreds { platform, .. } => *platform,
        }
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        match self {
            AccountRef::Oauth { proxy, .. }
            | AccountRef::ApiKey { proxy, .. }
            | AccountRef::AwsCreds { proxy, .. } => proxy.as_ref(),
        }
    }
}

/// Resolve a scheduler verdict into a live account + decrypted credentials.
pub async fn resolve_selection(
    state: &AppState,
    selection: &Selection,
) -> ForwardResult<(Account, AccountRef)> {
    let platform = Platform::from_str(&selection.account_type).ok_or_else(|| {
        ForwardError::Internal(format!("Unknown account type '{}'", selection.account_type))
    })?;
    let account = state
        .accounts
        .get(platform, &selection.account_id)
        .await?
        .ok_or_else(|| {
            ForwardError::AccountNotFound(format!(
                "Selected account '{}' disappeared",
                selection.account_id
            ))
        })?;
    let account_ref = AccountRef::from_account(&state.accounts, &account);
    Ok((account, account_ref))
}

/// Deferred usage recording shared by the stream and non-stream paths.
/// `record` is fire-and-forget: ledger errors are logged, never surfaced.
#[derive(Clone)]
pub struct UsageRecorder {
    ledger: UsageLedger,
    api_key_id: String,
    account_id: String,
    model: String,
    rate_limit_window_minutes: i64,
}

impl UsageRecorder {
    pub fn new(ledger: UsageLedger, api_key: &ApiKey, account_id: &str, model: &str) -> Self {
        Self {
            ledger,
            api_key_id: api_key.id.clone(),
            account_id: account_id.to_string(),
            model: model.to_string(),
            rate_limit_window_minutes: api_key.rate_limit_window_minutes,
        }
    }

    pub fn record(self, delta: UsageDelta) {
        tokio::spawn(async move {
            match self
                .ledger
                .record_usage(&self.api_key_id, &self.account_id, &self.model, delta)
                .await
            {
                Ok(cost) => {
                    match self
                        .ledger
                        .add_window_usage(
                            &self.api_key_id,
                            self.rate_limit_window_minutes,
                            delta.total_tokens(),
                            cost,
                        )
                        .await
                    {
                        Ok((window_tokens, window_cost)) => crate::logger::debug(
                            "usage",
                            &format!(
                                "Rate-limit window updated: key={}, tokens={}, cost=${:.6}",
                                self.api_key_id, window_tokens, window_cost
                            ),
                        ),
                        Err(e) => crate::logger::error(
                            "usage",
                            &format!("Rate-limit window update failed: {}", e),
                        ),
                    }
                }
                Err(e) => crate::logger::error(
                    "usage",
                    &format!(
                        "Usage recording failed: key={}, account={}, error={}",
                        self.api_key_id, self.account_id, e
                    ),
                ),
            }
        });
    }
}
