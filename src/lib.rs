pub mod accounts;
pub mod config;
pub mod cost_rank;
pub mod crypto;
pub mod forward;
pub mod logger;
pub mod pricing;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod usage;
pub mod webhook;

use crate::accounts::groups::GroupRepo;
use crate::accounts::repo::AccountRepo;
use crate::cost_rank::CostRankService;
use crate::crypto::Vault;
use crate::forward::apikeys::ApiKeyRepo;
use crate::scheduler::UnifiedScheduler;
use crate::store::Store;
use crate::usage::UsageLedger;
use crate::webhook::WebhookNotifier;

/// Root service context. Every stateful collaborator is constructed once at
/// startup and injected through axum state; there are no hidden service
/// singletons.
pub struct AppState {
    pub store: Store,
    pub vault: Vault,
    pub webhooks: WebhookNotifier,
    pub api_keys: ApiKeyRepo,
    pub accounts: AccountRepo,
    pub groups: GroupRepo,
    pub ledger: UsageLedger,
    pub scheduler: UnifiedScheduler,
    pub cost_rank: CostRankService,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        let cfg = config::load();
        let vault = Vault::new(&cfg.encryption_secret);
        let webhooks = WebhookNotifier::new(cfg.webhook_url.clone());
        let accounts = AccountRepo::new(store.clone(), vault.clone(), webhooks.clone());
        let groups = GroupRepo::new(store.clone());
        let ledger = UsageLedger::new(store.clone());
        let scheduler = UnifiedScheduler::new(store.clone(), accounts.clone(), groups.clone());
        let cost_rank = CostRankService::new(store.clone());
        let api_keys = ApiKeyRepo::new(store.clone(), cost_rank.clone());
        Self {
            store,
            vault,
            webhooks,
            api_keys,
            accounts,
            groups,
            ledger,
            scheduler,
            cost_rank,
        }
    }
}
