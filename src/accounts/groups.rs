//! Account groups
//!
//! A group is a named set of account ids of one platform family. ApiKey
//! binding slots may point at `group:<id>` instead of a single account.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::store::{Store, StoreResult};

use super::record::Platform;

#[derive(Debug, Clone)]
pub struct AccountGroup {
    pub id: String,
    pub name: String,
    pub platform: Platform,
}

impl AccountGroup {
    fn from_hash(hash: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            id: hash.get("id")?.clone(),
            name: hash.get("name").cloned().unwrap_or_default(),
            platform: Platform::from_str(hash.get("platform")?)?,
        })
    }
}

#[derive(Clone)]
pub struct GroupRepo {
    store: Store,
}

impl GroupRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, platform: Platform, name: &str) -> StoreResult<AccountGroup> {
        let id = Uuid::new_v4().to_string();
        self.store
            .hset_map(
                &platform.group_key(&id),
                &[
                    ("id".into(), id.clone()),
                    ("name".into(), name.to_string()),
                    ("platform".into(), platform.as_str().into()),
                    ("createdAt".into(), Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        Ok(AccountGroup {
            id,
            name: name.to_string(),
            platform,
        })
    }

    pub async fn get(&self, platform: Platform, id: &str) -> StoreResult<Option<AccountGroup>> {
        let hash = self.store.hget_all(&platform.group_key(id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(AccountGroup::from_hash(&hash))
    }

    pub async fn delete(&self, platform: Platform, id: &str) -> StoreResult<()> {
        self.store.del(&platform.group_key(id)).await?;
        self.store.del(&platform.group_members_key(id)).await
    }

    pub async fn add_member(
        &self,
        platform: Platform,
        group_id: &str,
        account_id: &str,
    ) -> StoreResult<()> {
        self.store
            .sadd(&platform.group_members_key(group_id), account_id)
            .await
    }

    pub async fn remove_member(
        &self,
        platform: Platform,
        group_id: &str,
        account_id: &str,
    ) -> StoreResult<()> {
        self.store
            .srem(&platform.group_members_key(group_id), account_id)
            .await
    }

    pub async fn members(&self, platform: Platform, group_id: &str) -> StoreResult<Vec<String>> {
        self.store.smembers(&platform.group_members_key(group_id)).await
    }
}

/// Parse a binding slot value: `group:<id>` or a bare account id.
pub fn parse_binding(value: &str) -> Binding<'_> {
    match value.strip_prefix("group:") {
        Some(group_id) if !group_id.is_empty() => Binding::Group(group_id),
        _ => Binding::Account(value),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Binding<'a> {
    Account(&'a str),
    Group(&'a str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_parse() {
        assert_eq!(parse_binding("group:g1"), Binding::Group("g1"));
        assert_eq!(parse_binding("acct-1"), Binding::Account("acct-1"));
        // A bare "group:" prefix with no id is treated as an account id.
        assert_eq!(parse_binding("group:"), Binding::Account("group:"));
    }
}
