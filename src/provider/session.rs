// provider/session.rs - Process-local store for sensitive auth material
//
// Tokens and client secrets never reach the settings table; they live here
// for the lifetime of the process and are merged back into provider
// configuration on load.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;

/// In-memory per-provider map of sensitive auth fields.
#[derive(Clone, Default)]
pub struct SessionAuthStore {
    /// provider name -> sensitive fields (access_token, refresh_token, ...)
    entries: Arc<RwLock<HashMap<String, Map<String, Value>>>>,
}

impl SessionAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sensitive fields held for a provider.
    pub async fn put(&self, provider: &str, fields: Map<String, Value>) {
        if fields.is_empty() {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.insert(provider.to_string(), fields);
    }

    /// Merge additional sensitive fields into a provider's entry.
    pub async fn merge(&self, provider: &str, fields: Map<String, Value>) {
        if fields.is_empty() {
            return;
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(provider.to_string())
            .or_default()
            .extend(fields);
    }

    pub async fn get(&self, provider: &str) -> Option<Map<String, Value>> {
        let entries = self.entries.read().await;
        entries.get(provider).cloned()
    }

    /// Drop a provider's session auth (sign-out).
    pub async fn remove(&self, provider: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(provider);
    }

    /// Drop everything (process teardown, tests).
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = SessionAuthStore::new();

        store
            .put("provider_neutral", fields(&[("access_token", "tok")]))
            .await;
        assert!(store.get("provider_neutral").await.is_some());
        assert!(store.get("other").await.is_none());

        store.remove("provider_neutral").await;
        assert!(store.get("provider_neutral").await.is_none());
    }

    #[tokio::test]
    async fn test_merge_extends_existing_entry() {
        let store = SessionAuthStore::new();

        store
            .put("p", fields(&[("access_token", "old"), ("refresh_token", "r1")]))
            .await;
        store.merge("p", fields(&[("access_token", "new")])).await;

        let entry = store.get("p").await.unwrap();
        assert_eq!(entry["access_token"], "new");
        assert_eq!(entry["refresh_token"], "r1");
    }
}
