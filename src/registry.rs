use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::TunnelHandle;

/// Shared mapping from subdomain identifier to a live tunnel client.
///
/// Every operation takes the same lock, so inserts, removals and lookups
/// are linearizable with respect to each other.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, Arc<TunnelHandle>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: String, client: Arc<TunnelHandle>) {
        let mut clients = self.clients.write().await;
        if let Some(previous) = clients.insert(id.clone(), client) {
            warn!(
                "Replaced existing client under {} (was {})",
                id,
                previous.id()
            );
        }
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<TunnelHandle>> {
        self.clients.write().await.remove(id)
    }

    /// Remove `id` only if it still maps to `client`
    pub async fn remove_client(&self, id: &str, client: &Arc<TunnelHandle>) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(id) {
            Some(current) if Arc::ptr_eq(current, client) => {
                clients.remove(id);
                debug!("Removed client {} from registry", id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<TunnelHandle>> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.clients.read().await.contains_key(id)
    }

    /// Register a client under `requested` if given and free, otherwise
    /// under `fallback`.
    ///
    /// The conflict check and the insertion happen under one write lock.
    /// Returns the identifier the client ended up with. `build` receives
    /// that identifier and constructs the handle to store.
    pub async fn claim<F>(
        &self,
        requested: Option<&str>,
        fallback: &str,
        build: F,
    ) -> (String, Arc<TunnelHandle>)
    where
        F: FnOnce(&str) -> Arc<TunnelHandle>,
    {
        let mut clients = self.clients.write().await;

        let id = match requested {
            Some(custom) if !clients.contains_key(custom) => {
                info!("Custom ID request accepted: {} -> {}", fallback, custom);
                custom.to_string()
            }
            Some(custom) => {
                warn!(
                    "Custom ID request rejected for {}: {} is in use",
                    fallback, custom
                );
                fallback.to_string()
            }
            None => fallback.to_string(),
        };

        let handle = build(&id);
        if clients.insert(id.clone(), handle.clone()).is_some() {
            warn!("Generated ID collision on {}, previous client replaced", id);
        }
        (id, handle)
    }

    pub async fn snapshot(&self) -> Vec<Arc<TunnelHandle>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> Arc<TunnelHandle> {
        Arc::new(TunnelHandle::detached(id))
    }

    #[tokio::test]
    async fn test_insert_lookup_remove() {
        let registry = ClientRegistry::new();
        let client = handle("abc");
        registry.insert("abc".to_string(), client.clone()).await;

        assert!(registry.contains("abc").await);
        let found = registry.lookup("abc").await.unwrap();
        assert!(Arc::ptr_eq(&found, &client));
        assert!(registry.lookup("other").await.is_none());

        assert!(registry.remove("abc").await.is_some());
        assert!(registry.lookup("abc").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_claim_prefers_free_custom_id() {
        let registry = ClientRegistry::new();
        let (id, client) = registry
            .claim(Some("foo"), "generated0000000000a", handle)
            .await;
        assert_eq!(id, "foo");
        assert_eq!(client.id(), "foo");
        assert!(registry.contains("foo").await);
        assert!(!registry.contains("generated0000000000a").await);
    }

    #[tokio::test]
    async fn test_claim_conflict_falls_back_and_keeps_owner() {
        let registry = ClientRegistry::new();
        let (_, owner) = registry.claim(Some("foo"), "first", handle).await;
        let (id, second) = registry.claim(Some("foo"), "second", handle).await;

        assert_eq!(id, "second");
        assert!(Arc::ptr_eq(&registry.lookup("foo").await.unwrap(), &owner));
        assert!(Arc::ptr_eq(&registry.lookup("second").await.unwrap(), &second));
        assert_eq!(registry.ids().await, vec!["foo", "second"]);
    }

    #[tokio::test]
    async fn test_remove_client_ignores_other_owner() {
        let registry = ClientRegistry::new();
        let owner = handle("foo");
        let stranger = handle("foo");
        registry.insert("foo".to_string(), owner.clone()).await;

        assert!(!registry.remove_client("foo", &stranger).await);
        assert!(registry.contains("foo").await);
        assert!(registry.remove_client("foo", &owner).await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        let registry = ClientRegistry::new();
        let mut tasks = Vec::new();
        for n in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let fallback = format!("client{n}");
                registry.claim(Some("shared"), &fallback, handle).await.0
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() == "shared" {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.len().await, 16);
    }
}
