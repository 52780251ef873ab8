//! The shared registry: service catalog plus key/value store.
//!
//! The registry is a consumed interface — a deployment points it at
//! whatever coordination service it runs (Consul, etcd, or similar
//! would slot behind [`Registry`]). This crate ships
//! [`MemoryRegistry`], a cheaply clonable shared in-process
//! implementation used by tests and single-host deployments; its reads
//! are consistent by construction, which is what owner lookups
//! require.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{ClusterId, NodeUid};

/// Key prefix under which node-ownership entries live.
pub const NODE_OWNER_PREFIX: &str = "tensormesh.node.";

/// The KV key recording which cluster owns a shared node id.
#[must_use]
pub fn node_owner_key(uid: &str) -> String {
    format!("{NODE_OWNER_PREFIX}{uid}")
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry service cannot be reached.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The registry rejected the request.
    #[error("registry rejected request: {0}")]
    Rejected(String),
}

/// Shared peer-discovery and coordination service.
///
/// `register` must be idempotent across restarts with the same id.
/// `get_kv` must give consistent reads for owner-lookup keys.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Advertise this process under the shared service.
    async fn register(&self, cluster_id: &str, address: &str) -> Result<(), RegistryError>;

    /// Remove this process from the catalog.
    async fn deregister(&self, cluster_id: &str) -> Result<(), RegistryError>;

    /// All registered processes, self included; callers filter their
    /// own id.
    async fn list_members(&self) -> Result<HashMap<ClusterId, String>, RegistryError>;

    /// Write a key.
    async fn set_kv(&self, key: &str, value: &str) -> Result<(), RegistryError>;

    /// Read a key (consistent).
    async fn get_kv(&self, key: &str) -> Result<Option<String>, RegistryError>;
}

/// A registered member's catalog entry.
#[derive(Debug, Clone)]
struct Member {
    address: String,
    registered_at_ms: i64,
}

#[derive(Debug, Default)]
struct RegistryState {
    members: HashMap<ClusterId, Member>,
    kv: HashMap<String, String>,
}

/// In-process registry with shared state across clones.
///
/// Every clone observes the same catalog and KV map, so sessions in
/// one process (or one test) coordinate exactly as they would through
/// an external service.
#[derive(Debug, Default, Clone)]
pub struct MemoryRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of owner entries currently recorded.
    #[must_use]
    pub fn owner_entry_count(&self) -> usize {
        self.inner
            .read()
            .kv
            .keys()
            .filter(|k| k.starts_with(NODE_OWNER_PREFIX))
            .count()
    }

    /// The recorded owner of a shared node id, if any.
    #[must_use]
    pub fn owner_of(&self, uid: &NodeUid) -> Option<ClusterId> {
        self.inner.read().kv.get(&node_owner_key(uid)).cloned()
    }

    /// When a member first registered, in Unix milliseconds.
    #[must_use]
    pub fn registered_at_ms(&self, cluster_id: &str) -> Option<i64> {
        self.inner
            .read()
            .members
            .get(cluster_id)
            .map(|m| m.registered_at_ms)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, cluster_id: &str, address: &str) -> Result<(), RegistryError> {
        let mut state = self.inner.write();
        // re-registration updates the address but keeps the original
        // registration time
        let entry = state
            .members
            .entry(cluster_id.to_string())
            .or_insert_with(|| Member {
                address: address.to_string(),
                registered_at_ms: chrono::Utc::now().timestamp_millis(),
            });
        entry.address = address.to_string();
        Ok(())
    }

    async fn deregister(&self, cluster_id: &str) -> Result<(), RegistryError> {
        self.inner.write().members.remove(cluster_id);
        Ok(())
    }

    async fn list_members(&self) -> Result<HashMap<ClusterId, String>, RegistryError> {
        Ok(self
            .inner
            .read()
            .members
            .iter()
            .map(|(id, m)| (id.clone(), m.address.clone()))
            .collect())
    }

    async fn set_kv(&self, key: &str, value: &str) -> Result<(), RegistryError> {
        self.inner
            .write()
            .kv
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.inner.read().kv.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let reg = MemoryRegistry::new();
        reg.register("a", "127.0.0.1:1000").await.unwrap();
        let first_seen = reg.registered_at_ms("a").unwrap();
        reg.register("a", "127.0.0.1:1001").await.unwrap();
        let members = reg.list_members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members["a"], "127.0.0.1:1001");
        assert_eq!(reg.registered_at_ms("a"), Some(first_seen));
    }

    #[tokio::test]
    async fn test_deregister() {
        let reg = MemoryRegistry::new();
        reg.register("a", "x").await.unwrap();
        reg.deregister("a").await.unwrap();
        assert!(reg.list_members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let reg = MemoryRegistry::new();
        assert_eq!(reg.get_kv("k").await.unwrap(), None);
        reg.set_kv("k", "v").await.unwrap();
        assert_eq!(reg.get_kv("k").await.unwrap(), Some("v".into()));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let reg = MemoryRegistry::new();
        let clone = reg.clone();
        clone.set_kv(&node_owner_key("u1"), "a").await.unwrap();
        assert_eq!(reg.owner_of(&"u1".to_string()), Some("a".into()));
        assert_eq!(reg.owner_entry_count(), 1);
    }

    #[test]
    fn test_owner_key_prefix() {
        assert_eq!(node_owner_key("abc"), "tensormesh.node.abc");
    }
}
