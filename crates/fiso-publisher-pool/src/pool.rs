use std::collections::HashMap;
use std::sync::Arc;

use fiso_core::{ClusterConfig, FisoResult};
use tokio::sync::RwLock;

use crate::producer::Producer;

/// Shared producer clients keyed by named cluster config (§3, §5). Concurrent
/// readers share a `producer()` lookup; first use of a cluster takes the
/// slow path once (shared lock miss -> exclusive lock -> re-check -> dial),
/// so two flows racing to publish to the same cluster never open two
/// connections.
#[derive(Default)]
pub struct PublisherPool {
    clusters: RwLock<HashMap<String, ClusterConfig>>,
    producers: RwLock<HashMap<String, Arc<Producer>>>,
}

impl PublisherPool {
    pub fn new() -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a named cluster so flows can refer to it by name instead of
    /// repeating broker lists inline.
    pub async fn register_cluster(&self, name: impl Into<String>, cfg: ClusterConfig) {
        self.clusters.write().await.insert(name.into(), cfg);
    }

    /// Returns the producer for a named, pre-registered cluster.
    pub async fn producer(&self, cluster_name: &str) -> FisoResult<Arc<Producer>> {
        if let Some(producer) = self.producers.read().await.get(cluster_name) {
            return Ok(Arc::clone(producer));
        }
        let cfg = self
            .clusters
            .read()
            .await
            .get(cluster_name)
            .cloned()
            .ok_or_else(|| {
                fiso_core::FisoError::Config(format!("unknown cluster {cluster_name:?}"))
            })?;
        self.producer_for(cluster_name.to_string(), &cfg).await
    }

    /// Returns the producer for an inline (unnamed) cluster config, keyed by
    /// its sorted broker list (§3 PublisherPool entry).
    pub async fn producer_for_inline(&self, cfg: &ClusterConfig) -> FisoResult<Arc<Producer>> {
        let key = cfg.inline_key();
        if let Some(producer) = self.producers.read().await.get(&key) {
            return Ok(Arc::clone(producer));
        }
        self.producer_for(key, cfg).await
    }

    async fn producer_for(&self, key: String, cfg: &ClusterConfig) -> FisoResult<Arc<Producer>> {
        let mut producers = self.producers.write().await;
        if let Some(producer) = producers.get(&key) {
            return Ok(Arc::clone(producer));
        }
        let producer = Arc::new(Producer::connect(cfg).await?);
        producers.insert(key, Arc::clone(&producer));
        Ok(producer)
    }

    pub async fn producer_count(&self) -> usize {
        self.producers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_cluster_name_is_a_config_error() {
        let pool = PublisherPool::new();
        let err = pool.producer("does-not-exist").await.unwrap_err();
        assert!(matches!(err, fiso_core::FisoError::Config(_)));
    }

    #[tokio::test]
    async fn inline_key_is_stable_for_reordered_brokers() {
        let cfg_a = ClusterConfig {
            brokers: vec!["a:9092".into(), "b:9092".into()],
            auth: None,
            tls: None,
        };
        let cfg_b = ClusterConfig {
            brokers: vec!["b:9092".into(), "a:9092".into()],
            auth: None,
            tls: None,
        };
        assert_eq!(cfg_a.inline_key(), cfg_b.inline_key());
    }
}
