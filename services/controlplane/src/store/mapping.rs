//! Resource mapping store: `(account, type, cluster, namespace, name)` to
//! environment. Written when the control plane applies an environment-scoped
//! resource, read by the router when the agent reports it back.
use async_trait::async_trait;
use std::collections::HashMap;
use tether_common::names::EnvironmentName;
use tether_router::{MappingKey, ResourceMappings};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MappingStore {
    entries: RwLock<HashMap<MappingKey, EnvironmentName>>,
}

impl MappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key -> environment`, returning the previous environment if any.
    pub async fn upsert(&self, key: MappingKey, environment: EnvironmentName) -> Option<EnvironmentName> {
        let previous = self.entries.write().await.insert(key.clone(), environment.clone());
        if let Some(previous) = &previous
            && previous != &environment
        {
            tracing::info!(%key, from = %previous, to = %environment, "resource mapping moved");
        }
        previous
    }

    pub async fn remove(&self, key: &MappingKey) -> Option<EnvironmentName> {
        self.entries.write().await.remove(key)
    }

    pub async fn get(&self, key: &MappingKey) -> Option<EnvironmentName> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ResourceMappings for MappingStore {
    async fn environment_for(&self, key: &MappingKey) -> anyhow::Result<Option<EnvironmentName>> {
        Ok(self.get(key).await)
    }
}
