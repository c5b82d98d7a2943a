// Resource mapping boundary: recovers the environment of a namespaced object
// that does not carry it itself.
use async_trait::async_trait;
use std::fmt;
use tether_common::names::{AccountName, ClusterName, EnvironmentName};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingKey {
    pub account: AccountName,
    pub resource_type: String,
    pub cluster: ClusterName,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.account, self.cluster, self.resource_type, self.namespace, self.name
        )
    }
}

#[async_trait]
pub trait ResourceMappings: Send + Sync {
    /// `Ok(None)` is a miss; the router treats it as transient because the
    /// mapping may not have landed yet.
    async fn environment_for(&self, key: &MappingKey) -> anyhow::Result<Option<EnvironmentName>>;
}
