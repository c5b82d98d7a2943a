//! Account-scoped infrastructure entities.
use super::{CLUSTERS_GROUP, Entity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_router::ScopeRequirement;
use tether_wire::{Gvk, ObjectMeta};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_mode: Option<String>,
}

impl Entity for Cluster {
    const SCOPE: ScopeRequirement = ScopeRequirement::Account;

    fn gvk() -> Gvk {
        Gvk::new(CLUSTERS_GROUP, "v1", "Cluster")
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodePoolSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    #[serde(default)]
    pub min_count: u32,
    #[serde(default)]
    pub max_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

impl Entity for NodePool {
    const SCOPE: ScopeRequirement = ScopeRequirement::Account;

    fn gvk() -> Gvk {
        Gvk::new(CLUSTERS_GROUP, "v1", "NodePool")
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
