//! Environment-scoped workload entities. Their namespace maps back to an
//! environment through the resource mapping.
use super::{CRDS_GROUP, Entity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_router::ScopeRequirement;
use tether_wire::{Gvk, ObjectMeta};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AppSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
}

impl Entity for App {
    const SCOPE: ScopeRequirement = ScopeRequirement::Environment;

    fn gvk() -> Gvk {
        Gvk::new(CRDS_GROUP, "v1", "App")
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedService {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ManagedServiceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
}

impl Entity for ManagedService {
    const SCOPE: ScopeRequirement = ScopeRequirement::Environment;

    fn gvk() -> Gvk {
        Gvk::new(CRDS_GROUP, "v1", "ManagedService")
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
