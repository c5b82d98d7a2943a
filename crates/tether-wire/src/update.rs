// Inner JSON documents carried by the resource-update and error-report envelopes.
use crate::document::Document;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inner schema discriminator. Documents without one are treated as `v1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    #[default]
    V1,
    #[serde(other)]
    Unknown,
}

/// Status reported by the agent alongside an observed object.
///
/// Only [`ResourceStatus::Deleted`] changes routing; any other value, including
/// ones this build does not know, is an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceStatus {
    #[default]
    Updated,
    Deleting,
    Deleted,
    Other(String),
}

impl ResourceStatus {
    pub fn is_deleted(&self) -> bool {
        matches!(self, ResourceStatus::Deleted)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResourceStatus::Updated => "updated",
            ResourceStatus::Deleting => "deleting",
            ResourceStatus::Deleted => "deleted",
            ResourceStatus::Other(value) => value,
        }
    }
}

impl From<String> for ResourceStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "updated" | "update" => ResourceStatus::Updated,
            "deleting" => ResourceStatus::Deleting,
            "deleted" => ResourceStatus::Deleted,
            _ => ResourceStatus::Other(value),
        }
    }
}

impl From<ResourceStatus> for String {
    fn from(value: ResourceStatus) -> String {
        match value {
            ResourceStatus::Other(value) => value,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of one object in a tenant cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdate {
    #[serde(default)]
    pub schema_version: SchemaVersion,
    pub object: Document,
    #[serde(default)]
    pub resource_status: ResourceStatus,
}

impl ResourceUpdate {
    pub fn new(object: Document, resource_status: ResourceStatus) -> Self {
        Self {
            schema_version: SchemaVersion::V1,
            object,
            resource_status,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Serialize)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Deserialize)
    }
}

/// A command the agent failed to apply, with the agent's error text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(default)]
    pub schema_version: SchemaVersion,
    pub object: Document,
    pub error: String,
}

impl ErrorReport {
    pub fn new(object: Document, error: impl Into<String>) -> Self {
        Self {
            schema_version: SchemaVersion::V1,
            object,
            error: error.into(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Serialize)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Deserialize)
    }
}
