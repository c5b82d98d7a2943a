// Desired-state commands sent from the control plane to a tenant agent.
use crate::document::Document;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tether_common::names::{AccountName, ClusterName};

/// Annotation carrying the per-resource record version; agents drop commands
/// whose version is not newer than the one they last applied.
pub const RECORD_VERSION_ANNOTATION: &str = "record-version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentAction {
    Apply,
    Delete,
    Restart,
}

impl AgentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentAction::Apply => "apply",
            AgentAction::Delete => "delete",
            AgentAction::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCommand {
    pub account_name: AccountName,
    pub cluster_name: ClusterName,
    pub action: AgentAction,
    pub object: Document,
}

impl AgentCommand {
    pub fn new(
        account_name: AccountName,
        cluster_name: ClusterName,
        action: AgentAction,
        object: Document,
    ) -> Self {
        Self {
            account_name,
            cluster_name,
            action,
            object,
        }
    }

    /// Record version stamped on the object, if any.
    pub fn record_version(&self) -> Result<Option<u64>> {
        match self.object.annotation(RECORD_VERSION_ANNOTATION) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::InvalidAnnotation {
                    key: RECORD_VERSION_ANNOTATION.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Serialize)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Gvk;
    use serde_json::json;

    fn command(action: AgentAction) -> AgentCommand {
        AgentCommand::new(
            AccountName::new("acme").expect("account"),
            ClusterName::new("c1").expect("cluster"),
            action,
            Document::new(&Gvk::new("clusters.tether.io", "v1", "Cluster"), "c1"),
        )
    }

    #[test]
    fn json_shape_matches_agent_contract() {
        let mut cmd = command(AgentAction::Apply);
        cmd.object.set_annotation(RECORD_VERSION_ANNOTATION, "5");
        let value: serde_json::Value =
            serde_json::from_slice(&cmd.to_json().expect("encode")).expect("json");
        assert_eq!(value["accountName"], json!("acme"));
        assert_eq!(value["clusterName"], json!("c1"));
        assert_eq!(value["action"], json!("apply"));
        assert_eq!(
            value["object"]["metadata"]["annotations"]["record-version"],
            json!("5")
        );
    }

    #[test]
    fn record_version_parsing() {
        let mut cmd = command(AgentAction::Apply);
        assert_eq!(cmd.record_version().expect("absent"), None);
        cmd.object.set_annotation(RECORD_VERSION_ANNOTATION, "12");
        assert_eq!(cmd.record_version().expect("present"), Some(12));
        cmd.object.set_annotation(RECORD_VERSION_ANNOTATION, "twelve");
        assert!(matches!(
            cmd.record_version(),
            Err(Error::InvalidAnnotation { .. })
        ));
    }

    #[test]
    fn restart_action_round_trips() {
        let cmd = command(AgentAction::Restart);
        let decoded = AgentCommand::from_json(&cmd.to_json().expect("encode")).expect("decode");
        assert_eq!(decoded.action, AgentAction::Restart);
    }

    #[test]
    fn invalid_account_name_is_rejected() {
        let raw = br#"{"accountName":"a.b","clusterName":"c1","action":"apply","object":{}}"#;
        assert!(AgentCommand::from_json(raw).is_err());
    }
}
