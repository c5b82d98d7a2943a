//! Outbound dispatcher: desired-state commands to one tenant cluster.
//!
//! # Purpose
//! Wraps a [`Document`] in an [`AgentCommand`] and publishes it to the subject
//! dedicated to `(account, cluster)`.
//!
//! # Guarantees
//! - A successful return means the broker accepted the command, not that the
//!   agent applied it.
//! - Publish errors are returned to the caller as-is; there is no retry here.
//! - Apply commands carry a `record-version` annotation that strictly
//!   increases per `(account, cluster, resource identity)`. A non-increasing
//!   version is rejected before anything is published.
//! - A version is only consumed once the command is stored by the broker; a
//!   failed publish releases it so the caller can retry with the same version.
//! - Commands go through [`Bus::persist`], so a cluster subject with no
//!   backing stream is an error rather than a silent drop.
use crate::store::MappingStore;
use bytes::Bytes;
use std::sync::Arc;
use tether_broker::{Bus, BusError};
use tether_common::names::{AccountName, ClusterName, EnvironmentName};
use tether_common::{StaleVersion, VersionGate};
use tether_router::MappingKey;
use tether_wire::{AgentAction, AgentCommand, Document, Gvk, RECORD_VERSION_ANNOTATION, subject};

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("stale record version for {resource}")]
    StaleRecordVersion {
        resource: String,
        #[source]
        source: StaleVersion,
    },
    #[error("failed to encode agent command")]
    Encode(#[source] tether_wire::Error),
    #[error(transparent)]
    Publish(#[from] BusError),
    #[error("{gvk} {name:?} has no namespace; environment-scoped resources need one")]
    MissingNamespace { gvk: Gvk, name: String },
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResourceIdentity {
    account: AccountName,
    cluster: ClusterName,
    gvk: Gvk,
    namespace: Option<String>,
    name: String,
}

impl ResourceIdentity {
    fn of(account: &AccountName, cluster: &ClusterName, object: &Document) -> Self {
        Self {
            account: account.clone(),
            cluster: cluster.clone(),
            gvk: object.gvk(),
            namespace: object.namespace().map(str::to_string),
            name: object.name().to_string(),
        }
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {} ", self.account, self.cluster, self.gvk)?;
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

pub struct Dispatcher {
    bus: Arc<dyn Bus>,
    versions: VersionGate<ResourceIdentity>,
    mappings: Option<Arc<MappingStore>>,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            versions: VersionGate::new(),
            mappings: None,
        }
    }

    /// Record resource mappings for [`Dispatcher::apply_in_environment`].
    pub fn with_mappings(mut self, mappings: Arc<MappingStore>) -> Self {
        self.mappings = Some(mappings);
        self
    }

    /// Record version the next apply of `object` on `(account, cluster)` should carry.
    pub fn next_record_version(
        &self,
        account: &AccountName,
        cluster: &ClusterName,
        object: &Document,
    ) -> u64 {
        self.versions
            .next(&ResourceIdentity::of(account, cluster, object))
    }

    /// Last record version accepted for `object` on `(account, cluster)`.
    pub fn current_record_version(
        &self,
        account: &AccountName,
        cluster: &ClusterName,
        object: &Document,
    ) -> Option<u64> {
        self.versions
            .current(&ResourceIdentity::of(account, cluster, object))
    }

    pub async fn apply_to_target_cluster(
        &self,
        account: &AccountName,
        cluster: &ClusterName,
        mut object: Document,
        record_version: u64,
    ) -> DispatchResult<()> {
        let identity = ResourceIdentity::of(account, cluster, &object);
        let resource = identity.to_string();
        let previous = self
            .versions
            .advance(identity.clone(), record_version)
            .map_err(|source| DispatchError::StaleRecordVersion { resource, source })?;
        object.set_annotation(RECORD_VERSION_ANNOTATION, record_version.to_string());
        let sent = self.send(account, cluster, AgentAction::Apply, object).await;
        if sent.is_err() {
            self.versions.revert(&identity, record_version, previous);
        }
        sent
    }

    /// Apply an environment-scoped resource, recording the mapping the router
    /// needs to recover the environment when the agent reports it back.
    pub async fn apply_in_environment(
        &self,
        account: &AccountName,
        cluster: &ClusterName,
        environment: &EnvironmentName,
        object: Document,
        record_version: u64,
    ) -> DispatchResult<()> {
        if let Some(mappings) = &self.mappings {
            let Some(namespace) = object.namespace() else {
                return Err(DispatchError::MissingNamespace {
                    gvk: object.gvk(),
                    name: object.name().to_string(),
                });
            };
            let key = MappingKey {
                account: account.clone(),
                resource_type: object.kind.clone(),
                cluster: cluster.clone(),
                namespace: namespace.to_string(),
                name: object.name().to_string(),
            };
            mappings.upsert(key, environment.clone()).await;
        }
        self.apply_to_target_cluster(account, cluster, object, record_version)
            .await
    }

    pub async fn delete_from_target_cluster(
        &self,
        account: &AccountName,
        cluster: &ClusterName,
        object: Document,
    ) -> DispatchResult<()> {
        self.send(account, cluster, AgentAction::Delete, object).await
    }

    pub async fn restart_on_target_cluster(
        &self,
        account: &AccountName,
        cluster: &ClusterName,
        object: Document,
    ) -> DispatchResult<()> {
        self.send(account, cluster, AgentAction::Restart, object).await
    }

    async fn send(
        &self,
        account: &AccountName,
        cluster: &ClusterName,
        action: AgentAction,
        object: Document,
    ) -> DispatchResult<()> {
        let gvk = object.gvk();
        let name = object.name().to_string();
        let command = AgentCommand::new(account.clone(), cluster.clone(), action, object);
        let payload = command.to_json().map_err(DispatchError::Encode)?;
        let subject = subject::agent_commands(account, cluster);
        self.bus.persist(&subject, Bytes::from(payload)).await?;
        metrics::counter!("tether_dispatcher_published_total", "action" => action.as_str())
            .increment(1);
        tracing::debug!(%account, %cluster, %gvk, %name, action = action.as_str(), "command published");
        Ok(())
    }
}
