//! In-memory reference implementation of the domain handler contract.
//!
//! # Purpose
//! [`ResourceStore`] holds the last observed state of one entity type and
//! implements [`ResourceHandler`] for it, so the GVK router can feed it
//! directly. It exists for:
//! - local development and tests (no external dependencies)
//! - documenting the contract durable handlers must follow
//!
//! # Consistency
//! - Upserts are keyed by natural identity ([`RecordKey`]), never by delivery
//!   count, so replaying the same update is a no-op.
//! - Last-write-wins: an update or delete whose broker timestamp is not newer
//!   than the last one applied for the same key is discarded. Admission and the
//!   map write happen under the same write lock.
//! - Deletes leave a tombstone watermark; a stale redelivered update cannot
//!   resurrect the resource. Tombstones accumulate until
//!   [`ResourceStore::prune_tombstones`] drops them.
//!
//! # Change notifications
//! After every applied mutation a [`ChangeEvent`] is published to the fan-out
//! subject for the resource. Publishing is best effort: a failure is logged
//! and counted, and the mutation stands.
use crate::model::{ChangeAction, ChangeEvent, Entity};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tether_broker::Bus;
use tether_common::names::{AccountName, ClusterName, EnvironmentName};
use tether_common::{Admission, StalenessGuard};
use tether_router::{ResourceHandler, ResourceScope, UpdateContext};
use tether_wire::subject;
use tokio::sync::RwLock;

/// Where a resource lives: on one tenant cluster, or in a logical environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Cluster(ClusterName),
    Environment(EnvironmentName),
}

/// Natural identity of a stored resource within one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub account: AccountName,
    pub owner: Owner,
    pub name: String,
}

impl RecordKey {
    pub fn in_cluster(account: AccountName, cluster: ClusterName, name: impl Into<String>) -> Self {
        Self {
            account,
            owner: Owner::Cluster(cluster),
            name: name.into(),
        }
    }

    pub fn in_environment(
        account: AccountName,
        environment: EnvironmentName,
        name: impl Into<String>,
    ) -> Self {
        Self {
            account,
            owner: Owner::Environment(environment),
            name: name.into(),
        }
    }

    fn from_update(scope: &ResourceScope, ctx: &UpdateContext, name: &str) -> Self {
        match &scope.environment {
            Some(environment) => Self::in_environment(scope.account.clone(), environment.clone(), name),
            None => Self::in_cluster(scope.account.clone(), ctx.cluster_name.clone(), name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    pub entity: T,
    /// Cluster that last reported the resource.
    pub cluster: ClusterName,
    pub observed_at: DateTime<Utc>,
}

pub struct ResourceStore<T: Entity> {
    records: RwLock<HashMap<RecordKey, Record<T>>>,
    guard: StalenessGuard<RecordKey>,
    notifier: Option<Arc<dyn Bus>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Default for ResourceStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> ResourceStore<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            guard: StalenessGuard::new(),
            notifier: None,
            _entity: PhantomData,
        }
    }

    /// Publish a [`ChangeEvent`] on `bus` after every applied mutation.
    pub fn with_notifier(mut self, bus: Arc<dyn Bus>) -> Self {
        self.notifier = Some(bus);
        self
    }

    pub async fn get(&self, key: &RecordKey) -> Option<Record<T>> {
        self.records.read().await.get(key).cloned()
    }

    pub async fn list(&self, account: &AccountName) -> Vec<Record<T>> {
        self.records
            .read()
            .await
            .iter()
            .filter(|(key, _)| &key.account == account)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub fn is_deleted(&self, key: &RecordKey) -> bool {
        self.guard.is_deleted(key)
    }

    /// Forget tombstones for deletes observed before `before`. Only safe once
    /// no update older than `before` can still be redelivered.
    pub async fn prune_tombstones(&self, before: DateTime<Utc>) -> usize {
        let _records = self.records.write().await;
        let pruned = self.guard.prune_tombstones(before);
        if pruned > 0 {
            tracing::debug!(kind = %T::gvk().kind, pruned, "pruned tombstones");
        }
        pruned
    }

    fn stale(&self, key: &RecordKey, ctx: &UpdateContext, last_applied: DateTime<Utc>) {
        let kind = T::gvk().kind;
        tracing::debug!(
            kind = %kind,
            account = %key.account,
            name = %key.name,
            observed_at = %ctx.message_timestamp,
            %last_applied,
            "discarding stale update"
        );
        metrics::counter!("tether_store_stale_total", "kind" => kind).increment(1);
    }

    async fn notify(&self, key: &RecordKey, entity: &T, ctx: &UpdateContext, action: ChangeAction) {
        let Some(bus) = &self.notifier else {
            return;
        };
        let kind = T::gvk().kind;
        let (subject, environment) = match &key.owner {
            Owner::Cluster(cluster) => (
                subject::cluster_change(&key.account, cluster, Some((kind.as_str(), key.name.as_str()))),
                None,
            ),
            Owner::Environment(environment) => (
                subject::environment_change(&key.account, environment, &kind, &key.name),
                Some(environment.to_string()),
            ),
        };
        let event = ChangeEvent {
            kind: kind.clone(),
            name: key.name.clone(),
            namespace: entity.metadata().namespace.clone(),
            account: key.account.to_string(),
            cluster: ctx.cluster_name.to_string(),
            environment,
            action,
            observed_at: ctx.message_timestamp,
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode change event");
                return;
            }
        };
        if let Err(err) = bus.publish(&subject, payload).await {
            metrics::counter!("tether_store_notify_failures_total", "kind" => kind).increment(1);
            tracing::warn!(%subject, error = %err, "failed to publish change event");
        }
    }
}

#[async_trait]
impl<T: Entity> ResourceHandler<T> for ResourceStore<T> {
    async fn on_update(
        &self,
        scope: &ResourceScope,
        entity: T,
        ctx: &UpdateContext,
    ) -> anyhow::Result<()> {
        let key = RecordKey::from_update(scope, ctx, entity.name());
        {
            let mut records = self.records.write().await;
            if let Admission::Stale { last_applied } =
                self.guard.admit(key.clone(), ctx.message_timestamp)
            {
                self.stale(&key, ctx, last_applied);
                return Ok(());
            }
            records.insert(
                key.clone(),
                Record {
                    entity: entity.clone(),
                    cluster: ctx.cluster_name.clone(),
                    observed_at: ctx.message_timestamp,
                },
            );
        }
        self.notify(&key, &entity, ctx, ChangeAction::Updated).await;
        Ok(())
    }

    async fn on_delete(
        &self,
        scope: &ResourceScope,
        entity: T,
        ctx: &UpdateContext,
    ) -> anyhow::Result<()> {
        let key = RecordKey::from_update(scope, ctx, entity.name());
        {
            let mut records = self.records.write().await;
            if let Admission::Stale { last_applied } =
                self.guard.admit_delete(key.clone(), ctx.message_timestamp)
            {
                self.stale(&key, ctx, last_applied);
                return Ok(());
            }
            records.remove(&key);
        }
        self.notify(&key, &entity, ctx, ChangeAction::Deleted).await;
        Ok(())
    }
}
