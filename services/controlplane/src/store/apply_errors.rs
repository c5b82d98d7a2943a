//! Latest apply failure per resource, as reported by tenant agents.
use async_trait::async_trait;
use std::collections::HashMap;
use tether_common::names::{AccountName, ClusterName};
use tether_router::{ApplyError, ApplyErrorHandler};
use tether_wire::Gvk;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ErrorKey {
    account: AccountName,
    cluster: ClusterName,
    gvk: Gvk,
    namespace: Option<String>,
    name: String,
}

#[derive(Debug, Default)]
pub struct ApplyErrorLog {
    latest: RwLock<HashMap<ErrorKey, ApplyError>>,
}

impl ApplyErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors currently recorded for one tenant cluster, oldest first.
    pub async fn errors_for(&self, account: &AccountName, cluster: &ClusterName) -> Vec<ApplyError> {
        let mut errors: Vec<ApplyError> = self
            .latest
            .read()
            .await
            .values()
            .filter(|error| &error.account == account && &error.cluster == cluster)
            .cloned()
            .collect();
        errors.sort_by_key(|error| error.reported_at);
        errors
    }

    /// Forget the error for a resource, e.g. after a successful re-apply.
    pub async fn clear(
        &self,
        account: &AccountName,
        cluster: &ClusterName,
        gvk: &Gvk,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<ApplyError> {
        let key = ErrorKey {
            account: account.clone(),
            cluster: cluster.clone(),
            gvk: gvk.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        self.latest.write().await.remove(&key)
    }
}

#[async_trait]
impl ApplyErrorHandler for ApplyErrorLog {
    async fn on_apply_error(&self, error: ApplyError) -> anyhow::Result<()> {
        metrics::counter!("tether_apply_errors_total", "gvk" => error.gvk.to_string()).increment(1);
        let key = ErrorKey {
            account: error.account.clone(),
            cluster: error.cluster.clone(),
            gvk: error.gvk.clone(),
            namespace: error.namespace.clone(),
            name: error.name.clone(),
        };
        let mut latest = self.latest.write().await;
        // Redelivered older reports must not replace a newer one.
        match latest.get(&key) {
            Some(existing) if existing.reported_at >= error.reported_at => {}
            _ => {
                latest.insert(key, error);
            }
        }
        Ok(())
    }
}
