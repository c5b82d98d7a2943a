// Values handed to every domain handler alongside the typed entity.
use chrono::{DateTime, Utc};
use tether_common::names::{AccountName, ClusterName, EnvironmentName};

/// Ordering hint for last-write-wins handlers.
///
/// The router does not reject stale updates itself; it passes the
/// broker-assigned ingestion time so the handler can compare it with the last
/// one applied for the same resource identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateContext {
    pub message_timestamp: DateTime<Utc>,
    pub cluster_name: ClusterName,
}

/// Tenant context recovered from the envelope and, for environment-scoped
/// resources, from the resource mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceScope {
    pub account: AccountName,
    pub environment: Option<EnvironmentName>,
}

impl ResourceScope {
    pub fn account(account: AccountName) -> Self {
        Self {
            account,
            environment: None,
        }
    }

    pub fn environment(account: AccountName, environment: EnvironmentName) -> Self {
        Self {
            account,
            environment: Some(environment),
        }
    }
}
