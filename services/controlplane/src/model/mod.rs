//! Control-plane data model module.
//!
//! # Purpose
//! Typed entities the GVK router converts observed-state documents into, plus
//! the change payload published to the fan-out subjects.
mod change;
mod cluster;
mod workload;

pub use change::{ChangeAction, ChangeEvent};
pub use cluster::{Cluster, ClusterSpec, NodePool, NodePoolSpec};
pub use workload::{App, AppSpec, Container, ManagedService, ManagedServiceSpec};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_router::ScopeRequirement;
use tether_wire::{Gvk, ObjectMeta};

pub const CLUSTERS_GROUP: &str = "clusters.tether.io";
pub const CRDS_GROUP: &str = "crds.tether.io";

/// An entity with a fixed GVK and a known tenant scope.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const SCOPE: ScopeRequirement;

    fn gvk() -> Gvk;

    fn metadata(&self) -> &ObjectMeta;

    fn name(&self) -> &str {
        &self.metadata().name
    }
}
