// Registration table mapping a GVK to its typed conversion and handler pair.
use crate::context::{ResourceScope, UpdateContext};
use crate::{RouteError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tether_wire::{Document, Gvk};

/// Domain handler contract for one entity type.
///
/// Handlers are expected to be idempotent (upsert by natural identity) and to
/// discard updates whose `ctx.message_timestamp` is not newer than the last
/// one applied for the same resource.
#[async_trait]
pub trait ResourceHandler<T>: Send + Sync {
    async fn on_update(&self, scope: &ResourceScope, entity: T, ctx: &UpdateContext)
    -> anyhow::Result<()>;
    async fn on_delete(&self, scope: &ResourceScope, entity: T, ctx: &UpdateContext)
    -> anyhow::Result<()>;
}

/// Whether the handler needs the environment recovered from the resource mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRequirement {
    Account,
    Environment,
}

#[async_trait]
pub(crate) trait Route: Send + Sync {
    fn requirement(&self) -> ScopeRequirement;
    async fn dispatch(
        &self,
        scope: &ResourceScope,
        object: &Document,
        deleted: bool,
        ctx: &UpdateContext,
    ) -> Result<()>;
}

struct TypedRoute<T, H: ?Sized> {
    gvk: Gvk,
    handler: Arc<H>,
    requirement: ScopeRequirement,
    _entity: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> Route for TypedRoute<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: ResourceHandler<T> + ?Sized + 'static,
{
    fn requirement(&self) -> ScopeRequirement {
        self.requirement
    }

    async fn dispatch(
        &self,
        scope: &ResourceScope,
        object: &Document,
        deleted: bool,
        ctx: &UpdateContext,
    ) -> Result<()> {
        let entity: T = object.to_typed().map_err(|source| RouteError::Conversion {
            gvk: self.gvk.clone(),
            name: object.name().to_string(),
            source,
        })?;
        let result = if deleted {
            self.handler.on_delete(scope, entity, ctx).await
        } else {
            self.handler.on_update(scope, entity, ctx).await
        };
        result.map_err(|source| RouteError::Handler {
            gvk: self.gvk.clone(),
            source,
        })
    }
}

/// GVK dispatch table, populated once at startup.
#[derive(Default)]
pub struct Registry {
    routes: HashMap<Gvk, Arc<dyn Route>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `gvk`. A later registration for the same GVK
    /// replaces the earlier one.
    pub fn register<T, H>(&mut self, gvk: Gvk, requirement: ScopeRequirement, handler: Arc<H>)
    where
        T: DeserializeOwned + Send + 'static,
        H: ResourceHandler<T> + ?Sized + 'static,
    {
        let route = TypedRoute {
            gvk: gvk.clone(),
            handler,
            requirement,
            _entity: PhantomData,
        };
        if self.routes.insert(gvk.clone(), Arc::new(route)).is_some() {
            tracing::warn!(%gvk, "replacing existing route");
        }
    }

    pub fn contains(&self, gvk: &Gvk) -> bool {
        self.routes.contains_key(gvk)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn gvks(&self) -> Vec<Gvk> {
        let mut gvks: Vec<Gvk> = self.routes.keys().cloned().collect();
        gvks.sort();
        gvks
    }

    pub(crate) fn get(&self, gvk: &Gvk) -> Option<Arc<dyn Route>> {
        self.routes.get(gvk).cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("gvks", &self.gvks()).finish()
    }
}
