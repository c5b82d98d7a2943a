use crate::context::{ResourceScope, UpdateContext};
use crate::mapping::{MappingKey, ResourceMappings};
use crate::registry::{Registry, ScopeRequirement};
use crate::{Result, RouteError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tether_broker::{ConsumeOptions, ConsumedMessage, MessageHandler};
use tether_common::names::{AccountName, ClusterName};
use tether_wire::{Envelope, EnvelopeKind, Gvk, ResourceUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Update,
    Delete,
}

/// Result of routing one envelope that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched { gvk: Gvk, action: RouteAction },
    MissingRoutingKey,
    UnknownGvk(Gvk),
}

pub struct Router {
    registry: Registry,
    mappings: Arc<dyn ResourceMappings>,
}

impl Router {
    pub fn new(registry: Registry, mappings: Arc<dyn ResourceMappings>) -> Self {
        Self { registry, mappings }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Route one resource-update envelope received at `message.timestamp`.
    pub async fn route(&self, message: &ConsumedMessage) -> Result<RouteOutcome> {
        let envelope =
            Envelope::decode(message.payload.clone()).map_err(RouteError::MalformedEnvelope)?;
        if envelope.kind != EnvelopeKind::ResourceUpdate {
            return Err(RouteError::UnexpectedKind(envelope.kind));
        }
        let Some((account, cluster)) = routing_keys(&envelope, &message.subject)? else {
            return Ok(RouteOutcome::MissingRoutingKey);
        };

        let update = ResourceUpdate::from_json(&envelope.payload).map_err(RouteError::MalformedPayload)?;
        let gvk = update.object.gvk();
        let Some(route) = self.registry.get(&gvk) else {
            tracing::info!(%gvk, %account, %cluster, "no route for gvk; skipping");
            metrics::counter!(
                "tether_router_dispatch_total",
                "gvk" => gvk.to_string(),
                "outcome" => "unknown_gvk"
            )
            .increment(1);
            return Ok(RouteOutcome::UnknownGvk(gvk));
        };

        let scope = match route.requirement() {
            ScopeRequirement::Account => ResourceScope::account(account.clone()),
            ScopeRequirement::Environment => {
                let environment = self
                    .lookup_environment(&gvk, &account, &cluster, &update)
                    .await?;
                ResourceScope::environment(account.clone(), environment)
            }
        };

        let action = if update.resource_status.is_deleted() {
            RouteAction::Delete
        } else {
            RouteAction::Update
        };
        let ctx = UpdateContext {
            message_timestamp: message.timestamp,
            cluster_name: cluster.clone(),
        };
        tracing::debug!(
            %gvk,
            %account,
            %cluster,
            name = update.object.name(),
            status = %update.resource_status,
            "dispatching"
        );
        let result = route
            .dispatch(&scope, &update.object, action == RouteAction::Delete, &ctx)
            .await;
        let outcome = match (&result, action) {
            (Err(_), _) => "error",
            (Ok(()), RouteAction::Update) => "update",
            (Ok(()), RouteAction::Delete) => "delete",
        };
        metrics::counter!(
            "tether_router_dispatch_total",
            "gvk" => gvk.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        result.map(|()| RouteOutcome::Dispatched { gvk, action })
    }

    async fn lookup_environment(
        &self,
        gvk: &Gvk,
        account: &AccountName,
        cluster: &ClusterName,
        update: &ResourceUpdate,
    ) -> Result<tether_common::names::EnvironmentName> {
        let Some(namespace) = update.object.namespace() else {
            return Err(RouteError::MissingNamespace {
                gvk: gvk.clone(),
                name: update.object.name().to_string(),
            });
        };
        let key = MappingKey {
            account: account.clone(),
            resource_type: gvk.kind.clone(),
            cluster: cluster.clone(),
            namespace: namespace.to_string(),
            name: update.object.name().to_string(),
        };
        match self.mappings.environment_for(&key).await {
            Ok(Some(environment)) => Ok(environment),
            Ok(None) => Err(RouteError::MappingNotFound(key)),
            Err(source) => Err(RouteError::MappingLookup { key, source }),
        }
    }
}

/// Validate the envelope's routing keys. `Ok(None)` means one is missing and
/// the message must be dropped before any handler runs.
pub(crate) fn routing_keys(
    envelope: &Envelope,
    subject: &str,
) -> Result<Option<(AccountName, ClusterName)>> {
    if !envelope.has_routing_keys() {
        tracing::info!(
            subject,
            account = %envelope.account_name,
            cluster = %envelope.cluster_name,
            "envelope missing routing key; dropping"
        );
        metrics::counter!("tether_router_missing_routing_key_total").increment(1);
        return Ok(None);
    }
    let account =
        AccountName::new(envelope.account_name.as_str()).map_err(RouteError::InvalidRoutingKey)?;
    let cluster =
        ClusterName::new(envelope.cluster_name.as_str()).map_err(RouteError::InvalidRoutingKey)?;
    Ok(Some((account, cluster)))
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()> {
        self.route(&message).await?;
        Ok(())
    }
}

/// Consume options that ack and drop poison messages and nak everything else.
pub fn poison_policy() -> ConsumeOptions {
    ConsumeOptions::with_on_error(|err| match err.downcast_ref::<RouteError>() {
        Some(route_err) if route_err.is_poison() => Ok(()),
        _ => Err(anyhow::anyhow!("{err:#}")),
    })
}

/// Build a resource-update envelope; used by agents and tests.
pub fn encode_update(
    account: &str,
    cluster: &str,
    update: &ResourceUpdate,
) -> tether_wire::Result<Bytes> {
    let inner = Bytes::from(update.to_json()?);
    tether_wire::encode_outer(EnvelopeKind::ResourceUpdate, account, cluster, inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceHandler;
    use chrono::{TimeZone, Utc};
    use serde::Deserialize;
    use serde_json::json;
    use tether_common::names::EnvironmentName;
    use tether_wire::{Document, ResourceStatus};

    #[derive(Default)]
    struct Calls(std::sync::Mutex<Vec<String>>);

    impl Calls {
        fn push(&self, call: String) {
            self.0.lock().expect("calls").push(call);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().expect("calls"))
        }
    }

    #[derive(Debug, Deserialize)]
    struct Cluster {
        metadata: tether_wire::ObjectMeta,
    }

    #[derive(Debug, Deserialize)]
    struct App {
        metadata: tether_wire::ObjectMeta,
        spec: AppSpec,
    }

    #[derive(Debug, Deserialize)]
    struct AppSpec {
        image: String,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Calls,
    }

    #[async_trait]
    impl ResourceHandler<Cluster> for Recorder {
        async fn on_update(
            &self,
            scope: &ResourceScope,
            entity: Cluster,
            ctx: &UpdateContext,
        ) -> anyhow::Result<()> {
            self.calls.push(format!(
                "cluster-update {} {} {}",
                scope.account, entity.metadata.name, ctx.cluster_name
            ));
            Ok(())
        }

        async fn on_delete(
            &self,
            _scope: &ResourceScope,
            entity: Cluster,
            _ctx: &UpdateContext,
        ) -> anyhow::Result<()> {
            self.calls
                .push(format!("cluster-delete {}", entity.metadata.name));
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceHandler<App> for Recorder {
        async fn on_update(
            &self,
            scope: &ResourceScope,
            entity: App,
            _ctx: &UpdateContext,
        ) -> anyhow::Result<()> {
            let env = scope.environment.as_ref().map(|e| e.to_string()).unwrap_or_default();
            self.calls.push(format!(
                "app-update {} {} {}",
                env, entity.metadata.name, entity.spec.image
            ));
            Ok(())
        }

        async fn on_delete(
            &self,
            _scope: &ResourceScope,
            _entity: App,
            _ctx: &UpdateContext,
        ) -> anyhow::Result<()> {
            anyhow::bail!("store unavailable")
        }
    }

    struct OneMapping;

    #[async_trait]
    impl ResourceMappings for OneMapping {
        async fn environment_for(
            &self,
            key: &MappingKey,
        ) -> anyhow::Result<Option<EnvironmentName>> {
            if key.namespace == "env-dev" && key.name == "web" {
                return Ok(Some(EnvironmentName::new("dev")?));
            }
            Ok(None)
        }
    }

    fn cluster_gvk() -> Gvk {
        Gvk::new("clusters.tether.io", "v1", "Cluster")
    }

    fn app_gvk() -> Gvk {
        Gvk::new("apps.tether.io", "v1", "App")
    }

    fn router() -> (Router, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut registry = Registry::new();
        registry.register::<Cluster, _>(cluster_gvk(), ScopeRequirement::Account, recorder.clone());
        registry.register::<App, _>(app_gvk(), ScopeRequirement::Environment, recorder.clone());
        (Router::new(registry, Arc::new(OneMapping)), recorder)
    }

    fn message(account: &str, cluster: &str, update: &ResourceUpdate) -> ConsumedMessage {
        ConsumedMessage {
            subject: format!("resource-updates.account.{account}.cluster.{cluster}"),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts"),
            payload: encode_update(account, cluster, update).expect("encode"),
        }
    }

    fn app(namespace: Option<&str>, image: Option<&str>) -> Document {
        let mut doc = Document::new(&app_gvk(), "web");
        if let Some(namespace) = namespace {
            doc = doc.with_namespace(namespace);
        }
        if let Some(image) = image {
            doc = doc.with_field("spec", json!({"image": image}));
        }
        doc
    }

    #[tokio::test]
    async fn update_calls_update_handler_with_cluster_context() {
        let (router, recorder) = router();
        let update = ResourceUpdate::new(
            Document::new(&cluster_gvk(), "c1"),
            ResourceStatus::from("update".to_string()),
        );
        let outcome = router.route(&message("acme", "c1", &update)).await.expect("route");
        assert_eq!(
            outcome,
            RouteOutcome::Dispatched {
                gvk: cluster_gvk(),
                action: RouteAction::Update
            }
        );
        assert_eq!(recorder.calls.take(), vec!["cluster-update acme c1 c1"]);
    }

    #[tokio::test]
    async fn trait_object_handlers_can_be_registered() {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn ResourceHandler<Cluster>> = recorder.clone();
        let mut registry = Registry::new();
        registry.register::<Cluster, dyn ResourceHandler<Cluster>>(
            cluster_gvk(),
            ScopeRequirement::Account,
            handler,
        );
        let router = Router::new(registry, Arc::new(OneMapping));
        let update = ResourceUpdate::new(Document::new(&cluster_gvk(), "c1"), ResourceStatus::Updated);
        router.route(&message("acme", "c1", &update)).await.expect("route");
        assert_eq!(recorder.calls.take(), vec!["cluster-update acme c1 c1"]);
    }

    #[tokio::test]
    async fn deleted_status_calls_delete_handler() {
        let (router, recorder) = router();
        let update = ResourceUpdate::new(Document::new(&cluster_gvk(), "c1"), ResourceStatus::Deleted);
        router.route(&message("acme", "c1", &update)).await.expect("route");
        assert_eq!(recorder.calls.take(), vec!["cluster-delete c1"]);
    }

    #[tokio::test]
    async fn deletion_timestamp_alone_is_an_update() {
        let (router, recorder) = router();
        let mut doc = Document::new(&cluster_gvk(), "c1");
        doc.metadata.deletion_timestamp = Some(Utc::now());
        let update = ResourceUpdate::new(doc, ResourceStatus::Deleting);
        router.route(&message("acme", "c1", &update)).await.expect("route");
        assert_eq!(recorder.calls.take(), vec!["cluster-update acme c1 c1"]);
    }

    #[tokio::test]
    async fn missing_account_invokes_no_handler() {
        let (router, recorder) = router();
        let update = ResourceUpdate::new(Document::new(&cluster_gvk(), "c1"), ResourceStatus::Updated);
        let outcome = router.route(&message("", "c1", &update)).await.expect("route");
        assert_eq!(outcome, RouteOutcome::MissingRoutingKey);
        assert!(recorder.calls.take().is_empty());
    }

    #[tokio::test]
    async fn unknown_gvk_is_skipped_without_error() {
        let (router, recorder) = router();
        let widget = Document::new(&Gvk::from_api_version("v2", "Widget"), "w");
        let update = ResourceUpdate::new(widget, ResourceStatus::Updated);
        let outcome = router.route(&message("acme", "c1", &update)).await.expect("route");
        assert_eq!(outcome, RouteOutcome::UnknownGvk(Gvk::new("", "v2", "Widget")));
        assert!(recorder.calls.take().is_empty());
    }

    #[tokio::test]
    async fn environment_scoped_resource_uses_mapping() {
        let (router, recorder) = router();
        let update = ResourceUpdate::new(app(Some("env-dev"), Some("nginx")), ResourceStatus::Updated);
        router.route(&message("acme", "c1", &update)).await.expect("route");
        assert_eq!(recorder.calls.take(), vec!["app-update dev web nginx"]);
    }

    #[tokio::test]
    async fn mapping_miss_is_transient() {
        let (router, _) = router();
        let update = ResourceUpdate::new(app(Some("env-prod"), Some("nginx")), ResourceStatus::Updated);
        let err = router.route(&message("acme", "c1", &update)).await.expect_err("miss");
        assert!(matches!(err, RouteError::MappingNotFound(_)));
        assert!(!err.is_poison());
    }

    #[tokio::test]
    async fn missing_namespace_is_poison() {
        let (router, _) = router();
        let update = ResourceUpdate::new(app(None, Some("nginx")), ResourceStatus::Updated);
        let err = router.route(&message("acme", "c1", &update)).await.expect_err("no ns");
        assert!(err.is_poison());
    }

    #[tokio::test]
    async fn conversion_failure_is_poison() {
        let (router, recorder) = router();
        let update = ResourceUpdate::new(app(Some("env-dev"), None), ResourceStatus::Updated);
        let err = router.route(&message("acme", "c1", &update)).await.expect_err("convert");
        assert!(matches!(err, RouteError::Conversion { .. }));
        assert!(err.is_poison());
        assert!(recorder.calls.take().is_empty());
    }

    #[tokio::test]
    async fn handler_failure_is_transient() {
        let (router, _) = router();
        let update = ResourceUpdate::new(app(Some("env-dev"), Some("nginx")), ResourceStatus::Deleted);
        let err = router.route(&message("acme", "c1", &update)).await.expect_err("handler");
        assert!(matches!(err, RouteError::Handler { .. }));
        assert!(!err.is_poison());
    }

    #[tokio::test]
    async fn garbage_payload_is_poison() {
        let (router, _) = router();
        let message = ConsumedMessage {
            subject: "resource-updates.account.acme.cluster.c1".into(),
            timestamp: Utc::now(),
            payload: Bytes::from_static(b"not an envelope"),
        };
        let err = router.route(&message).await.expect_err("garbage");
        assert!(matches!(err, RouteError::MalformedEnvelope(_)));
        assert!(err.is_poison());
    }

    #[test]
    fn poison_policy_drops_only_poison() {
        let options = poison_policy();
        let on_error = options.on_error.expect("on_error");
        let poison = anyhow::Error::new(RouteError::MissingNamespace {
            gvk: app_gvk(),
            name: "web".into(),
        });
        assert!(on_error(&poison).is_ok());
        let transient = anyhow::Error::new(RouteError::Handler {
            gvk: app_gvk(),
            source: anyhow::anyhow!("timeout"),
        });
        assert!(on_error(&transient).is_err());
        assert!(on_error(&anyhow::anyhow!("other")).is_err());
    }
}
