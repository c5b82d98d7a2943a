// Error-on-apply path: agents report commands they could not apply.
use crate::router::routing_keys;
use crate::{Result, RouteError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tether_broker::{ConsumedMessage, MessageHandler};
use tether_common::names::{AccountName, ClusterName};
use tether_wire::{Envelope, EnvelopeKind, ErrorReport, Gvk};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyError {
    pub account: AccountName,
    pub cluster: ClusterName,
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
    pub error: String,
    pub reported_at: DateTime<Utc>,
}

#[async_trait]
pub trait ApplyErrorHandler: Send + Sync {
    async fn on_apply_error(&self, error: ApplyError) -> anyhow::Result<()>;
}

pub struct ApplyErrorRouter {
    handler: Arc<dyn ApplyErrorHandler>,
}

impl ApplyErrorRouter {
    pub fn new(handler: Arc<dyn ApplyErrorHandler>) -> Self {
        Self { handler }
    }

    /// Returns `Ok(false)` when the envelope was dropped for a missing routing key.
    pub async fn route(&self, message: &ConsumedMessage) -> Result<bool> {
        let envelope =
            Envelope::decode(message.payload.clone()).map_err(RouteError::MalformedEnvelope)?;
        if envelope.kind != EnvelopeKind::ErrorReport {
            return Err(RouteError::UnexpectedKind(envelope.kind));
        }
        let Some((account, cluster)) = routing_keys(&envelope, &message.subject)? else {
            return Ok(false);
        };
        let report =
            ErrorReport::from_json(&envelope.payload).map_err(RouteError::MalformedPayload)?;
        let gvk = report.object.gvk();
        tracing::warn!(
            %account,
            %cluster,
            %gvk,
            name = report.object.name(),
            error = %report.error,
            "agent failed to apply resource"
        );
        let apply_error = ApplyError {
            account,
            cluster,
            gvk: gvk.clone(),
            namespace: report.object.namespace().map(str::to_string),
            name: report.object.name().to_string(),
            error: report.error,
            reported_at: message.timestamp,
        };
        self.handler
            .on_apply_error(apply_error)
            .await
            .map_err(|source| RouteError::Handler { gvk, source })?;
        Ok(true)
    }
}

#[async_trait]
impl MessageHandler for ApplyErrorRouter {
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()> {
        self.route(&message).await?;
        Ok(())
    }
}

/// Build an error-report envelope; used by agents and tests.
pub fn encode_error(
    account: &str,
    cluster: &str,
    report: &ErrorReport,
) -> tether_wire::Result<Bytes> {
    let inner = Bytes::from(report.to_json()?);
    tether_wire::encode_outer(EnvelopeKind::ErrorReport, account, cluster, inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::Document;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ApplyError>>);

    #[async_trait]
    impl ApplyErrorHandler for Collect {
        async fn on_apply_error(&self, error: ApplyError) -> anyhow::Result<()> {
            self.0.lock().await.push(error);
            Ok(())
        }
    }

    fn message(account: &str, payload: Bytes) -> ConsumedMessage {
        ConsumedMessage {
            subject: format!("errors-on-apply.account.{account}.cluster.c1"),
            timestamp: Utc::now(),
            payload,
        }
    }

    fn report() -> ErrorReport {
        let doc = Document::new(&Gvk::new("apps.tether.io", "v1", "App"), "web").with_namespace("env-dev");
        ErrorReport::new(doc, "admission webhook denied")
    }

    #[tokio::test]
    async fn report_is_forwarded() {
        let collect = Arc::new(Collect::default());
        let router = ApplyErrorRouter::new(collect.clone());
        let payload = encode_error("acme", "c1", &report()).expect("encode");
        assert!(router.route(&message("acme", payload)).await.expect("route"));
        let seen = collect.0.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, "web");
        assert_eq!(seen[0].namespace.as_deref(), Some("env-dev"));
        assert_eq!(seen[0].error, "admission webhook denied");
        assert_eq!(seen[0].cluster.as_str(), "c1");
    }

    #[tokio::test]
    async fn missing_cluster_is_dropped() {
        let collect = Arc::new(Collect::default());
        let router = ApplyErrorRouter::new(collect.clone());
        let payload = encode_error("acme", "", &report()).expect("encode");
        assert!(!router.route(&message("acme", payload)).await.expect("route"));
        assert!(collect.0.lock().await.is_empty());
    }

    #[tokio::test]
    async fn update_envelope_on_error_stream_is_poison() {
        let router = ApplyErrorRouter::new(Arc::new(Collect::default()));
        let payload = tether_wire::encode_outer(EnvelopeKind::ResourceUpdate, "acme", "c1", Bytes::new())
            .expect("encode");
        let err = router.route(&message("acme", payload)).await.expect_err("kind");
        assert!(err.is_poison());
    }
}
