//! Observability wiring for the control-plane service.
//!
//! # Purpose
//! Initializes tracing (fmt layer plus an optional OTLP exporter) and the
//! Prometheus recorder, and serves `/metrics`, `/live` and `/ready` on the
//! metrics listener.
//!
//! # Notes
//! Initialization is guarded by `OnceLock` so tests can call it repeatedly.
//! The OTLP exporter is only built when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
use axum::http::StatusCode;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static OBS_INIT: OnceLock<()> = OnceLock::new();

pub fn init_observability(service_name: &str) -> PrometheusHandle {
    OBS_INIT.get_or_init(|| {
        global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );

        let provider = build_tracer_provider(service_name);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer();
        let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
        if let Some(provider) = provider {
            let tracer = provider.tracer(service_name.to_string());
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            let _ = registry.with(otel_layer).try_init();
        } else {
            let _ = registry.try_init();
        }
    });

    install_metrics_recorder()
}

fn build_tracer_provider(
    service_name: &str,
) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let resource = Resource::builder_empty()
        .with_attributes(resource_attributes(service_name))
        .build();
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .ok()?;
    Some(
        opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    if let Ok(value) =
        std::env::var("TETHER_SERVICE_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"))
    {
        attrs.push(KeyValue::new("service.instance.id", value));
    }
    for (env, key) in [
        ("K8S_CLUSTER_NAME", "k8s.cluster.name"),
        ("K8S_NAMESPACE_NAME", "k8s.namespace.name"),
        ("K8S_POD_NAME", "k8s.pod.name"),
        ("DEPLOYMENT_ENVIRONMENT", "deployment.environment"),
    ] {
        if let Ok(value) = std::env::var(env) {
            attrs.push(KeyValue::new(key, value));
        }
    }
    attrs
}

/// Readiness flag flipped by the composition root once consumers are running.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub fn metrics_router(handle: PrometheusHandle, readiness: Readiness) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { StatusCode::OK }))
        .route(
            "/ready",
            axum::routing::get(move || async move {
                if readiness.is_ready() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        )
}

pub async fn serve_metrics_with_shutdown<F>(
    handle: PrometheusHandle,
    readiness: Readiness,
    addr: SocketAddr,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listening");
    serve_metrics_with_listener(handle, readiness, listener, shutdown).await
}

async fn serve_metrics_with_listener<F>(
    handle: PrometheusHandle,
    readiness: Readiness,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = metrics_router(handle, readiness);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

fn install_metrics_recorder() -> PrometheusHandle {
    if let Some(handle) = METRICS_HANDLE.get() {
        return handle.clone();
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install metrics recorder");
    let _ = METRICS_HANDLE.set(handle.clone());
    describe_metrics();
    handle
}

fn describe_metrics() {
    metrics::describe_counter!(
        "tether_consumer_acks_total",
        "Envelopes acknowledged by a durable consumer"
    );
    metrics::describe_counter!(
        "tether_consumer_naks_total",
        "Envelopes handed back for redelivery"
    );
    metrics::describe_counter!(
        "tether_consumer_dropped_total",
        "Envelopes dropped after reaching max deliveries"
    );
    metrics::describe_counter!(
        "tether_dispatcher_published_total",
        "Agent commands published by the dispatcher"
    );
    metrics::describe_counter!(
        "tether_store_stale_total",
        "Status reports rejected as older than the stored entity"
    );
    metrics::describe_counter!(
        "tether_apply_errors_total",
        "Apply errors reported by agents"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[test]
    #[serial]
    fn resource_attributes_capture_env() {
        let _g1 = EnvGuard::set("TETHER_SERVICE_INSTANCE_ID", "cp-0");
        let _g2 = EnvGuard::set("K8S_NAMESPACE_NAME", "tether-system");
        let _g3 = EnvGuard::unset("K8S_POD_NAME");

        let found: std::collections::HashMap<String, String> = resource_attributes("console")
            .into_iter()
            .map(|attr| (attr.key.as_str().to_string(), attr.value.to_string()))
            .collect();
        assert_eq!(found.get("service.name").map(String::as_str), Some("console"));
        assert_eq!(found.get("service.instance.id").map(String::as_str), Some("cp-0"));
        assert_eq!(
            found.get("k8s.namespace.name").map(String::as_str),
            Some("tether-system")
        );
        assert!(!found.contains_key("k8s.pod.name"));
    }

    #[test]
    #[serial]
    fn tracer_provider_requires_endpoint() {
        let _g = EnvGuard::unset("OTEL_EXPORTER_OTLP_ENDPOINT");
        assert!(build_tracer_provider("console").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn health_routes_follow_readiness() {
        let handle = init_observability("controlplane-test");
        let readiness = Readiness::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_metrics_with_listener(
            handle,
            readiness.clone(),
            listener,
            async move {
                let _ = shutdown_rx.await;
            },
        ));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .no_proxy()
            .build()
            .expect("client");
        let status = |path: &'static str| {
            let client = client.clone();
            async move {
                client
                    .get(format!("http://{addr}{path}"))
                    .send()
                    .await
                    .expect("request")
                    .status()
            }
        };
        assert_eq!(status("/live").await, reqwest::StatusCode::OK);
        assert_eq!(status("/ready").await, reqwest::StatusCode::SERVICE_UNAVAILABLE);
        readiness.set_ready(true);
        assert_eq!(status("/ready").await, reqwest::StatusCode::OK);
        assert_eq!(status("/metrics").await, reqwest::StatusCode::OK);

        let _ = shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("shutdown")
            .expect("join")
            .expect("serve");
    }
}
