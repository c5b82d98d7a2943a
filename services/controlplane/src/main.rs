//! Tether control-plane entry point.
//!
//! # Purpose
//! Wires configuration, observability, the broker connection and the
//! composition root, then runs until SIGINT.
use anyhow::Context;
use std::future::Future;
use tether_common::Lifecycle;
use tether_controlplane::app::{App, connect_bus};
use tether_controlplane::config::ControlPlaneConfig;
use tether_controlplane::observability::{self, Readiness};
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControlPlaneConfig::from_env_or_yaml().context("control plane config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: ControlPlaneConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("tether-controlplane");
    let readiness = Readiness::default();
    let (metrics_stop_tx, metrics_stop_rx) = oneshot::channel::<()>();
    let metrics_task = tokio::spawn(observability::serve_metrics_with_shutdown(
        metrics_handle,
        readiness.clone(),
        config.metrics_bind,
        async move {
            let _ = metrics_stop_rx.await;
        },
    ));

    let bus = connect_bus(&config).await?;
    let app = App::build(bus, &config)?;
    app.start().await?;
    readiness.set_ready(true);
    tracing::info!(service = %config.service_name, broker = ?config.broker, "control plane running");

    shutdown.await;
    readiness.set_ready(false);
    let stopped = app.stop().await;
    let _ = metrics_stop_tx.send(());
    match metrics_task.await {
        Ok(Err(err)) => tracing::warn!(error = %err, "metrics listener failed"),
        Err(err) => tracing::warn!(error = %err, "metrics task failed"),
        Ok(Ok(())) => {}
    }
    tracing::info!("control plane stopped");
    stopped
}
