//! Tether websocket fan-out server entry point.
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use tether_websocket::app::{Sockets, build_authorizer, build_router, connect_bus};
use tether_websocket::config::WebSocketConfig;
use tether_websocket::hub::Hub;
use tether_websocket::observability::{self, Readiness};
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WebSocketConfig::from_env_or_yaml().context("websocket config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: WebSocketConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("tether-websocket");
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
    let authorizer = build_authorizer(&config.authz)?;
    let hub = Arc::new(Hub::new(bus, authorizer, config.logs_stream.clone()));
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind websocket listener {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "websocket listening");
    readiness.set_ready(true);

    // Upgraded sockets are not part of axum's graceful shutdown.
    let sockets = Sockets::new();
    let served = axum::serve(listener, build_router(hub, sockets.clone()))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve websocket");
    readiness.set_ready(false);
    sockets.shutdown().await;
    let _ = metrics_stop_tx.send(());
    match metrics_task.await {
        Ok(Err(err)) => tracing::warn!(error = %err, "metrics listener failed"),
        Err(err) => tracing::warn!(error = %err, "metrics task failed"),
        Ok(Ok(())) => {}
    }
    tracing::info!("websocket server stopped");
    served
}
