//! Start/stop contract for long-running components.
//!
//! The composition root starts components in dependency order and stops them
//! in reverse. `stop` returns only after in-flight work has been drained.
use async_trait::async_trait;

#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Start `components` in order. On failure, the ones already started are
/// stopped in reverse before the error is returned.
pub async fn start_all(components: &[&dyn Lifecycle]) -> anyhow::Result<()> {
    for (index, component) in components.iter().enumerate() {
        if let Err(err) = component.start().await {
            tracing::error!(component = component.name(), error = %err, "start failed");
            for started in components[..index].iter().rev() {
                if let Err(stop_err) = started.stop().await {
                    tracing::warn!(component = started.name(), error = %stop_err, "stop after failed start");
                }
            }
            return Err(err);
        }
        tracing::info!(component = component.name(), "started");
    }
    Ok(())
}

/// Stop `components` in reverse order, attempting every one and returning the
/// first error.
pub async fn stop_all(components: &[&dyn Lifecycle]) -> anyhow::Result<()> {
    let mut first_err = None;
    for component in components.iter().rev() {
        match component.stop().await {
            Ok(()) => tracing::info!(component = component.name(), "stopped"),
            Err(err) => {
                tracing::warn!(component = component.name(), error = %err, "stop failed");
                first_err.get_or_insert(err);
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}
