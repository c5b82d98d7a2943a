//! Composition root for the control plane.
//!
//! Components are built in dependency order: broker connection, stores,
//! dispatcher, GVK registry and router, then the two durable consumers
//! (observed-state updates and apply errors). [`App`] starts and stops them
//! through [`Lifecycle`]; stopping drains the delivery each consumer is
//! currently handling.
use crate::config::{BrokerKind, ControlPlaneConfig};
use crate::dispatcher::Dispatcher;
use crate::model::{App as AppEntity, Cluster, Entity, ManagedService, NodePool};
use crate::store::{ApplyErrorLog, MappingStore, ResourceStore};
use anyhow::{Context, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tether_broker::nats::NatsBus;
use tether_broker::{
    Bus, ConsumeOptions, ConsumerConfig, DurableConsumer, MemoryBus, MessageHandler,
};
use tether_common::lifecycle::{self, Lifecycle};
use tether_common::DurableName;
use tether_router::{ApplyErrorRouter, Registry, Router, poison_policy};
use tether_wire::subject;
use tokio::task::JoinHandle;

pub const UPDATES_FEATURE: &str = "resource-updates";
pub const APPLY_ERRORS_FEATURE: &str = "error-on-apply";

/// Connect to the configured broker. The in-process broker gets the streams
/// the consumers read from; NATS streams are provisioned outside the service.
pub async fn connect_bus(config: &ControlPlaneConfig) -> anyhow::Result<Arc<dyn Bus>> {
    match config.broker {
        BrokerKind::Memory => {
            let bus = MemoryBus::new();
            add_memory_streams(&bus, config)?;
            tracing::info!("using in-process broker");
            Ok(Arc::new(bus))
        }
        BrokerKind::Nats => {
            let bus = NatsBus::connect(&config.nats_url)
                .await
                .with_context(|| format!("connect to nats at {}", config.nats_url))?;
            Ok(Arc::new(bus))
        }
    }
}

pub fn add_memory_streams(bus: &MemoryBus, config: &ControlPlaneConfig) -> anyhow::Result<()> {
    bus.add_stream(
        &config.updates_stream,
        &[subject::all_under(subject::RESOURCE_UPDATES).as_str()],
    )
    .context("add updates stream")?;
    bus.add_stream(
        &config.errors_stream,
        &[subject::all_under(subject::ERRORS_ON_APPLY).as_str()],
    )
    .context("add apply errors stream")?;
    bus.add_stream(
        subject::AGENT_COMMANDS,
        &[subject::all_under(subject::AGENT_COMMANDS).as_str()],
    )
    .context("add agent commands stream")?;
    Ok(())
}

/// Reference stores fed by the router.
#[derive(Clone)]
pub struct Stores {
    pub clusters: Arc<ResourceStore<Cluster>>,
    pub node_pools: Arc<ResourceStore<NodePool>>,
    pub apps: Arc<ResourceStore<AppEntity>>,
    pub managed_services: Arc<ResourceStore<ManagedService>>,
    pub mappings: Arc<MappingStore>,
    pub apply_errors: Arc<ApplyErrorLog>,
}

impl Stores {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            clusters: Arc::new(ResourceStore::new().with_notifier(bus.clone())),
            node_pools: Arc::new(ResourceStore::new().with_notifier(bus.clone())),
            apps: Arc::new(ResourceStore::new().with_notifier(bus.clone())),
            managed_services: Arc::new(ResourceStore::new().with_notifier(bus)),
            mappings: Arc::new(MappingStore::new()),
            apply_errors: Arc::new(ApplyErrorLog::new()),
        }
    }

    /// GVK dispatch table for every entity the control plane tracks.
    pub fn registry(&self) -> Registry {
        let mut registry = Registry::new();
        register(&mut registry, self.clusters.clone());
        register(&mut registry, self.node_pools.clone());
        register(&mut registry, self.apps.clone());
        register(&mut registry, self.managed_services.clone());
        registry
    }
}

fn register<T: Entity>(registry: &mut Registry, store: Arc<ResourceStore<T>>) {
    registry.register::<T, _>(T::gvk(), T::SCOPE, store);
}

/// One durable consumer driven on its own task.
pub struct ConsumerTask {
    engine: Arc<DurableConsumer>,
    handler: Arc<dyn MessageHandler>,
    options: ConsumeOptions,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerTask {
    pub fn new(
        engine: DurableConsumer,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            handler,
            options,
            task: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &DurableConsumer {
        &self.engine
    }
}

#[async_trait]
impl Lifecycle for ConsumerTask {
    fn name(&self) -> &str {
        self.engine.name()
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.task.lock();
        if slot.is_some() {
            bail!("consumer {} already started", self.engine.name());
        }
        let engine = Arc::clone(&self.engine);
        let handler = Arc::clone(&self.handler);
        let options = self.options.clone();
        *slot = Some(tokio::spawn(async move {
            if let Err(err) = engine.consume(handler.as_ref(), &options).await {
                tracing::error!(consumer = engine.name(), error = %err, "consumer exited");
            }
        }));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.engine.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .with_context(|| format!("consumer {} task failed", self.engine.name()))?;
        }
        Ok(())
    }
}

pub struct App {
    bus: Arc<dyn Bus>,
    stores: Stores,
    dispatcher: Arc<Dispatcher>,
    updates: ConsumerTask,
    apply_errors: ConsumerTask,
}

impl App {
    pub fn build(bus: Arc<dyn Bus>, config: &ControlPlaneConfig) -> anyhow::Result<Self> {
        let stores = Stores::new(bus.clone());
        let dispatcher = Arc::new(
            Dispatcher::new(bus.clone()).with_mappings(stores.mappings.clone()),
        );

        let router = Router::new(stores.registry(), stores.mappings.clone());
        tracing::info!(gvks = ?router.registry().gvks(), "router ready");
        let updates_name = DurableName::new(&config.service_name, UPDATES_FEATURE)
            .context("updates consumer name")?;
        let updates = ConsumerTask::new(
            DurableConsumer::new(
                bus.clone(),
                consumer_config(config, &config.updates_stream, &updates_name, subject::RESOURCE_UPDATES),
            ),
            Arc::new(router),
            poison_policy(),
        );

        let errors_name = DurableName::new(&config.service_name, APPLY_ERRORS_FEATURE)
            .context("apply errors consumer name")?;
        let apply_errors = ConsumerTask::new(
            DurableConsumer::new(
                bus.clone(),
                consumer_config(config, &config.errors_stream, &errors_name, subject::ERRORS_ON_APPLY),
            ),
            Arc::new(ApplyErrorRouter::new(stores.apply_errors.clone())),
            poison_policy(),
        );

        Ok(Self {
            bus,
            stores,
            dispatcher,
            updates,
            apply_errors,
        })
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn consumer_names(&self) -> [&str; 2] {
        [self.updates.name(), self.apply_errors.name()]
    }
}

fn consumer_config(
    config: &ControlPlaneConfig,
    stream: &str,
    name: &DurableName,
    root: &str,
) -> ConsumerConfig {
    ConsumerConfig::durable(stream, name, subject::all_under(root))
        .with_ack_wait(config.ack_wait)
        .with_redeliver_after(config.redeliver_after)
        .with_max_deliver(config.max_deliver)
}

#[async_trait]
impl Lifecycle for App {
    fn name(&self) -> &str {
        "controlplane"
    }

    async fn start(&self) -> anyhow::Result<()> {
        lifecycle::start_all(&[&self.updates, &self.apply_errors]).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        lifecycle::stop_all(&[&self.updates, &self.apply_errors]).await
    }
}
