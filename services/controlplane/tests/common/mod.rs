#![allow(dead_code)]

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_broker::{Bus, MemoryBus, Subscription};
use tether_common::Lifecycle;
use tether_common::names::{AccountName, ClusterName};
use tether_controlplane::app::{App, add_memory_streams};
use tether_controlplane::config::{BrokerKind, ControlPlaneConfig};
use tether_router::encode_update;
use tether_wire::{AgentCommand, Document, ResourceStatus, ResourceUpdate};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn config() -> ControlPlaneConfig {
    ControlPlaneConfig {
        metrics_bind: "127.0.0.1:0".parse().expect("metrics"),
        broker: BrokerKind::Memory,
        nats_url: "nats://127.0.0.1:4222".into(),
        service_name: "console".into(),
        updates_stream: "resource-updates".into(),
        errors_stream: "errors-on-apply".into(),
        ack_wait: Duration::from_secs(30),
        redeliver_after: Duration::from_millis(50),
        max_deliver: None,
    }
}

pub struct Harness {
    pub bus: Arc<MemoryBus>,
    pub app: App,
}

impl Harness {
    pub async fn start(config: ControlPlaneConfig) -> Self {
        let bus = Arc::new(MemoryBus::new());
        add_memory_streams(&bus, &config).expect("streams");
        let app = App::build(bus.clone(), &config).expect("app");
        app.start().await.expect("start");
        Self { bus, app }
    }

    pub async fn stop(self) {
        tokio::time::timeout(WAIT, self.app.stop())
            .await
            .expect("stop in time")
            .expect("stop");
    }

    pub async fn publish_update(&self, account: &str, cluster: &str, update: &ResourceUpdate) {
        let payload = encode_update(account, cluster, update).expect("encode");
        self.publish_raw(&format!("resource-updates.account.{}.cluster.{}", token(account), token(cluster)), payload)
            .await;
    }

    pub async fn publish_raw(&self, subject: &str, payload: Bytes) {
        self.bus.publish(subject, payload).await.expect("publish");
    }

    pub async fn wait_for_acks(&self, stream: &str, consumer: &str, acked: u64) {
        let bus = self.bus.clone();
        let (stream, consumer) = (stream.to_string(), consumer.to_string());
        wait_until(move || {
            let bus = bus.clone();
            let (stream, consumer) = (stream.clone(), consumer.clone());
            async move {
                bus.consumer_stats(&stream, &consumer)
                    .is_some_and(|stats| stats.acked >= acked)
            }
        })
        .await;
    }
}

fn token(value: &str) -> &str {
    if value.is_empty() { "unknown" } else { value }
}

pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub fn names() -> (AccountName, ClusterName) {
    (
        AccountName::new("acme").expect("account"),
        ClusterName::new("c1").expect("cluster"),
    )
}

/// Tenant agent stand-in: receives commands and reports observed state.
pub struct FakeAgent {
    commands: Subscription,
}

impl FakeAgent {
    pub async fn attach(bus: &MemoryBus, account: &str, cluster: &str) -> Self {
        let commands = bus
            .subscribe(&format!("agent-commands.account.{account}.cluster.{cluster}"))
            .await
            .expect("subscribe");
        Self { commands }
    }

    pub async fn next_command(&mut self) -> AgentCommand {
        let notification = tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("command in time")
            .expect("subscription open");
        AgentCommand::from_json(&notification.payload).expect("command json")
    }
}

pub fn observed(object: Document, status: &str) -> ResourceUpdate {
    ResourceUpdate::new(object, ResourceStatus::from(status.to_string()))
}
