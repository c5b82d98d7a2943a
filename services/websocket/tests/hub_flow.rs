use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_authz::{PermissionMatcher, PolicyAuthorizer};
use tether_broker::{
    Bus, BusError, Consumer, ConsumerConfig, Delivery, MemoryBus, Subscription,
};
use tether_websocket::hub::{Connection, Hub, OutboundSink};

const WAIT: Duration = Duration::from_secs(2);
const LOGS_STREAM: &str = "logs";

#[derive(Clone, Default)]
struct Frames(Arc<Mutex<Vec<Value>>>);

impl Frames {
    fn snapshot(&self) -> Vec<Value> {
        self.0.lock().expect("frames").clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<Value> {
        tokio::time::timeout(WAIT, async {
            loop {
                let frames = self.snapshot();
                if frames.len() >= count {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("frames in time")
    }
}

struct RecordingSink {
    frames: Frames,
    fail_next: usize,
}

#[async_trait]
impl OutboundSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            anyhow::bail!("socket closed by peer");
        }
        let value = serde_json::from_str(&text)?;
        self.frames.0.lock().expect("frames").push(value);
        Ok(())
    }
}

struct Fixture {
    bus: Arc<MemoryBus>,
    hub: Arc<Hub>,
}

fn authorizer() -> PolicyAuthorizer {
    let matcher = PermissionMatcher::from_strings(&[
        "account.read:account:acme".to_string(),
        "project.read:project:acme/p1".to_string(),
        "logs.read:cluster:acme/*".to_string(),
    ])
    .expect("matcher");
    PolicyAuthorizer::new().grant("alice", matcher)
}

impl Fixture {
    fn new() -> Self {
        let bus = Arc::new(MemoryBus::new());
        bus.add_stream(LOGS_STREAM, &["logs.>"]).expect("logs stream");
        let hub = Arc::new(Hub::new(bus.clone(), Arc::new(authorizer()), LOGS_STREAM));
        Self { bus, hub }
    }

    /// Same as `new`, but every replay fetch fails.
    fn with_failing_replay() -> Self {
        let bus = Arc::new(MemoryBus::new());
        bus.add_stream(LOGS_STREAM, &["logs.>"]).expect("logs stream");
        let failing = Arc::new(FailingReplayBus(bus.clone()));
        let hub = Arc::new(Hub::new(failing, Arc::new(authorizer()), LOGS_STREAM));
        Self { bus, hub }
    }

    fn connect(&self, user: &str) -> (Connection, Frames) {
        self.connect_with_failures(user, 0)
    }

    fn connect_with_failures(&self, user: &str, fail_next: usize) -> (Connection, Frames) {
        let frames = Frames::default();
        let sink = RecordingSink {
            frames: frames.clone(),
            fail_next,
        };
        (self.hub.connect(user, Box::new(sink)), frames)
    }
}

struct FailingReplayBus(Arc<MemoryBus>);

struct FailingConsumer;

#[async_trait]
impl Consumer for FailingConsumer {
    async fn next(&mut self) -> Option<tether_broker::Result<Box<dyn Delivery>>> {
        Some(Err(BusError::Request("fetch timed out".into())))
    }
}

#[async_trait]
impl Bus for FailingReplayBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> tether_broker::Result<()> {
        self.0.publish(subject, payload).await
    }

    async fn persist(&self, subject: &str, payload: Bytes) -> tether_broker::Result<()> {
        self.0.persist(subject, payload).await
    }

    async fn subscribe(&self, pattern: &str) -> tether_broker::Result<Subscription> {
        self.0.subscribe(pattern).await
    }

    async fn consumer(&self, config: ConsumerConfig) -> tether_broker::Result<Box<dyn Consumer>> {
        // Registered on the real stream so deletion is observable.
        self.0.consumer(config).await?;
        Ok(Box::new(FailingConsumer))
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> tether_broker::Result<()> {
        self.0.delete_consumer(stream, name).await
    }
}

fn request(channel: &str, event: &str, spec: Value, id: &str) -> String {
    json!({"for": channel, "data": {"event": event, "spec": spec, "id": id}}).to_string()
}

fn log_spec(since: Option<&str>) -> Value {
    let mut spec = json!({"account": "acme", "cluster": "c1", "trackingId": "t1", "consumerId": "ui"});
    if let Some(since) = since {
        spec["since"] = json!(since);
    }
    spec
}

#[tokio::test]
async fn resource_updates_reach_the_client() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect("alice");
    connection
        .handle_text(&request("resource-update", "subscribe", json!("account:acme.cluster"), "1"))
        .await;
    let first = frames.wait_for(1).await;
    assert_eq!(first[0]["type"], "info");
    assert_eq!(first[0]["id"], "1");

    fixture
        .bus
        .publish(
            "res-updates.account.acme.cluster.c1",
            Bytes::from_static(br#"{"kind":"Cluster","name":"c1","action":"updated"}"#),
        )
        .await
        .expect("publish");
    let frames = frames.wait_for(2).await;
    assert_eq!(frames[1]["type"], "update");
    assert_eq!(frames[1]["for"], "resource-update");
    assert_eq!(frames[1]["id"], "1");
    assert_eq!(frames[1]["data"]["name"], "c1");
    connection.close().await;
}

#[tokio::test]
async fn denied_subscription_creates_nothing() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect("mallory");
    connection
        .handle_text(&request("resource-update", "subscribe", json!("account:acme"), "9"))
        .await;
    let frames = frames.wait_for(1).await;
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[0]["id"], "9");
    assert_eq!(connection.live_subscriptions().await, 0);
    assert_eq!(fixture.bus.subscriber_count(), 0);
}

#[tokio::test]
async fn project_topic_checks_project_permission() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect("alice");
    connection
        .handle_text(&request("resource-update", "subscribe", json!("account:acme.project:p2"), "1"))
        .await;
    connection
        .handle_text(&request("resource-update", "subscribe", json!("account:acme.project:p1"), "2"))
        .await;
    let frames = frames.wait_for(2).await;
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[1]["type"], "info");
    assert_eq!(connection.live_subscriptions().await, 1);
    connection.close().await;
}

#[tokio::test]
async fn duplicate_subscription_is_rejected() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect("alice");
    let subscribe = request("resource-update", "subscribe", json!("account:acme.cluster:c1"), "1");
    connection.handle_text(&subscribe).await;
    connection.handle_text(&subscribe).await;
    let frames = frames.wait_for(2).await;
    assert_eq!(frames[0]["type"], "info");
    assert_eq!(frames[1]["type"], "error");
    assert_eq!(connection.live_subscriptions().await, 1);
    assert_eq!(fixture.bus.subscriber_count(), 1);
    connection.close().await;
}

#[tokio::test]
async fn unsubscribe_cancels_broker_subscription() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect("alice");
    connection
        .handle_text(&request("resource-update", "subscribe", json!("account:acme"), "1"))
        .await;
    connection
        .handle_text(&request("resource-update", "unsubscribe", json!("account:acme"), "2"))
        .await;
    connection
        .handle_text(&request("resource-update", "unsubscribe", json!("account:acme"), "3"))
        .await;
    let frames = frames.wait_for(3).await;
    assert_eq!(frames[1]["type"], "response");
    assert_eq!(frames[1]["id"], "2");
    assert_eq!(frames[2]["type"], "error");
    assert_eq!(connection.live_subscriptions().await, 0);
    assert_eq!(fixture.bus.subscriber_count(), 0);
}

#[tokio::test]
async fn live_logs_follow_the_tracking_subject() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect("alice");
    connection
        .handle_text(&request("logs", "subscribe", log_spec(None), "l1"))
        .await;
    frames.wait_for(1).await;
    fixture
        .bus
        .publish(
            "logs.account.acme.cluster.c1.tracking.t1",
            Bytes::from_static(b"pulling image"),
        )
        .await
        .expect("publish");
    let frames = frames.wait_for(2).await;
    assert_eq!(frames[1]["for"], "logs");
    assert_eq!(frames[1]["data"], "pulling image");
    connection.close().await;
}

#[tokio::test]
async fn log_replay_reads_history_and_deletes_its_consumer() {
    let fixture = Fixture::new();
    for line in ["step 1", "step 2"] {
        fixture
            .bus
            .publish(
                "logs.account.acme.cluster.c1.tracking.t1",
                Bytes::from(line.to_string()),
            )
            .await
            .expect("publish");
    }
    let (connection, frames) = fixture.connect("alice");
    connection
        .handle_text(&request("jetstream-logs", "subscribe", log_spec(Some("1h")), "r1"))
        .await;
    let received = frames.wait_for(3).await;
    assert_eq!(received[0]["type"], "info");
    assert_eq!(received[1]["data"], "step 1");
    assert_eq!(received[2]["data"], "step 2");
    assert_eq!(fixture.bus.consumer_names(LOGS_STREAM).len(), 1);

    connection
        .handle_text(&request("jetstream-logs", "unsubscribe", log_spec(Some("1h")), "r2"))
        .await;
    let received = frames.wait_for(4).await;
    assert_eq!(received[3]["type"], "response");
    assert!(fixture.bus.consumer_names(LOGS_STREAM).is_empty());
}

#[tokio::test]
async fn unsubscribe_does_not_wait_out_fetch_retries() {
    let fixture = Fixture::with_failing_replay();
    let (connection, frames) = fixture.connect("alice");
    connection
        .handle_text(&request("jetstream-logs", "subscribe", log_spec(None), "r1"))
        .await;
    frames.wait_for(1).await;
    // Let the delivery task reach its retry backoff.
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(
        Duration::from_millis(100),
        connection.handle_text(&request("jetstream-logs", "unsubscribe", log_spec(None), "r2")),
    )
    .await
    .expect("unsubscribe without waiting for the retry delay");
    assert_eq!(connection.live_subscriptions().await, 0);
    assert!(fixture.bus.consumer_names(LOGS_STREAM).is_empty());
}

#[tokio::test]
async fn close_tears_down_everything() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect("alice");
    connection
        .handle_text(&request("resource-update", "subscribe", json!("account:acme"), "1"))
        .await;
    connection
        .handle_text(&request("logs", "subscribe", log_spec(None), "2"))
        .await;
    connection
        .handle_text(&request("jetstream-logs", "subscribe", log_spec(Some("15m")), "3"))
        .await;
    frames.wait_for(3).await;
    assert_eq!(connection.live_subscriptions().await, 3);
    assert_eq!(fixture.bus.subscriber_count(), 2);
    assert_eq!(fixture.bus.consumer_names(LOGS_STREAM).len(), 1);

    tokio::time::timeout(WAIT, connection.close())
        .await
        .expect("close in time");
    assert_eq!(connection.live_subscriptions().await, 0);
    assert_eq!(fixture.bus.subscriber_count(), 0);
    assert!(fixture.bus.consumer_names(LOGS_STREAM).is_empty());

    // Nothing is written after close.
    fixture
        .bus
        .publish("res-updates.account.acme", Bytes::from_static(b"{}"))
        .await
        .expect("publish");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(frames.snapshot().len(), 3);
}

#[tokio::test]
async fn write_failure_keeps_connection_usable() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect_with_failures("alice", 1);
    // The info frame for this subscribe is lost.
    connection
        .handle_text(&request("resource-update", "subscribe", json!("account:acme"), "1"))
        .await;
    assert_eq!(connection.live_subscriptions().await, 1);
    fixture
        .bus
        .publish("res-updates.account.acme", Bytes::from_static(br#"{"n":1}"#))
        .await
        .expect("publish");
    let received = frames.wait_for(1).await;
    assert_eq!(received[0]["type"], "update");
    assert_eq!(received[0]["data"]["n"], 1);
    connection.close().await;
}

#[tokio::test]
async fn malformed_frames_get_an_error_reply() {
    let fixture = Fixture::new();
    let (connection, frames) = fixture.connect("alice");
    connection.handle_text("not json").await;
    connection
        .handle_text(&request("resource-update", "subscribe", json!("project:p1"), "5"))
        .await;
    let frames = frames.wait_for(2).await;
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[0]["id"], "");
    assert_eq!(frames[1]["type"], "error");
    assert_eq!(frames[1]["for"], "resource-update");
    assert!(
        frames[1]["message"]
            .as_str()
            .is_some_and(|message| message.contains("account"))
    );
}
