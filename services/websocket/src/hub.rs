//! Per-connection fan-out state.
//!
//! # Purpose
//! A [`Connection`] bridges broker subscriptions to one websocket client. It
//! owns the client's subscription map and its outbound sink; both sit behind
//! one mutex, so subscribe/unsubscribe and every delivery write are serialized.
//!
//! # Channels
//! - `resource-update`: topic grammar ([`Topic`]) over core pub/sub.
//! - `logs`: live agent logs over core pub/sub.
//! - `jetstream-logs`: replay from the logs stream through an ephemeral,
//!   uniquely named consumer that is deleted on unsubscribe.
//!
//! # Key invariants
//! - At most one live subscription per `(channel, subject)` per connection.
//! - A failed socket write is logged and counted; it never ends the connection.
//! - [`Connection::close`] cancels every subscription and deletes every replay
//!   consumer before returning.
use crate::protocol::{Channel, ClientRequest, Event, LogSpec, ServerFrame, payload_value};
use crate::since;
use crate::topic::Topic;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_authz::{Action, Authorizer, account_resource, cluster_resource, project_resource};
use tether_broker::{Bus, Consumer, ConsumerConfig, DeliverPolicy, Subscription};
use tether_common::names::{AccountName, ClusterName};
use tether_wire::subject;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const FETCH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Write half of a client connection.
#[async_trait]
pub trait OutboundSink: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
}

/// Shared collaborators for every connection.
pub struct Hub {
    bus: Arc<dyn Bus>,
    authorizer: Arc<dyn Authorizer>,
    logs_stream: String,
}

impl Hub {
    pub fn new(bus: Arc<dyn Bus>, authorizer: Arc<dyn Authorizer>, logs_stream: impl Into<String>) -> Self {
        Self {
            bus,
            authorizer,
            logs_stream: logs_stream.into(),
        }
    }

    pub fn connect(self: &Arc<Self>, user_id: impl Into<String>, sink: Box<dyn OutboundSink>) -> Connection {
        let connection = Connection {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            hub: Arc::clone(self),
            state: Arc::new(Mutex::new(ConnectionState {
                sink,
                subscriptions: HashMap::new(),
                closed: false,
            })),
        };
        metrics::counter!("tether_hub_connections_total").increment(1);
        tracing::debug!(connection = %connection.id, user = %connection.user_id, "connection opened");
        connection
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    channel: Channel,
    subject: String,
}

struct LiveSubscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    // Replay consumer name; deleted together with the subscription.
    replay_consumer: Option<String>,
}

struct ConnectionState {
    sink: Box<dyn OutboundSink>,
    subscriptions: HashMap<SubscriptionKey, LiveSubscription>,
    closed: bool,
}

impl ConnectionState {
    async fn write(&mut self, frame: &ServerFrame) {
        if self.closed {
            return;
        }
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(error = %err, "encode server frame");
                return;
            }
        };
        if let Err(err) = self.sink.send_text(text).await {
            metrics::counter!("tether_hub_write_failures_total").increment(1);
            tracing::warn!(error = %err, "websocket write failed");
        }
    }
}

/// Authorization and subject resolved from a subscribe request.
struct Target {
    subject: String,
    resource: String,
    action: Action,
    replay: Option<Replay>,
}

struct Replay {
    policy: DeliverPolicy,
    consumer_id: String,
}

/// One websocket client's subscriptions.
#[derive(Clone)]
pub struct Connection {
    id: Uuid,
    user_id: String,
    hub: Arc<Hub>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn live_subscriptions(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    /// Handle one client text frame.
    pub async fn handle_text(&self, text: &str) {
        let request = match ClientRequest::parse(text) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(connection = %self.id, error = %err, "malformed client frame");
                self.send(&ServerFrame::error(None, "", format!("malformed request: {err}")))
                    .await;
                return;
            }
        };
        let ClientRequest { channel, data } = request;
        match data.event {
            Event::Subscribe => self.subscribe(channel, &data.spec, &data.id).await,
            Event::Unsubscribe => self.unsubscribe(channel, &data.spec, &data.id).await,
        }
    }

    pub async fn subscribe(&self, channel: Channel, spec: &Value, id: &str) {
        let target = match resolve(channel, spec, Utc::now()) {
            Ok(target) => target,
            Err(message) => {
                self.send(&ServerFrame::error(Some(channel), id, message)).await;
                return;
            }
        };

        match self
            .hub
            .authorizer
            .is_authorized(&self.user_id, &target.resource, target.action)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                metrics::counter!("tether_hub_auth_denied_total", "for" => channel.as_str())
                    .increment(1);
                tracing::info!(
                    connection = %self.id,
                    user = %self.user_id,
                    resource = %target.resource,
                    action = %target.action,
                    "subscription denied"
                );
                self.send(&ServerFrame::error(
                    Some(channel),
                    id,
                    format!("not authorized to {} {}", target.action, target.resource),
                ))
                .await;
                return;
            }
            Err(err) => {
                tracing::warn!(connection = %self.id, error = %err, "authorization check failed");
                self.send(&ServerFrame::error(
                    Some(channel),
                    id,
                    "authorization check failed",
                ))
                .await;
                return;
            }
        }

        let key = SubscriptionKey {
            channel,
            subject: target.subject.clone(),
        };
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        if state.subscriptions.contains_key(&key) {
            state
                .write(&ServerFrame::error(
                    Some(channel),
                    id,
                    format!("already subscribed to {}", target.subject),
                ))
                .await;
            return;
        }

        let cancel = CancellationToken::new();
        let started = match target.replay {
            None => self
                .hub
                .bus
                .subscribe(&target.subject)
                .await
                .map(|subscription| {
                    let task = tokio::spawn(forward_live(
                        Arc::clone(&self.state),
                        subscription,
                        channel,
                        id.to_string(),
                        cancel.clone(),
                    ));
                    (task, None)
                }),
            Some(replay) => {
                let name = replay_consumer_name(&replay.consumer_id);
                let config = ConsumerConfig::ephemeral(
                    self.hub.logs_stream.clone(),
                    name.clone(),
                    target.subject.clone(),
                    replay.policy,
                );
                self.hub.bus.consumer(config).await.map(|consumer| {
                    let task = tokio::spawn(forward_replay(
                        Arc::clone(&self.state),
                        consumer,
                        channel,
                        id.to_string(),
                        cancel.clone(),
                    ));
                    (task, Some(name))
                })
            }
        };
        let (task, replay_consumer) = match started {
            Ok(started) => started,
            Err(err) => {
                tracing::warn!(connection = %self.id, subject = %target.subject, error = %err, "broker subscribe failed");
                state
                    .write(&ServerFrame::error(
                        Some(channel),
                        id,
                        format!("subscribe to {} failed", target.subject),
                    ))
                    .await;
                return;
            }
        };

        state.subscriptions.insert(
            key,
            LiveSubscription {
                cancel,
                task,
                replay_consumer,
            },
        );
        metrics::counter!("tether_hub_subscriptions_opened_total", "for" => channel.as_str())
            .increment(1);
        metrics::gauge!("tether_hub_live_subscriptions").increment(1.0);
        tracing::info!(connection = %self.id, user = %self.user_id, subject = %target.subject, %channel, "subscribed");
        state
            .write(&ServerFrame::info(
                channel,
                id,
                format!("subscribed to {}", target.subject),
            ))
            .await;
    }

    pub async fn unsubscribe(&self, channel: Channel, spec: &Value, id: &str) {
        let target = match resolve(channel, spec, Utc::now()) {
            Ok(target) => target,
            Err(message) => {
                self.send(&ServerFrame::error(Some(channel), id, message)).await;
                return;
            }
        };
        let key = SubscriptionKey {
            channel,
            subject: target.subject,
        };
        let removed = self.state.lock().await.subscriptions.remove(&key);
        let Some(live) = removed else {
            self.send(&ServerFrame::error(
                Some(channel),
                id,
                format!("not subscribed to {}", key.subject),
            ))
            .await;
            return;
        };
        self.release(channel, live).await;
        tracing::info!(connection = %self.id, subject = %key.subject, %channel, "unsubscribed");
        self.send(&ServerFrame::response(
            channel,
            id,
            format!("unsubscribed from {}", key.subject),
        ))
        .await;
    }

    /// Tear down every subscription. Later writes are discarded.
    pub async fn close(&self) {
        let drained: Vec<(SubscriptionKey, LiveSubscription)> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.subscriptions.drain().collect()
        };
        let count = drained.len();
        for (key, live) in drained {
            self.release(key.channel, live).await;
        }
        tracing::debug!(connection = %self.id, subscriptions = count, "connection closed");
    }

    // Runs outside the state lock: the delivery task may be waiting on it.
    async fn release(&self, channel: Channel, live: LiveSubscription) {
        live.cancel.cancel();
        if let Err(err) = live.task.await {
            tracing::warn!(connection = %self.id, error = %err, "delivery task failed");
        }
        if let Some(name) = live.replay_consumer
            && let Err(err) = self
                .hub
                .bus
                .delete_consumer(&self.hub.logs_stream, &name)
                .await
        {
            tracing::warn!(connection = %self.id, consumer = %name, error = %err, "delete replay consumer");
        }
        metrics::counter!("tether_hub_subscriptions_closed_total", "for" => channel.as_str())
            .increment(1);
        metrics::gauge!("tether_hub_live_subscriptions").decrement(1.0);
    }

    async fn send(&self, frame: &ServerFrame) {
        self.state.lock().await.write(frame).await;
    }
}

fn resolve(channel: Channel, spec: &Value, now: chrono::DateTime<Utc>) -> Result<Target, String> {
    match channel {
        Channel::ResourceUpdate => {
            let raw = spec
                .as_str()
                .ok_or_else(|| "resource-update spec must be a topic string".to_string())?;
            let topic = Topic::parse(raw).map_err(|err| err.to_string())?;
            let (resource, action) = match &topic.project {
                Some(project) => (project_resource(&topic.account, project), Action::ProjectRead),
                None => (account_resource(&topic.account), Action::AccountRead),
            };
            Ok(Target {
                subject: topic.subject,
                resource,
                action,
                replay: None,
            })
        }
        Channel::Logs | Channel::JetstreamLogs => {
            let spec: LogSpec = serde_json::from_value(spec.clone())
                .map_err(|err| format!("invalid {channel} spec: {err}"))?;
            let account = AccountName::new(spec.account.as_str()).map_err(|err| err.to_string())?;
            let cluster = ClusterName::new(spec.cluster.as_str()).map_err(|err| err.to_string())?;
            if spec.tracking_id.is_empty() {
                return Err("trackingId is required".to_string());
            }
            let replay = match channel {
                Channel::JetstreamLogs => {
                    let policy = match spec.since.as_deref() {
                        Some(raw) => DeliverPolicy::ByStartTime(
                            since::start_time(raw, now).map_err(|err| err.to_string())?,
                        ),
                        None => DeliverPolicy::All,
                    };
                    Some(Replay {
                        policy,
                        consumer_id: spec.consumer_id.unwrap_or_default(),
                    })
                }
                _ => None,
            };
            Ok(Target {
                subject: subject::logs(&account, &cluster, &spec.tracking_id),
                resource: cluster_resource(&account, &cluster),
                action: Action::LogsRead,
                replay,
            })
        }
    }
}

/// Unique consumer name: hash of the client's consumer id and a random id.
fn replay_consumer_name(consumer_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(consumer_id.as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

async fn forward_live(
    state: Arc<Mutex<ConnectionState>>,
    mut subscription: Subscription,
    channel: Channel,
    id: String,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.recv() => next,
        };
        let Some(notification) = next else {
            break;
        };
        let frame = ServerFrame::update(channel, id.as_str(), payload_value(&notification.payload));
        state.lock().await.write(&frame).await;
    }
}

async fn forward_replay(
    state: Arc<Mutex<ConnectionState>>,
    mut consumer: Box<dyn Consumer>,
    channel: Channel,
    id: String,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = consumer.next() => next,
        };
        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "replay consumer fetch failed");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_RETRY_DELAY) => continue,
                }
            }
            None => break,
        };
        let frame = ServerFrame::update(channel, id.as_str(), payload_value(delivery.payload()));
        state.lock().await.write(&frame).await;
        if let Err(err) = delivery.ack().await {
            tracing::debug!(error = %err, "replay ack failed");
        }
    }
}
