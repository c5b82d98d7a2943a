// NATS JetStream adapter for the `Bus` trait.
use crate::{
    Bus, BusError, Consumer, ConsumerConfig, DeliverPolicy, Delivery, DeliveryInfo, Notification,
    Result, Subscription, SubscriptionGuard,
};
use async_nats::jetstream::stream::ConsumerErrorKind;
use async_nats::jetstream::{self, AckKind, ErrorCode, consumer::pull};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SUBSCRIBER_CAPACITY: usize = 1024;
// Ephemeral consumers left behind by a crashed reader are reaped by the server.
const EPHEMERAL_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    js: jetstream::Context,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect(url)
            .await
            .map_err(|err| BusError::Request(format!("connect {url}: {err}")))?;
        tracing::info!(url, "connected to nats");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        let js = jetstream::new(client.clone());
        Self { client, js }
    }

    async fn stream(&self, name: &str) -> Result<jetstream::stream::Stream> {
        self.js
            .get_stream(name)
            .await
            .map_err(|err| BusError::StreamNotFound(format!("{name}: {err}")))
    }
}

fn to_chrono(ts: time::OffsetDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts.unix_timestamp(), ts.nanosecond()).unwrap_or_default()
}

fn to_offset(ts: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    let nanos = ts
        .timestamp_nanos_opt()
        .ok_or_else(|| BusError::Request(format!("start time out of range: {ts}")))?;
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|err| BusError::Request(format!("start time out of range: {err}")))
}

fn deliver_policy(policy: DeliverPolicy) -> Result<jetstream::consumer::DeliverPolicy> {
    Ok(match policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartTime(start) => jetstream::consumer::DeliverPolicy::ByStartTime {
            start_time: to_offset(start)?,
        },
    })
}

struct NatsDelivery {
    message: jetstream::Message,
    redeliver_after: Duration,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    fn info(&self) -> Result<DeliveryInfo> {
        let info = self
            .message
            .info()
            .map_err(|err| BusError::MissingInfo(err.to_string()))?;
        Ok(DeliveryInfo {
            consumer: info.consumer.to_string(),
            stream: info.stream.to_string(),
            timestamp: to_chrono(info.published),
            delivered: u64::try_from(info.delivered).unwrap_or(0),
        })
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|err| BusError::Ack(err.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(Some(self.redeliver_after)))
            .await
            .map_err(|err| BusError::Ack(err.to_string()))
    }

    async fn in_progress(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|err| BusError::Ack(err.to_string()))
    }
}

struct NatsConsumer {
    messages: pull::Stream,
    redeliver_after: Duration,
}

#[async_trait]
impl Consumer for NatsConsumer {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>>> {
        match self.messages.next().await? {
            Ok(message) => Some(Ok(Box::new(NatsDelivery {
                message,
                redeliver_after: self.redeliver_after,
            }))),
            Err(err) => Some(Err(BusError::Request(err.to_string()))),
        }
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|err| publish_error(subject, err))
    }

    async fn persist(&self, subject: &str, payload: Bytes) -> Result<()> {
        let ack = self
            .js
            .publish(subject.to_string(), payload)
            .await
            .map_err(|err| publish_error(subject, err))?;
        ack.await.map_err(|err| publish_error(subject, err))?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let mut subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|err| BusError::Request(format!("subscribe {pattern}: {err}")))?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_pattern = pattern.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        if let Err(err) = subscriber.unsubscribe().await {
                            tracing::debug!(pattern = %task_pattern, error = %err, "unsubscribe failed");
                        }
                        break;
                    }
                    message = subscriber.next() => {
                        let Some(message) = message else { break };
                        let notification = Notification {
                            subject: message.subject.to_string(),
                            payload: message.payload,
                        };
                        match tx.try_send(notification) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                metrics::counter!("tether_bus_subscriber_dropped_total").increment(1);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
        });
        let guard = SubscriptionGuard::new(move || cancel.cancel());
        Ok(Subscription::new(pattern, rx, guard))
    }

    async fn consumer(&self, config: ConsumerConfig) -> Result<Box<dyn Consumer>> {
        let stream = self.stream(&config.stream).await?;
        let max_deliver = config
            .max_deliver
            .map(|max| i64::try_from(max).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let pull_config = pull::Config {
            durable_name: config.durable.then(|| config.name.clone()),
            name: Some(config.name.clone()),
            filter_subject: config.filter_subject.clone(),
            deliver_policy: deliver_policy(config.deliver_policy)?,
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            max_deliver,
            inactive_threshold: if config.durable {
                Duration::ZERO
            } else {
                EPHEMERAL_INACTIVE_THRESHOLD
            },
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(&config.name, pull_config)
            .await
            .map_err(|err| BusError::Request(format!("consumer {}: {err}", config.name)))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|err| BusError::Request(format!("consumer {} messages: {err}", config.name)))?;
        Ok(Box::new(NatsConsumer {
            messages,
            redeliver_after: config.redeliver_after,
        }))
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<()> {
        self.stream(stream)
            .await?
            .delete_consumer(name)
            .await
            .map(|_| ())
            .map_err(|err| delete_error(stream, name, err.kind()))
    }
}

fn publish_error(subject: &str, err: impl std::fmt::Display) -> BusError {
    BusError::Publish {
        subject: subject.to_string(),
        reason: err.to_string(),
    }
}

fn delete_error(stream: &str, name: &str, kind: ConsumerErrorKind) -> BusError {
    match kind {
        ConsumerErrorKind::JetStream(err) if err.error_code() == ErrorCode::CONSUMER_NOT_FOUND => {
            BusError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: name.to_string(),
            }
        }
        other => BusError::Request(format!("delete consumer {stream}/{name}: {other}")),
    }
}
