//! Durable consumer engine.
//!
//! # Purpose
//! Drives one named pull consumer: each delivery is handed to a
//! [`MessageHandler`] and then acked or naked according to the outcome.
//!
//! # Error policy
//! - Handler success acks.
//! - Handler failure naks, so the broker redelivers.
//! - When [`ConsumeOptions::on_error`] is set it sees the failure first; if it
//!   returns `Ok` the message is acked anyway (poison message, not worth a
//!   retry), otherwise it is naked.
//!
//! Deliveries without broker metadata are naked and skipped without reaching
//! the handler.
use crate::{Bus, ConsumerConfig, Delivery, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Broker-independent view of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub subject: String,
    /// Broker-assigned ingestion time.
    pub timestamp: DateTime<Utc>,
    pub payload: Bytes,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: ConsumedMessage) -> anyhow::Result<()> {
        (**self).handle(message).await
    }
}

/// Decides whether a handler failure is dropped (`Ok`) or retried (`Err`).
pub type OnError = Arc<dyn Fn(&anyhow::Error) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ConsumeOptions {
    pub on_error: Option<OnError>,
}

impl ConsumeOptions {
    pub fn with_on_error(
        on_error: impl Fn(&anyhow::Error) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_error: Some(Arc::new(on_error)),
        }
    }
}

impl std::fmt::Debug for ConsumeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumeOptions")
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    /// Handler failed but `on_error` demoted it to a drop.
    Dropped,
    Naked,
    /// No delivery metadata; naked without calling the handler.
    Skipped,
}

pub struct DurableConsumer {
    bus: Arc<dyn Bus>,
    config: ConsumerConfig,
    cancel: CancellationToken,
}

impl DurableConsumer {
    pub fn new(bus: Arc<dyn Bus>, config: ConsumerConfig) -> Self {
        Self {
            bus,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop pulling new deliveries. A delivery already handed to the handler
    /// still completes; `consume` returns once it has been acked or naked.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Consume until stopped or until the consumer is deleted broker-side.
    pub async fn consume<H>(&self, handler: &H, options: &ConsumeOptions) -> Result<()>
    where
        H: MessageHandler + ?Sized,
    {
        let mut consumer = self.bus.consumer(self.config.clone()).await?;
        tracing::info!(
            stream = %self.config.stream,
            consumer = %self.config.name,
            filter = %self.config.filter_subject,
            "consumer started"
        );
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = consumer.next() => next,
            };
            let delivery = match next {
                None => {
                    tracing::info!(consumer = %self.config.name, "consumer closed by broker");
                    break;
                }
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    tracing::warn!(consumer = %self.config.name, error = %err, "pull failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                    }
                }
            };
            process_delivery(&self.config.name, delivery.as_ref(), handler, options).await;
        }
        tracing::info!(consumer = %self.config.name, "consumer stopped");
        Ok(())
    }
}

/// Run one delivery through `handler` and settle it.
pub async fn process_delivery<H>(
    consumer: &str,
    delivery: &dyn Delivery,
    handler: &H,
    options: &ConsumeOptions,
) -> Outcome
where
    H: MessageHandler + ?Sized,
{
    let info = match delivery.info() {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(consumer, subject = delivery.subject(), error = %err, "no delivery metadata");
            settle_nak(consumer, delivery).await;
            return Outcome::Skipped;
        }
    };
    if let Err(err) = delivery.in_progress().await {
        tracing::debug!(consumer, error = %err, "failed to extend ack deadline");
    }

    let message = ConsumedMessage {
        subject: delivery.subject().to_string(),
        timestamp: info.timestamp,
        payload: delivery.payload().clone(),
    };
    let err = match handler.handle(message).await {
        Ok(()) => {
            settle_ack(consumer, delivery).await;
            return Outcome::Acked;
        }
        Err(err) => err,
    };

    let Some(on_error) = options.on_error.as_ref() else {
        tracing::warn!(
            consumer,
            subject = delivery.subject(),
            delivered = info.delivered,
            error = %format!("{err:#}"),
            "handler failed; requesting redelivery"
        );
        settle_nak(consumer, delivery).await;
        return Outcome::Naked;
    };
    match on_error(&err) {
        Ok(()) => {
            tracing::error!(
                consumer,
                subject = delivery.subject(),
                error = %format!("{err:#}"),
                "dropping message"
            );
            metrics::counter!("tether_consumer_dropped_total", "consumer" => consumer.to_string())
                .increment(1);
            settle_ack(consumer, delivery).await;
            Outcome::Dropped
        }
        Err(retry) => {
            tracing::warn!(
                consumer,
                subject = delivery.subject(),
                delivered = info.delivered,
                error = %format!("{retry:#}"),
                "handler failed; requesting redelivery"
            );
            settle_nak(consumer, delivery).await;
            Outcome::Naked
        }
    }
}

async fn settle_ack(consumer: &str, delivery: &dyn Delivery) {
    metrics::counter!("tether_consumer_acks_total", "consumer" => consumer.to_string()).increment(1);
    if let Err(err) = delivery.ack().await {
        tracing::warn!(consumer, error = %err, "ack failed");
    }
}

async fn settle_nak(consumer: &str, delivery: &dyn Delivery) {
    metrics::counter!("tether_consumer_naks_total", "consumer" => consumer.to_string()).increment(1);
    if let Err(err) = delivery.nak().await {
        tracing::warn!(consumer, error = %err, "nak failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BusError, DeliveryInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeDelivery {
        missing_info: bool,
        acks: AtomicUsize,
        naks: AtomicUsize,
        progress: AtomicUsize,
        payload: Bytes,
    }

    #[async_trait]
    impl Delivery for FakeDelivery {
        fn subject(&self) -> &str {
            "resource-updates.account.acme.cluster.c1"
        }

        fn payload(&self) -> &Bytes {
            &self.payload
        }

        fn info(&self) -> Result<DeliveryInfo> {
            if self.missing_info {
                return Err(BusError::MissingInfo("not a jetstream message".into()));
            }
            Ok(DeliveryInfo {
                consumer: "console:resource-updates".into(),
                stream: "resource-updates".into(),
                timestamp: Utc::now(),
                delivered: 1,
            })
        }

        async fn ack(&self) -> Result<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nak(&self) -> Result<()> {
            self.naks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn in_progress(&self) -> Result<()> {
            self.progress.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle(&self, _message: ConsumedMessage) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("store timeout")
        }
    }

    struct Succeeding;

    #[async_trait]
    impl MessageHandler for Succeeding {
        async fn handle(&self, _message: ConsumedMessage) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn success_acks_after_marking_in_progress() {
        let delivery = FakeDelivery::default();
        let outcome = process_delivery("c", &delivery, &Succeeding, &ConsumeOptions::default()).await;
        assert_eq!(outcome, Outcome::Acked);
        assert_eq!(delivery.progress.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.acks.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.naks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_without_on_error_naks() {
        let delivery = FakeDelivery::default();
        let handler = Failing(AtomicUsize::new(0));
        let outcome = process_delivery("c", &delivery, &handler, &ConsumeOptions::default()).await;
        assert_eq!(outcome, Outcome::Naked);
        assert_eq!(delivery.naks.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.acks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn on_error_ok_acks_poison_message() {
        let delivery = FakeDelivery::default();
        let handler = Failing(AtomicUsize::new(0));
        let options = ConsumeOptions::with_on_error(|_| Ok(()));
        let outcome = process_delivery("c", &delivery, &handler, &options).await;
        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(delivery.acks.load(Ordering::SeqCst), 1);
        assert_eq!(delivery.naks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn on_error_err_naks() {
        let delivery = FakeDelivery::default();
        let handler = Failing(AtomicUsize::new(0));
        let options = ConsumeOptions::with_on_error(|err| Err(anyhow::anyhow!("retry: {err}")));
        let outcome = process_delivery("c", &delivery, &handler, &options).await;
        assert_eq!(outcome, Outcome::Naked);
        assert_eq!(delivery.naks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_metadata_skips_handler() {
        let delivery = FakeDelivery {
            missing_info: true,
            ..FakeDelivery::default()
        };
        let handler = Failing(AtomicUsize::new(0));
        let outcome = process_delivery("c", &delivery, &handler, &ConsumeOptions::default()).await;
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
        assert_eq!(delivery.naks.load(Ordering::SeqCst), 1);
    }
}
