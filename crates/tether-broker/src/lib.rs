//! Broker abstraction shared by the control plane and the fan-out hub.
//!
//! # Purpose
//! [`Bus`] covers the two broker primitives the fabric relies on:
//! - core pub/sub ([`Bus::publish`], [`Bus::subscribe`]) for live fan-out;
//! - stored publishes ([`Bus::persist`]) acknowledged by the stream;
//! - persistent streams read through pull consumers ([`Bus::consumer`]) with
//!   explicit ack/nak, used by the [`consumer::DurableConsumer`] engine and by
//!   ephemeral log-replay readers.
//!
//! [`memory::MemoryBus`] is the in-process implementation; the `nats` feature
//! adds a JetStream adapter.
//!
//! # Key invariants
//! - A consumer name identifies one cursor per stream: re-attaching with the
//!   same name resumes where the previous reader stopped.
//! - Consumers are only removed by [`Bus::delete_consumer`]; dropping a reader
//!   never deletes broker-side state.
//! - Dropping a [`Subscription`] unregisters it from the broker.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod consumer;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod subject;

pub use consumer::{ConsumeOptions, ConsumedMessage, DurableConsumer, MessageHandler, OnError, Outcome};
pub use memory::MemoryBus;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("consumer not found: stream={stream} consumer={consumer}")]
    ConsumerNotFound { stream: String, consumer: String },
    #[error("delivery metadata unavailable: {0}")]
    MissingInfo(String),
    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("broker request failed: {0}")]
    Request(String),
    #[error("acknowledgement failed: {0}")]
    Ack(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Start from the oldest retained message.
    All,
    /// Only messages published after the consumer is created.
    New,
    /// First message stored at or after the given time.
    ByStartTime(DateTime<Utc>),
}

pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_REDELIVER_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub stream: String,
    pub name: String,
    pub durable: bool,
    pub filter_subject: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_wait: Duration,
    /// Delay before a naked message is handed out again.
    pub redeliver_after: Duration,
    /// Maximum delivery attempts; `None` retries forever.
    pub max_deliver: Option<u64>,
}

impl ConsumerConfig {
    pub fn durable(
        stream: impl Into<String>,
        name: &tether_common::DurableName,
        filter_subject: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            name: name.as_str().to_string(),
            durable: true,
            filter_subject: filter_subject.into(),
            deliver_policy: DeliverPolicy::All,
            ack_wait: DEFAULT_ACK_WAIT,
            redeliver_after: DEFAULT_REDELIVER_AFTER,
            max_deliver: None,
        }
    }

    pub fn ephemeral(
        stream: impl Into<String>,
        name: impl Into<String>,
        filter_subject: impl Into<String>,
        deliver_policy: DeliverPolicy,
    ) -> Self {
        Self {
            stream: stream.into(),
            name: name.into(),
            durable: false,
            filter_subject: filter_subject.into(),
            deliver_policy,
            ack_wait: DEFAULT_ACK_WAIT,
            redeliver_after: DEFAULT_REDELIVER_AFTER,
            max_deliver: None,
        }
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_redeliver_after(mut self, redeliver_after: Duration) -> Self {
        self.redeliver_after = redeliver_after;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: Option<u64>) -> Self {
        self.max_deliver = max_deliver;
        self
    }
}

/// Broker-side metadata for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub consumer: String,
    pub stream: String,
    pub timestamp: DateTime<Utc>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivered: u64,
}

/// One message handed out by a pull consumer, awaiting ack or nak.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;
    fn payload(&self) -> &Bytes;
    fn info(&self) -> Result<DeliveryInfo>;
    async fn ack(&self) -> Result<()>;
    async fn nak(&self) -> Result<()>;
    /// Extend the redelivery deadline while the message is being processed.
    async fn in_progress(&self) -> Result<()>;
}

/// Reader side of a pull consumer.
#[async_trait]
pub trait Consumer: Send {
    /// Next delivery, or `None` once the consumer has been deleted.
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>>>;
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;
    /// Publish to a stream-backed subject and return once a stream has stored
    /// it. Fails when no stream captures `subject`.
    async fn persist(&self, subject: &str, payload: Bytes) -> Result<()>;
    /// Core (non-persistent) subscription to a subject pattern.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;
    /// Get or create the named pull consumer on `config.stream`.
    async fn consumer(&self, config: ConsumerConfig) -> Result<Box<dyn Consumer>>;
    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub payload: Bytes,
}

/// RAII handle that unregisters a subscription on drop.
pub struct SubscriptionGuard {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(on_drop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("armed", &self.on_drop.is_some())
            .finish()
    }
}

/// Receiver wrapper that keeps the unsubscribe guard alive for the receiver lifetime.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: mpsc::Receiver<Notification>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(
        subject: impl Into<String>,
        receiver: mpsc::Receiver<Notification>,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            subject: subject.into(),
            receiver,
            guard,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Notification, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Unregister now rather than at drop time.
    pub fn unsubscribe(self) {
        drop(self.guard);
    }
}
