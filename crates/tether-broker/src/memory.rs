// In-process broker: core pub/sub fan-out plus retained streams read through
// pull consumers with ack/nak and redelivery after the ack wait expires.
use crate::subject::{matches, validate_pattern, validate_subject};
use crate::{
    Bus, BusError, Consumer, ConsumerConfig, DeliverPolicy, Delivery, DeliveryInfo, Notification,
    Result, Subscription, SubscriptionGuard,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;
const DEFAULT_RETENTION: usize = 10_000;

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Bytes,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct LogState {
    // Bounded log; oldest entries are dropped as new ones arrive.
    messages: VecDeque<StoredMessage>,
    // Next sequence number to assign. Sequences start at 1.
    next_seq: u64,
}

impl LogState {
    fn get(&self, seq: u64) -> Option<&StoredMessage> {
        let first = self.messages.front()?.seq;
        let idx = usize::try_from(seq.checked_sub(first)?).ok()?;
        self.messages.get(idx)
    }

    fn first_at_or_after(&self, seq: u64) -> Option<&StoredMessage> {
        let first = self.messages.front()?.seq;
        self.get(seq.max(first))
    }
}

#[derive(Debug)]
struct StreamState {
    name: String,
    subjects: Vec<String>,
    log: Mutex<LogState>,
    consumers: Mutex<HashMap<String, Arc<ConsumerState>>>,
}

impl StreamState {
    fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|pattern| matches(pattern, subject))
    }

    fn append(&self, subject: &str, payload: Bytes, retention: usize) {
        {
            let mut log = self.log.lock();
            let seq = log.next_seq;
            log.next_seq += 1;
            log.messages.push_back(StoredMessage {
                seq,
                subject: subject.to_string(),
                payload,
                timestamp: Utc::now(),
            });
            let overflow = log.messages.len().saturating_sub(retention);
            if overflow > 0 {
                log.messages.drain(..overflow);
            }
        }
        for consumer in self.consumers.lock().values() {
            consumer.notify.notify_one();
        }
    }

    fn start_seq(&self, policy: DeliverPolicy) -> u64 {
        let log = self.log.lock();
        match policy {
            DeliverPolicy::All => log.messages.front().map(|m| m.seq).unwrap_or(log.next_seq),
            DeliverPolicy::New => log.next_seq,
            DeliverPolicy::ByStartTime(start) => log
                .messages
                .iter()
                .find(|m| m.timestamp >= start)
                .map(|m| m.seq)
                .unwrap_or(log.next_seq),
        }
    }
}

#[derive(Debug, Default)]
struct Cursor {
    next_seq: u64,
    // seq -> redelivery deadline for messages handed out but not yet acked.
    pending: HashMap<u64, Instant>,
    redeliver: VecDeque<u64>,
    attempts: HashMap<u64, u64>,
}

/// Delivery counters for one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub acked: u64,
    pub naked: u64,
    pub pending: usize,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    stream: Weak<StreamState>,
    cursor: Mutex<Cursor>,
    notify: Notify,
    deleted: AtomicBool,
    delivered: AtomicU64,
    acked: AtomicU64,
    naked: AtomicU64,
}

enum Poll {
    Ready(MemoryDelivery),
    Wait(Option<Instant>),
    Closed,
}

impl ConsumerState {
    fn poll(self: &Arc<Self>) -> Poll {
        if self.deleted.load(Ordering::Acquire) {
            return Poll::Closed;
        }
        let Some(stream) = self.stream.upgrade() else {
            return Poll::Closed;
        };
        let mut cursor = self.cursor.lock();
        let now = Instant::now();
        let mut expired: Vec<u64> = cursor
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort_unstable();
        for seq in expired {
            cursor.pending.remove(&seq);
            cursor.redeliver.push_back(seq);
        }

        let log = stream.log.lock();
        while let Some(seq) = cursor.redeliver.pop_front() {
            let Some(message) = log.get(seq) else {
                // Aged out of retention.
                cursor.attempts.remove(&seq);
                continue;
            };
            let attempts = cursor.attempts.get(&seq).copied().unwrap_or(0);
            if let Some(max) = self.config.max_deliver
                && attempts >= max
            {
                tracing::warn!(
                    stream = %stream.name,
                    consumer = %self.config.name,
                    seq,
                    "max deliveries reached; message dropped"
                );
                cursor.attempts.remove(&seq);
                continue;
            }
            let message = message.clone();
            return Poll::Ready(self.hand_out(&mut cursor, &stream.name, message, now));
        }

        while let Some(message) = log.first_at_or_after(cursor.next_seq) {
            cursor.next_seq = message.seq + 1;
            if matches(&self.config.filter_subject, &message.subject) {
                let message = message.clone();
                return Poll::Ready(self.hand_out(&mut cursor, &stream.name, message, now));
            }
        }
        cursor.next_seq = cursor.next_seq.max(log.next_seq);
        Poll::Wait(cursor.pending.values().min().copied())
    }

    fn hand_out(
        self: &Arc<Self>,
        cursor: &mut Cursor,
        stream: &str,
        message: StoredMessage,
        now: Instant,
    ) -> MemoryDelivery {
        let attempts = cursor.attempts.entry(message.seq).or_insert(0);
        *attempts += 1;
        let delivered = *attempts;
        cursor.pending.insert(message.seq, now + self.config.ack_wait);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        MemoryDelivery {
            consumer: Arc::clone(self),
            seq: message.seq,
            subject: message.subject,
            payload: message.payload,
            info: DeliveryInfo {
                consumer: self.config.name.clone(),
                stream: stream.to_string(),
                timestamp: message.timestamp,
                delivered,
            },
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(BusError::ConsumerNotFound {
                stream: self.config.stream.clone(),
                consumer: self.config.name.clone(),
            });
        }
        Ok(())
    }

    fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            naked: self.naked.load(Ordering::Relaxed),
            pending: self.cursor.lock().pending.len(),
        }
    }
}

#[derive(Debug)]
struct MemoryDelivery {
    consumer: Arc<ConsumerState>,
    seq: u64,
    subject: String,
    payload: Bytes,
    info: DeliveryInfo,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn info(&self) -> Result<DeliveryInfo> {
        Ok(self.info.clone())
    }

    async fn ack(&self) -> Result<()> {
        self.consumer.ensure_live()?;
        let mut cursor = self.consumer.cursor.lock();
        cursor.pending.remove(&self.seq);
        cursor.redeliver.retain(|seq| *seq != self.seq);
        cursor.attempts.remove(&self.seq);
        self.consumer.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.consumer.ensure_live()?;
        {
            // Stays pending until the delay elapses, then `poll` requeues it.
            let mut cursor = self.consumer.cursor.lock();
            if let Some(deadline) = cursor.pending.get_mut(&self.seq) {
                *deadline = Instant::now() + self.consumer.config.redeliver_after;
            }
        }
        self.consumer.naked.fetch_add(1, Ordering::Relaxed);
        self.consumer.notify.notify_one();
        Ok(())
    }

    async fn in_progress(&self) -> Result<()> {
        self.consumer.ensure_live()?;
        let mut cursor = self.consumer.cursor.lock();
        if let Some(deadline) = cursor.pending.get_mut(&self.seq) {
            *deadline = Instant::now() + self.consumer.config.ack_wait;
        }
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<ConsumerState>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>>> {
        loop {
            // Register interest before polling so a publish in between is not missed.
            let notified = self.state.notify.notified();
            match self.state.poll() {
                Poll::Ready(delivery) => return Some(Ok(Box::new(delivery))),
                Poll::Closed => return None,
                Poll::Wait(Some(deadline)) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Poll::Wait(None) => notified.await,
            }
        }
    }
}

#[derive(Debug)]
struct SubscriberEntry {
    pattern: String,
    sender: mpsc::Sender<Notification>,
}

#[derive(Debug, Default)]
struct SubscriberRegistry {
    next_id: u64,
    entries: HashMap<u64, SubscriberEntry>,
}

/// In-process broker.
///
/// ```
/// use bytes::Bytes;
/// use tether_broker::{Bus, MemoryBus};
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let bus = MemoryBus::new();
///     let mut sub = bus.subscribe("res-updates.account.acme.>").await.expect("subscribe");
///     bus.publish("res-updates.account.acme.cluster.c1", Bytes::from_static(b"hello"))
///         .await
///         .expect("publish");
///     let msg = sub.recv().await.expect("recv");
///     assert_eq!(msg.payload, Bytes::from_static(b"hello"));
/// });
/// ```
#[derive(Debug)]
pub struct MemoryBus {
    streams: RwLock<HashMap<String, Arc<StreamState>>>,
    subscribers: Arc<Mutex<SubscriberRegistry>>,
    subscriber_capacity: usize,
    retention: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            subscribers: Arc::new(Mutex::new(SubscriberRegistry::default())),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Register a retained stream capturing `subjects`. Re-adding an existing
    /// stream is a no-op.
    pub fn add_stream(&self, name: &str, subjects: &[&str]) -> Result<()> {
        for pattern in subjects {
            validate_pattern(pattern)?;
        }
        let mut streams = self.streams.write();
        streams.entry(name.to_string()).or_insert_with(|| {
            Arc::new(StreamState {
                name: name.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                log: Mutex::new(LogState {
                    messages: VecDeque::new(),
                    next_seq: 1,
                }),
                consumers: Mutex::new(HashMap::new()),
            })
        });
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().entries.len()
    }

    pub fn consumer_names(&self, stream: &str) -> Vec<String> {
        let streams = self.streams.read();
        let mut names: Vec<String> = streams
            .get(stream)
            .map(|s| s.consumers.lock().keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn consumer_stats(&self, stream: &str, name: &str) -> Option<ConsumerStats> {
        let streams = self.streams.read();
        let consumers = streams.get(stream)?.consumers.lock();
        consumers.get(name).map(|c| c.stats())
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .read()
            .get(stream)
            .map(|s| s.log.lock().messages.len())
            .unwrap_or(0)
    }

    fn stream(&self, name: &str) -> Result<Arc<StreamState>> {
        self.streams
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::StreamNotFound(name.to_string()))
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        validate_subject(subject)?;
        let capturing: Vec<Arc<StreamState>> = self
            .streams
            .read()
            .values()
            .filter(|s| s.captures(subject))
            .cloned()
            .collect();
        for stream in capturing {
            stream.append(subject, payload.clone(), self.retention);
        }

        // Each subscriber has a bounded queue; a slow one drops locally
        // instead of stalling the publisher.
        let registry = self.subscribers.lock();
        for entry in registry.entries.values() {
            if !matches(&entry.pattern, subject) {
                continue;
            }
            let notification = Notification {
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            if let Err(mpsc::error::TrySendError::Full(_)) = entry.sender.try_send(notification) {
                metrics::counter!("tether_bus_subscriber_dropped_total").increment(1);
                tracing::debug!(pattern = %entry.pattern, subject, "subscriber queue full; dropping");
            }
        }
        Ok(())
    }

    async fn persist(&self, subject: &str, payload: Bytes) -> Result<()> {
        validate_subject(subject)?;
        let captured = self.streams.read().values().any(|s| s.captures(subject));
        if !captured {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "no stream captures subject".into(),
            });
        }
        self.publish(subject, payload).await
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        validate_pattern(pattern)?;
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = {
            let mut registry = self.subscribers.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.insert(
                id,
                SubscriberEntry {
                    pattern: pattern.to_string(),
                    sender: tx,
                },
            );
            id
        };
        let registry = Arc::downgrade(&self.subscribers);
        let guard = SubscriptionGuard::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().entries.remove(&id);
            }
        });
        Ok(Subscription::new(pattern, rx, guard))
    }

    async fn consumer(&self, config: ConsumerConfig) -> Result<Box<dyn Consumer>> {
        validate_pattern(&config.filter_subject)?;
        let stream = self.stream(&config.stream)?;
        let state = {
            let mut consumers = stream.consumers.lock();
            match consumers.get(&config.name) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let start = stream.start_seq(config.deliver_policy);
                    let state = Arc::new(ConsumerState {
                        stream: Arc::downgrade(&stream),
                        cursor: Mutex::new(Cursor {
                            next_seq: start,
                            ..Cursor::default()
                        }),
                        notify: Notify::new(),
                        deleted: AtomicBool::new(false),
                        delivered: AtomicU64::new(0),
                        acked: AtomicU64::new(0),
                        naked: AtomicU64::new(0),
                        config,
                    });
                    consumers.insert(state.config.name.clone(), Arc::clone(&state));
                    state
                }
            }
        };
        Ok(Box::new(MemoryConsumer { state }))
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<()> {
        let stream_state = self.stream(stream)?;
        let removed = stream_state.consumers.lock().remove(name);
        match removed {
            Some(state) => {
                state.deleted.store(true, Ordering::Release);
                state.notify.notify_one();
                Ok(())
            }
            None => Err(BusError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: name.to_string(),
            }),
        }
    }
}
