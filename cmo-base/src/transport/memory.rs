use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use cmo_core::traits::{
    ComponentHealth, Delivery, SubscribeOptions, Subscription, Transport, TransportStats,
};
use cmo_core::{well_known, Envelope, Topic, TransportError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct StoredEntry {
    receipt: String,
    envelope: Envelope,
    attempt: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    queue: VecDeque<StoredEntry>,
    pel: HashMap<String, StoredEntry>,
}

#[derive(Debug, Default)]
struct TopicState {
    /// Raw append log, read by request/response waits.
    entries: Vec<StoredEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    rejected: AtomicU64,
}

/// An in-process transport with Redis-Streams-like semantics: consumer
/// groups, a per-group pending list, nack redelivery and DLQ rejection.
///
/// Used by tests and single-process runs; the contract matches
/// [`RedisStreamTransport`](super::RedisStreamTransport).
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    connected: AtomicBool,
    topics: Mutex<HashMap<String, TopicState>>,
    dlq_reasons: Mutex<HashMap<String, Vec<String>>>,
    subscriber_tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
    next_receipt: AtomicU64,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// A fresh, disconnected transport.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connected: AtomicBool::new(false),
                topics: Mutex::new(HashMap::new()),
                dlq_reasons: Mutex::new(HashMap::new()),
                subscriber_tasks: Mutex::new(Vec::new()),
                counters: Counters::default(),
                next_receipt: AtomicU64::new(1),
            }),
        }
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn next_receipt(&self) -> String {
        format!("{}-0", self.inner.next_receipt.fetch_add(1, Ordering::SeqCst))
    }

    async fn append(&self, topic: &str, envelope: Envelope, attempt: u32) -> String {
        let receipt = self.next_receipt();
        let entry = StoredEntry {
            receipt: receipt.clone(),
            envelope,
            attempt,
        };
        let mut topics = self.inner.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        state.entries.push(entry.clone());
        for group in state.groups.values_mut() {
            group.queue.push_back(entry.clone());
        }
        receipt
    }

    /// Reasons attached to entries rejected onto `topic`'s DLQ. Test hook.
    pub async fn dlq_reasons(&self, topic: &Topic) -> Vec<String> {
        self.inner
            .dlq_reasons
            .lock()
            .await
            .get(topic.dlq().name())
            .cloned()
            .unwrap_or_default()
    }

    /// Number of entries ever appended to a topic. Test hook.
    pub async fn appended(&self, topic: &Topic) -> usize {
        self.inner
            .topics
            .lock()
            .await
            .get(topic.name())
            .map(|t| t.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        for task in self.inner.subscriber_tasks.lock().await.drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<String, TransportError> {
        self.ensure_connected()?;
        let receipt = self.append(topic.name(), envelope.clone(), 1).await;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(receipt)
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError> {
        self.ensure_connected()?;
        let (tx, rx) = mpsc::channel(options.max_pending.max(1));

        {
            let mut topics = self.inner.topics.lock().await;
            let state = topics.entry(topic.name().to_string()).or_default();
            // New groups read from the beginning of the stream, so a
            // publish racing this subscribe is never lost.
            if !state.groups.contains_key(&options.group) {
                let backlog: VecDeque<StoredEntry> = state.entries.iter().cloned().collect();
                state.groups.insert(
                    options.group.clone(),
                    GroupState {
                        queue: backlog,
                        pel: HashMap::new(),
                    },
                );
            }
        }

        let inner = self.inner.clone();
        let topic = topic.clone();
        let group = options.group.clone();
        let task = tokio::spawn(async move {
            loop {
                let next = {
                    let mut topics = inner.topics.lock().await;
                    let state = topics.entry(topic.name().to_string()).or_default();
                    let group_state = state.groups.entry(group.clone()).or_default();
                    if let Some(entry) = group_state.queue.pop_front() {
                        group_state.pel.insert(entry.receipt.clone(), entry.clone());
                        Some(entry)
                    } else {
                        None
                    }
                };
                match next {
                    Some(entry) => {
                        inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                        let delivery = Delivery {
                            topic: topic.clone(),
                            envelope: entry.envelope,
                            receipt: entry.receipt,
                            group: group.clone(),
                            attempt: entry.attempt,
                        };
                        // A full channel pauses this loop: flow control.
                        if tx.send(delivery).await.is_err() {
                            debug!(topic = %topic, "subscription receiver dropped, stopping");
                            break;
                        }
                    }
                    None => tokio::time::sleep(POLL_INTERVAL).await,
                }
            }
        });
        self.inner.subscriber_tasks.lock().await.push(task);

        Ok(Subscription { deliveries: rx })
    }

    async fn request(
        &self,
        topic: &Topic,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError> {
        self.ensure_connected()?;
        let mut request = envelope.clone();
        let correlation = request.meta.message_id.clone();
        request.meta.correlation_id = Some(correlation.clone());
        let reply_topic = well_known::replies(
            &request.meta.tenant,
            &request.meta.project,
            &correlation,
        );
        self.publish(topic, &request).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut topics = self.inner.topics.lock().await;
                if let Some(state) = topics.get_mut(reply_topic.name()) {
                    if let Some(pos) = state.entries.iter().position(|e| {
                        e.envelope.meta.correlation_id.as_deref() == Some(&correlation)
                    }) {
                        let entry = state.entries.remove(pos);
                        return Ok(entry.envelope);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mut topics = self.inner.topics.lock().await;
        if let Some(group) = topics
            .get_mut(delivery.topic.name())
            .and_then(|t| t.groups.get_mut(&delivery.group))
        {
            group.pel.remove(&delivery.receipt);
        }
        self.inner.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mut topics = self.inner.topics.lock().await;
        if let Some(group) = topics
            .get_mut(delivery.topic.name())
            .and_then(|t| t.groups.get_mut(&delivery.group))
        {
            if let Some(mut entry) = group.pel.remove(&delivery.receipt) {
                entry.attempt += 1;
                group.queue.push_front(entry);
            }
        }
        self.inner.counters.nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        {
            let mut topics = self.inner.topics.lock().await;
            if let Some(group) = topics
                .get_mut(delivery.topic.name())
                .and_then(|t| t.groups.get_mut(&delivery.group))
            {
                group.pel.remove(&delivery.receipt);
            }
        }
        let dlq = delivery.topic.dlq();
        self.append(dlq.name(), delivery.envelope.clone(), delivery.attempt)
            .await;
        self.inner
            .dlq_reasons
            .lock()
            .await
            .entry(dlq.name().to_string())
            .or_default()
            .push(reason.to_string());
        self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn create_topic(&self, topic: &Topic) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.inner
            .topics
            .lock()
            .await
            .entry(topic.name().to_string())
            .or_default();
        Ok(())
    }

    async fn delete_topic(&self, topic: &Topic) -> Result<(), TransportError> {
        self.ensure_connected()?;
        self.inner.topics.lock().await.remove(topic.name());
        Ok(())
    }

    async fn purge_topic(&self, topic: &Topic) -> Result<u64, TransportError> {
        self.ensure_connected()?;
        let mut topics = self.inner.topics.lock().await;
        if let Some(state) = topics.get_mut(topic.name()) {
            let removed = state.entries.len() as u64;
            state.entries.clear();
            for group in state.groups.values_mut() {
                group.queue.clear();
            }
            Ok(removed)
        } else {
            Ok(0)
        }
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        let c = &self.inner.counters;
        Ok(TransportStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            nacked: c.nacked.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        })
    }

    async fn health_check(&self) -> Result<ComponentHealth, TransportError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(ComponentHealth::healthy("in-memory transport connected"))
        } else {
            Ok(ComponentHealth::unhealthy("not connected"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmo_core::{AgentId, MemoryEvent, MessageType};

    fn envelope() -> Envelope {
        Envelope::new(
            MessageType::MemoryEvent,
            AgentId::agent("planner"),
            vec![AgentId::agent("cmo")],
            "wesign",
            "webapp",
            &MemoryEvent {
                event: "test".into(),
                data: serde_json::json!({}),
            },
        )
        .unwrap()
    }

    fn topic() -> Topic {
        well_known::memory_events("wesign", "webapp")
    }

    #[tokio::test]
    async fn publish_subscribe_ack() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        let mut sub = transport
            .subscribe(&topic(), SubscribeOptions::new("cmo:grp", "c1"))
            .await
            .unwrap();

        transport.publish(&topic(), &envelope()).await.unwrap();
        let delivery = sub.deliveries.recv().await.unwrap();
        assert_eq!(delivery.attempt, 1);
        transport.ack(&delivery).await.unwrap();

        let stats = transport.stats().await.unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test]
    async fn nack_redelivers_with_bumped_attempt() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        let mut sub = transport
            .subscribe(&topic(), SubscribeOptions::new("cmo:grp", "c1"))
            .await
            .unwrap();

        transport.publish(&topic(), &envelope()).await.unwrap();
        let first = sub.deliveries.recv().await.unwrap();
        transport.nack(&first).await.unwrap();

        let second = sub.deliveries.recv().await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.envelope, first.envelope);
    }

    #[tokio::test]
    async fn reject_routes_to_dlq_with_reason() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        let mut sub = transport
            .subscribe(&topic(), SubscribeOptions::new("cmo:grp", "c1"))
            .await
            .unwrap();

        transport.publish(&topic(), &envelope()).await.unwrap();
        let delivery = sub.deliveries.recv().await.unwrap();
        transport.reject(&delivery, "timestamp_stale").await.unwrap();

        assert_eq!(
            transport.dlq_reasons(&topic()).await,
            vec!["timestamp_stale".to_string()]
        );
        assert_eq!(transport.stats().await.unwrap().rejected, 1);
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        let requests = well_known::context_requests("wesign", "webapp");

        let responder = transport.clone();
        let mut sub = responder
            .subscribe(&requests, SubscribeOptions::new("cmo:ctx", "c1"))
            .await
            .unwrap();
        tokio::spawn(async move {
            let delivery = sub.deliveries.recv().await.unwrap();
            let correlation = delivery.envelope.meta.correlation_id.clone().unwrap();
            let mut reply = delivery.envelope.clone();
            reply.meta.from = AgentId::service("context");
            let reply_topic =
                well_known::replies(&reply.meta.tenant, &reply.meta.project, &correlation);
            responder.publish(&reply_topic, &reply).await.unwrap();
            responder.ack(&delivery).await.unwrap();
        });

        let reply = transport
            .request(&requests, &envelope(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.meta.from, AgentId::service("context"));
    }

    #[tokio::test]
    async fn request_times_out() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        let err = transport
            .request(&topic(), &envelope(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[tokio::test]
    async fn disconnected_operations_fail() {
        let transport = InMemoryTransport::new();
        let err = transport.publish(&topic(), &envelope()).await.unwrap_err();
        assert_eq!(err.code(), "not_connected");
    }
}
