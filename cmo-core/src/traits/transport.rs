use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Envelope, Topic, TransportError};

/// Default cap on messages a consumer may own before reads pause.
pub const DEFAULT_MAX_PENDING: usize = 256;

/// Options for a consumer-group subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Consumer-group name; all consumers sharing it split the stream.
    pub group: String,
    /// Durable consumer name within the group.
    pub consumer: String,
    /// Max messages owned-but-unacked before the subscription pauses reads.
    pub max_pending: usize,
}

impl SubscribeOptions {
    /// Options with the default pending cap.
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// One message owned by a consumer until ack/nack/reject.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the message arrived on.
    pub topic: Topic,
    /// The delivered envelope.
    pub envelope: Envelope,
    /// Broker receipt handle (stream entry id for Redis).
    pub receipt: String,
    /// Consumer group that owns the delivery.
    pub group: String,
    /// Delivery attempt, starting at 1; incremented by nack redelivery.
    pub attempt: u32,
}

/// A live subscription. Dropping the receiver ends delivery; the bounded
/// channel is the flow-control mechanism (a full channel pauses reads).
#[derive(Debug)]
pub struct Subscription {
    /// Stream of owned deliveries.
    pub deliveries: mpsc::Receiver<Delivery>,
}

/// Counters reported by [`Transport::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Envelopes appended.
    pub published: u64,
    /// Envelopes handed to consumers.
    pub delivered: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Deliveries re-queued.
    pub nacked: u64,
    /// Deliveries routed to a DLQ.
    pub rejected: u64,
}

/// Component health as exposed on the health surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Fully operational.
    Healthy,
    /// Operational with reduced capacity or stale data.
    Degraded,
    /// Not operational.
    Unhealthy,
}

/// Health report of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Aggregatable state.
    pub state: HealthState,
    /// Operator-facing detail.
    pub detail: String,
}

impl ComponentHealth {
    /// A healthy report.
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            state: HealthState::Healthy,
            detail: detail.into(),
        }
    }

    /// An unhealthy report.
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            state: HealthState::Unhealthy,
            detail: detail.into(),
        }
    }
}

/// The broker capability set.
///
/// One implementation per broker variant; Redis Streams is the live one.
/// Every method that contacts the broker takes or implies a deadline; no
/// call may block indefinitely.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Establish the broker connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear down the broker connection. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Append an envelope to a topic. Returns the broker message handle.
    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<String, TransportError>;

    /// Join a consumer group on a topic and stream owned deliveries.
    async fn subscribe(
        &self,
        topic: &Topic,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError>;

    /// Publish and await the correlated response on an ephemeral reply
    /// topic. Times out with [`TransportError::Timeout`].
    async fn request(
        &self,
        topic: &Topic,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, TransportError>;

    /// Acknowledge a delivery, releasing ownership.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Return a delivery to the stream for redelivery.
    async fn nack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Route a delivery to the topic's DLQ with a reason header.
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), TransportError>;

    /// Create the underlying stream. Publishing auto-creates; this exists
    /// for explicit provisioning.
    async fn create_topic(&self, topic: &Topic) -> Result<(), TransportError>;

    /// Delete the underlying stream.
    async fn delete_topic(&self, topic: &Topic) -> Result<(), TransportError>;

    /// Drop all pending entries from a topic. Returns entries removed.
    async fn purge_topic(&self, topic: &Topic) -> Result<u64, TransportError>;

    /// Counters since connect.
    async fn stats(&self) -> Result<TransportStats, TransportError>;

    /// Broker reachability check.
    async fn health_check(&self) -> Result<ComponentHealth, TransportError>;
}
