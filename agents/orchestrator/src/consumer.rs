//! The inbound worker: verify, gate, dedupe, dispatch, settle.
//!
//! One consumer runs per subscribed topic. Processing is serial per
//! consumer, which is what preserves per-trace ordering: all messages of a
//! trace share a partition key and therefore a stream.

use std::sync::Arc;

use eyre::Result;
use prometheus::{IntCounterVec, IntGaugeVec};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument::Instrumented, warn, Instrument};

use cmo_base::middleware::{
    CaveatConstraint, IdempotencyGuard, IdempotencyOutcome, PolicyChain, PolicyDecision,
};
use cmo_base::security::ReplayGuard;
use cmo_base::CoreMetrics;
use cmo_core::traits::{Delivery, SubscribeOptions, Transport};
use cmo_core::{Envelope, MessageType, Topic};

use crate::handlers::HandlerRegistry;

/// Redeliveries granted to a failing envelope before it is rejected.
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Emitted when an envelope is terminally rejected; the process glue turns
/// these into ESCALATE notices so no task fails silently.
#[derive(Debug, Clone)]
pub struct EscalationEvent {
    /// The rejected envelope.
    pub envelope: Envelope,
    /// Why it was rejected.
    pub reason: String,
}

struct ConsumerMetrics {
    processed: IntCounterVec,
    dlq: IntCounterVec,
    pending: IntGaugeVec,
}

/// One consumer-group subscription and its processing pipeline.
pub struct Consumer {
    transport: Arc<dyn Transport>,
    replay_guard: ReplayGuard,
    policy: Arc<PolicyChain>,
    idempotency: IdempotencyGuard,
    handlers: Arc<HandlerRegistry>,
    escalations: mpsc::UnboundedSender<EscalationEvent>,
    metrics: ConsumerMetrics,
    topic: Topic,
    options: SubscribeOptions,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Wire a consumer for one topic.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        replay_guard: ReplayGuard,
        policy: Arc<PolicyChain>,
        idempotency: IdempotencyGuard,
        handlers: Arc<HandlerRegistry>,
        escalations: mpsc::UnboundedSender<EscalationEvent>,
        metrics: &CoreMetrics,
        topic: Topic,
        options: SubscribeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            replay_guard,
            policy,
            idempotency,
            handlers,
            escalations,
            metrics: ConsumerMetrics {
                processed: metrics.envelopes_processed(),
                dlq: metrics.dlq_rejections(),
                pending: metrics.consumer_pending(),
            },
            topic,
            options,
            shutdown,
        }
    }

    /// Run the consume loop until the subscription closes or shutdown is
    /// signaled; in-flight work completes before the loop exits.
    pub fn spawn(self) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("consumer", topic = %self.topic);
        tokio::spawn(async move { self.work_loop().await }).instrument(span)
    }

    async fn work_loop(mut self) -> Result<()> {
        let mut subscription = self
            .transport
            .subscribe(&self.topic, self.options.clone())
            .await?;
        let pending = self.metrics.pending.with_label_values(&[self.topic.name()]);
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            // An in-flight delivery finishes before the loop observes the
            // shutdown signal, which is what "drain" means here.
            let delivery = tokio::select! {
                delivery = subscription.deliveries.recv() => delivery,
                _ = self.shutdown.changed() => break,
            };
            let Some(delivery) = delivery else {
                break;
            };
            pending.inc();
            if let Err(e) = self.process(&delivery).await {
                warn!(error = %e, receipt = %delivery.receipt, "processing failed");
            }
            pending.dec();
        }
        info!(topic = %self.topic, "consumer drained");
        Ok(())
    }

    fn outcome(&self, kind: &str, outcome: &str) {
        self.metrics
            .processed
            .with_label_values(&[kind, outcome])
            .inc();
    }

    async fn reject(&self, delivery: &Delivery, reason: &str, escalate: bool) -> Result<()> {
        self.transport.reject(delivery, reason).await?;
        self.metrics
            .dlq
            .with_label_values(&[delivery.topic.name(), reason])
            .inc();
        self.outcome(&delivery.envelope.meta.kind.to_string(), "rejected");
        if escalate {
            let _ = self.escalations.send(EscalationEvent {
                envelope: delivery.envelope.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Whether a terminal rejection of this envelope must surface as an
    /// ESCALATE notice. Task traffic must never fail silently.
    fn is_task_traffic(envelope: &Envelope) -> bool {
        matches!(
            envelope.meta.kind,
            MessageType::TaskInvoke | MessageType::TaskResult
        )
    }

    /// One delivery through the full pipeline.
    async fn process(&self, delivery: &Delivery) -> Result<()> {
        let envelope = &delivery.envelope;
        let kind = envelope.meta.kind.to_string();

        // 1. Structural validation.
        if let Err(e) = envelope.validate() {
            debug!(error = %e, "invalid envelope");
            return self
                .reject(delivery, e.code(), Self::is_task_traffic(envelope))
                .await;
        }

        // 2. Replay protection, signature included.
        if let Err(e) = self.replay_guard.check(envelope) {
            debug!(error = %e, "replay check failed");
            return self
                .reject(delivery, e.code(), Self::is_task_traffic(envelope))
                .await;
        }

        // 3. Policy gate.
        let caveat: Option<CaveatConstraint> = match self.policy.evaluate(envelope).await {
            PolicyDecision::Allow => None,
            PolicyDecision::AllowWithCaveat(constraint) => Some(constraint),
            PolicyDecision::Deny { reason } => {
                debug!(reason, "policy denied envelope");
                return self.reject(delivery, "deny", Self::is_task_traffic(envelope)).await;
            }
        };

        // 4. Idempotency guard.
        match self.idempotency.claim(envelope).await? {
            IdempotencyOutcome::Fresh => {}
            IdempotencyOutcome::Duplicate => {
                debug!(message_id = %envelope.meta.message_id, "duplicate delivery dropped");
                self.transport.ack(delivery).await?;
                self.outcome(&kind, "duplicate");
                return Ok(());
            }
        }

        // 5. Dispatch by type.
        let Some(handler) = self.handlers.get(envelope.meta.kind) else {
            self.idempotency.release(envelope).await?;
            return self
                .reject(delivery, "unknown_type", Self::is_task_traffic(envelope))
                .await;
        };
        match handler.handle(envelope, caveat.as_ref()).await {
            Ok(()) => {
                self.transport.ack(delivery).await?;
                self.outcome(&kind, "handled");
                Ok(())
            }
            Err(e) => {
                // Leave the key unset so redelivery can succeed.
                self.idempotency.release(envelope).await?;
                self.outcome(&kind, "failed");
                if delivery.attempt >= MAX_DELIVERY_ATTEMPTS {
                    warn!(error = %e, attempts = delivery.attempt, "redelivery exhausted");
                    self.reject(delivery, "handler_failed", Self::is_task_traffic(envelope))
                        .await
                } else {
                    debug!(error = %e, attempt = delivery.attempt, "handler failed, requeueing");
                    self.transport.nack(delivery).await?;
                    Ok(())
                }
            }
        }
    }
}
