//! Typed, signed envelope publishers.
//!
//! Every outbound envelope flows through [`EnvelopePublisher`]: compose
//! meta, sign with the envelope secret, publish through the transport with
//! bounded exponential backoff and jitter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{instrument, warn};

use cmo_core::traits::Transport;
use cmo_core::{
    well_known, AgentId, CmoError, DecisionNoticePayload, Envelope, HeartbeatPayload, MemoryEvent,
    MessageType, TaskInvoke, Topic,
};

use crate::security::EnvelopeSigner;

/// Publish retry caps, applied per envelope.
const MAX_PUBLISH_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;

/// Composes, signs and publishes envelopes for one producing agent.
#[derive(Clone, Debug)]
pub struct EnvelopePublisher {
    transport: Arc<dyn Transport>,
    signer: EnvelopeSigner,
    from: AgentId,
    tenant: String,
    project: String,
}

impl EnvelopePublisher {
    /// A publisher producing as `from`, scoped to one tenant/project.
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: EnvelopeSigner,
        from: AgentId,
        tenant: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            signer,
            from,
            tenant: tenant.into(),
            project: project.into(),
        }
    }

    /// Build and sign an envelope without publishing it.
    pub fn build<P: Serialize>(
        &self,
        kind: MessageType,
        to: Vec<AgentId>,
        trace_id: Option<String>,
        payload: &P,
    ) -> Result<Envelope, CmoError> {
        let mut envelope = match trace_id {
            Some(trace_id) => Envelope::with_trace(
                kind,
                self.from.clone(),
                to,
                self.tenant.clone(),
                self.project.clone(),
                trace_id,
                cmo_core::utils::new_message_id(),
                payload,
            )?,
            None => Envelope::new(
                kind,
                self.from.clone(),
                to,
                self.tenant.clone(),
                self.project.clone(),
                payload,
            )?,
        };
        self.signer.sign(&mut envelope)?;
        Ok(envelope)
    }

    /// Publish with bounded exponential backoff and jitter. Returns the
    /// broker handle of the appended entry.
    #[instrument(skip(self, envelope), fields(topic = %topic, message_id = %envelope.meta.message_id))]
    pub async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<String, CmoError> {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.publish(topic, envelope).await {
                Ok(handle) => return Ok(handle),
                Err(e) if attempt >= MAX_PUBLISH_ATTEMPTS => return Err(e.into()),
                Err(e) => {
                    let jitter = rand::thread_rng().gen_range(0..backoff_ms / 2 + 1);
                    warn!(error = %e, attempt, backoff_ms, "publish failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    /// Publish a `TaskInvoke` to the specialist invoke topic. `to` is the
    /// sole recipient on retries.
    pub async fn publish_task_invoke(
        &self,
        to: AgentId,
        trace_id: Option<String>,
        payload: &TaskInvoke,
    ) -> Result<Envelope, CmoError> {
        let envelope = self.build(MessageType::TaskInvoke, vec![to], trace_id, payload)?;
        let topic = well_known::specialist_invoke(&self.tenant, &self.project);
        self.publish(&topic, &envelope).await?;
        Ok(envelope)
    }

    /// Publish a `DecisionNotice`. Escalations go to the escalation topic,
    /// everything else to the decisions topic.
    pub async fn publish_decision_notice(
        &self,
        trace_id: String,
        payload: &DecisionNoticePayload,
        escalation: bool,
    ) -> Result<Envelope, CmoError> {
        let envelope = self.build(
            MessageType::DecisionNotice,
            vec![AgentId::topic("cmo-decisions")],
            Some(trace_id),
            payload,
        )?;
        let topic = if escalation {
            well_known::cmo_escalations(&self.tenant, &self.project)
        } else {
            well_known::cmo_decisions(&self.tenant, &self.project)
        };
        self.publish(&topic, &envelope).await?;
        Ok(envelope)
    }

    /// Publish the registry heartbeat observability event: a
    /// `MemoryEvent`-typed wrapper around the heartbeat payload.
    pub async fn publish_heartbeat_event(
        &self,
        payload: &HeartbeatPayload,
    ) -> Result<Envelope, CmoError> {
        let event = MemoryEvent {
            event: "heartbeat".to_string(),
            data: serde_json::to_value(payload)
                .map_err(|e| cmo_core::ValidationError::at("payload", e.to_string()))?,
        };
        let envelope = self.build(
            MessageType::MemoryEvent,
            vec![AgentId::topic("registry-heartbeats")],
            None,
            &event,
        )?;
        let topic = well_known::registry_heartbeats(&self.tenant, &self.project);
        self.publish(&topic, &envelope).await?;
        Ok(envelope)
    }

    /// Publish a memory event.
    pub async fn publish_memory_event(&self, event: &MemoryEvent) -> Result<Envelope, CmoError> {
        let envelope = self.build(
            MessageType::MemoryEvent,
            vec![AgentId::topic("memory-events")],
            None,
            event,
        )?;
        let topic = well_known::memory_events(&self.tenant, &self.project);
        self.publish(&topic, &envelope).await?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use cmo_core::Decision;

    async fn publisher() -> (EnvelopePublisher, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        transport.connect().await.unwrap();
        let publisher = EnvelopePublisher::new(
            transport.clone(),
            EnvelopeSigner::new("secret"),
            AgentId::service("cmo"),
            "wesign",
            "webapp",
        );
        (publisher, transport)
    }

    #[tokio::test]
    async fn published_envelopes_are_signed() {
        let (publisher, transport) = publisher().await;
        let envelope = publisher
            .publish_decision_notice(
                "trace-1".to_string(),
                &DecisionNoticePayload {
                    decision: Decision::Accept,
                    qscore: 0.9,
                    reasons: vec!["top: result_confidence=0.155".into()],
                    specialist_id: "specialist-sel".into(),
                    attempt_no: 0,
                    retry_target_specialist: None,
                },
                false,
            )
            .await
            .unwrap();
        assert!(envelope.meta.signature.is_some());
        EnvelopeSigner::new("secret").verify(&envelope).unwrap();
        assert_eq!(
            transport
                .appended(&well_known::cmo_decisions("wesign", "webapp"))
                .await,
            1
        );
    }

    #[tokio::test]
    async fn escalations_use_the_escalation_topic() {
        let (publisher, transport) = publisher().await;
        publisher
            .publish_decision_notice(
                "trace-1".to_string(),
                &DecisionNoticePayload {
                    decision: Decision::Escalate,
                    qscore: 0.2,
                    reasons: vec!["policy_degraded".into()],
                    specialist_id: "specialist-sel".into(),
                    attempt_no: 1,
                    retry_target_specialist: None,
                },
                true,
            )
            .await
            .unwrap();
        assert_eq!(
            transport
                .appended(&well_known::cmo_escalations("wesign", "webapp"))
                .await,
            1
        );
        assert_eq!(
            transport
                .appended(&well_known::cmo_decisions("wesign", "webapp"))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn retry_invoke_keeps_the_trace() {
        let (publisher, _transport) = publisher().await;
        let envelope = publisher
            .publish_task_invoke(
                AgentId::agent("specialist-b"),
                Some("trace-7".to_string()),
                &TaskInvoke {
                    task: "extract selectors".into(),
                    capability: "selector-extraction".into(),
                    inputs: serde_json::json!({}),
                    attempt_no: 1,
                    summary_hint: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(envelope.meta.trace_id, "trace-7");
        assert_eq!(envelope.meta.to, vec![AgentId::agent("specialist-b")]);
    }
}
