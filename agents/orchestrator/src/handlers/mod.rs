//! Inbound dispatch: one handler per envelope type.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, instrument};

use cmo_base::middleware::CaveatConstraint;
use cmo_core::traits::AgentRegistry;
use cmo_core::{Envelope, HeartbeatPayload, MemoryEvent, MessageType};

use crate::decision::DecisionEngine;

/// A typed envelope handler. Returning an error leaves the idempotency key
/// unclaimed and triggers redelivery, so handlers must be safe to re-run.
#[async_trait]
pub trait InboundHandler: Send + Sync + Debug {
    /// Process one delivered envelope. `caveat` carries any
    /// `allow_with_caveat` constraint the policy gate attached.
    async fn handle(
        &self,
        envelope: &Envelope,
        caveat: Option<&CaveatConstraint>,
    ) -> Result<()>;
}

/// Maps `meta.type` onto a handler. Types without a handler are rejected
/// to the DLQ with reason `unknown_type`.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Arc<dyn InboundHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `kind` to `handler`.
    pub fn register(mut self, kind: MessageType, handler: Arc<dyn InboundHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// The handler for `kind`, if one is registered.
    pub fn get(&self, kind: MessageType) -> Option<Arc<dyn InboundHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

/// Grades specialist results through the decision engine.
#[derive(Debug)]
pub struct TaskResultHandler {
    engine: Arc<DecisionEngine>,
}

impl TaskResultHandler {
    /// A handler over the shared engine.
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl InboundHandler for TaskResultHandler {
    #[instrument(skip_all, fields(trace_id = %envelope.meta.trace_id))]
    async fn handle(
        &self,
        envelope: &Envelope,
        caveat: Option<&CaveatConstraint>,
    ) -> Result<()> {
        if let Some(constraint) = caveat {
            debug!(kind = %constraint.kind, "grading under policy caveat");
        }
        self.engine.grade(envelope).await?;
        Ok(())
    }
}

/// Applies specialist heartbeats to the registry.
#[derive(Debug)]
pub struct HeartbeatHandler {
    registry: Arc<dyn AgentRegistry>,
    lease_seconds: u64,
}

impl HeartbeatHandler {
    /// A handler extending leases by `lease_seconds`.
    pub fn new(registry: Arc<dyn AgentRegistry>, lease_seconds: u64) -> Self {
        Self {
            registry,
            lease_seconds,
        }
    }
}

#[async_trait]
impl InboundHandler for HeartbeatHandler {
    #[instrument(skip_all)]
    async fn handle(
        &self,
        envelope: &Envelope,
        _caveat: Option<&CaveatConstraint>,
    ) -> Result<()> {
        let payload: HeartbeatPayload = envelope.typed_payload()?;
        // A heartbeat fails if the agent was never registered; the failure
        // propagates so the delivery cycles and eventually rejects to DLQ.
        self.registry
            .heartbeat(&payload.agent_id, payload.status, self.lease_seconds)
            .await?;
        Ok(())
    }
}

/// Logs memory-fabric events. The orchestrator subscribes for
/// observability only; durable memory lives with the memory service.
#[derive(Debug, Default)]
pub struct MemoryEventHandler;

#[async_trait]
impl InboundHandler for MemoryEventHandler {
    async fn handle(
        &self,
        envelope: &Envelope,
        _caveat: Option<&CaveatConstraint>,
    ) -> Result<()> {
        let event: MemoryEvent = envelope.typed_payload()?;
        debug!(event = %event.event, from = %envelope.meta.from, "memory event observed");
        Ok(())
    }
}

/// Escalates specialist error reports.
#[derive(Debug)]
pub struct ErrorReportHandler {
    engine: Arc<DecisionEngine>,
}

impl ErrorReportHandler {
    /// A handler over the shared engine.
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl InboundHandler for ErrorReportHandler {
    #[instrument(skip_all, fields(trace_id = %envelope.meta.trace_id))]
    async fn handle(
        &self,
        envelope: &Envelope,
        _caveat: Option<&CaveatConstraint>,
    ) -> Result<()> {
        self.engine.escalate_error_report(envelope).await
    }
}
