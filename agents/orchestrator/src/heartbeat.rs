//! The orchestrator's own liveness: registry heartbeat plus the
//! observability event on the heartbeats topic.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, warn, Instrument};

use cmo_base::publisher::EnvelopePublisher;
use cmo_core::traits::AgentRegistry;
use cmo_core::{AgentStatus, HeartbeatPayload};

/// Periodically extends the orchestrator's lease and publishes the
/// heartbeat event. Fires every `lease/3` by default.
pub struct HeartbeatPublisher {
    registry: Arc<dyn AgentRegistry>,
    publisher: EnvelopePublisher,
    agent_id: String,
    capabilities: Vec<String>,
    interval: Duration,
    lease_seconds: u64,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for HeartbeatPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatPublisher")
            .field("agent_id", &self.agent_id)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl HeartbeatPublisher {
    /// A publisher heartbeating as `agent_id`.
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        publisher: EnvelopePublisher,
        agent_id: impl Into<String>,
        capabilities: Vec<String>,
        interval: Duration,
        lease_seconds: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            publisher,
            agent_id: agent_id.into(),
            capabilities,
            interval,
            lease_seconds,
            shutdown,
        }
    }

    /// Run the heartbeat loop until shutdown is signaled.
    pub fn spawn(self) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("heartbeat", agent_id = %self.agent_id);
        tokio::spawn(async move { self.work_loop().await }).instrument(span)
    }

    async fn work_loop(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => {
                    info!("heartbeat publisher stopped");
                    return Ok(());
                }
            }
            if let Err(e) = self.beat().await {
                // A missed beat only shortens the lease margin; the loop
                // itself must survive transient store failures.
                warn!(error = %e, "heartbeat failed");
            }
        }
    }

    async fn beat(&self) -> Result<()> {
        self.registry
            .heartbeat(&self.agent_id, AgentStatus::Healthy, self.lease_seconds)
            .await?;
        self.publisher
            .publish_heartbeat_event(&HeartbeatPayload {
                agent_id: self.agent_id.clone(),
                status: AgentStatus::Healthy,
                capabilities: self.capabilities.clone(),
            })
            .await?;
        Ok(())
    }
}
