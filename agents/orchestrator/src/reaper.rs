//! The lease reaper and retention cleanup.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument::Instrumented, warn, Instrument};

use cmo_core::traits::AgentRegistry;

/// How often retention cleanup runs within the reaper loop.
const CLEANUP_EVERY: Duration = Duration::from_secs(60 * 60);

/// Agents whose leases lapsed in one reaper tick. The process glue
/// subscribes to this channel; nothing else observes the reaper directly.
#[derive(Debug, Clone)]
pub struct AgentsExpired {
    /// The newly unavailable agent ids.
    pub agent_ids: Vec<String>,
}

/// Periodically marks expired agents `UNAVAILABLE` and deletes agents that
/// stayed unavailable past the retention window.
pub struct LeaseReaper {
    registry: Arc<dyn AgentRegistry>,
    interval: Duration,
    retention_days: u32,
    expired_tx: mpsc::UnboundedSender<AgentsExpired>,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for LeaseReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseReaper")
            .field("interval", &self.interval)
            .field("retention_days", &self.retention_days)
            .finish_non_exhaustive()
    }
}

impl LeaseReaper {
    /// A reaper publishing expiries onto `expired_tx`.
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        interval: Duration,
        retention_days: u32,
        expired_tx: mpsc::UnboundedSender<AgentsExpired>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            interval,
            retention_days,
            expired_tx,
            shutdown,
        }
    }

    /// Run the reap loop until shutdown is signaled.
    pub fn spawn(self) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("reaper");
        tokio::spawn(async move { self.work_loop().await }).instrument(span)
    }

    async fn work_loop(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        let mut last_cleanup = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => {
                    info!("reaper stopped");
                    return Ok(());
                }
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "reaper tick failed");
            }
            if last_cleanup.elapsed() >= CLEANUP_EVERY {
                last_cleanup = tokio::time::Instant::now();
                match self
                    .registry
                    .cleanup_inactive_agents(self.retention_days)
                    .await
                {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "retention cleanup removed inactive agents"),
                    Err(e) => warn!(error = %e, "retention cleanup failed"),
                }
            }
        }
    }

    /// One sweep, extracted for tests.
    pub async fn tick(&self) -> Result<()> {
        let expired = self
            .registry
            .mark_expired_agents(OffsetDateTime::now_utc())
            .await?;
        if expired.is_empty() {
            return Ok(());
        }
        debug!(count = expired.len(), "leases expired");
        let _ = self.expired_tx.send(AgentsExpired {
            agent_ids: expired,
        });
        Ok(())
    }
}
