use std::fmt::Debug;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{AgentRecord, AgentStatus, DiscoveryFilter, RegistryError, TopicSubscription};

/// The agent registry capability set.
///
/// Register and heartbeat are single-row upserts; the reaper and retention
/// cleanup are bulk sweeps. No operation here requires locks beyond the row
/// level.
#[async_trait]
pub trait AgentRegistry: Send + Sync + Debug {
    /// Upsert an agent with a fresh lease and status `STARTING`.
    ///
    /// Returns the stored record, lease applied.
    async fn register(
        &self,
        agent: AgentRecord,
        lease_seconds: u64,
    ) -> Result<AgentRecord, RegistryError>;

    /// Record a heartbeat: set `status`, update `last_heartbeat`, and extend
    /// the lease. Lease extension is monotone; a heartbeat never shortens
    /// `lease_until`. Fails with `agent_not_found` when the agent never
    /// registered.
    async fn heartbeat(
        &self,
        agent_id: &str,
        status: AgentStatus,
        lease_seconds: u64,
    ) -> Result<AgentRecord, RegistryError>;

    /// Look up one agent.
    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, RegistryError>;

    /// Agents matching the filter whose leases are live.
    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<AgentRecord>, RegistryError>;

    /// Explicitly mark an agent `UNAVAILABLE`.
    async fn mark_unavailable(&self, agent_id: &str) -> Result<(), RegistryError>;

    /// Record a topic subscription. Unique per `(agent, topic, role)`.
    async fn subscribe_topic(&self, subscription: TopicSubscription) -> Result<(), RegistryError>;

    /// Remove an agent's subscription to a topic.
    async fn unsubscribe_topic(&self, agent_id: &str, topic: &str) -> Result<(), RegistryError>;

    /// Reaper sweep: set every agent with `lease_until < now` and a status
    /// other than `UNAVAILABLE` to `UNAVAILABLE`. Returns the affected ids
    /// so the caller can fan the event out on its channel.
    async fn mark_expired_agents(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError>;

    /// Delete `UNAVAILABLE` agents untouched for `days`. Returns rows
    /// removed.
    async fn cleanup_inactive_agents(&self, days: u32) -> Result<u64, RegistryError>;

    /// Release the store's resources during shutdown. Idempotent.
    async fn close(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}
