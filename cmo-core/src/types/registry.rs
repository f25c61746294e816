use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use time::OffsetDateTime;

/// Liveness status of a registered agent.
///
/// `STARTING -> HEALTHY` on the first successful heartbeat;
/// `HEALTHY <-> DEGRADED` on self-report; any status moves to `UNAVAILABLE`
/// via the reaper or an explicit mark; rows are deleted by retention cleanup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Registered but not yet heartbeating.
    Starting,
    /// Serving traffic.
    Healthy,
    /// Serving traffic with reduced capacity.
    Degraded,
    /// Lease expired or explicitly marked down.
    Unavailable,
}

impl AgentStatus {
    /// Statuses considered live for discovery's default filter.
    pub fn default_discovery_filter() -> Vec<AgentStatus> {
        vec![AgentStatus::Healthy, AgentStatus::Degraded]
    }
}

/// A registry row for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent identifier, `[a-z0-9_-]+`.
    pub agent_id: String,
    /// Agent software version.
    pub version: String,
    /// Tenant scope.
    pub tenant: String,
    /// Project scope.
    pub project: String,
    /// Capabilities served, e.g. `selector-extraction`.
    pub capabilities: Vec<String>,
    /// Current liveness status.
    pub status: AgentStatus,
    /// Last heartbeat observed, if any.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
    /// Liveness claim expiry.
    #[serde(with = "time::serde::rfc3339")]
    pub lease_until: OffsetDateTime,
    /// Operator metadata.
    #[serde(default)]
    pub metadata: Value,
}

/// Role of an agent on a topic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TopicRole {
    /// Publishes to the topic.
    Publisher,
    /// Consumes from the topic.
    Subscriber,
    /// Publishes and consumes.
    Both,
}

/// One `(agent, topic, role)` subscription. Unique per tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    /// Subscribing agent.
    pub agent_id: String,
    /// Topic name.
    pub topic: String,
    /// The agent's role on the topic.
    pub role: TopicRole,
}

/// Filter for capability discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    /// Tenant scope. Required.
    pub tenant: String,
    /// Project scope. Required.
    pub project: String,
    /// Restrict to agents serving this capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Restrict to these statuses; `None` means `{HEALTHY, DEGRADED}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<AgentStatus>>,
}

impl DiscoveryFilter {
    /// Filter on tenant and project only.
    pub fn new(tenant: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            project: project.into(),
            capability: None,
            statuses: None,
        }
    }

    /// Restrict to a capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// The effective status filter.
    pub fn effective_statuses(&self) -> Vec<AgentStatus> {
        self.statuses
            .clone()
            .unwrap_or_else(AgentStatus::default_discovery_filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names_are_screaming() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::Unavailable).unwrap(),
            "\"UNAVAILABLE\""
        );
        assert_eq!(AgentStatus::Starting.to_string(), "STARTING");
    }

    #[test]
    fn default_filter_is_live_statuses() {
        let filter = DiscoveryFilter::new("wesign", "webapp");
        assert_eq!(
            filter.effective_statuses(),
            vec![AgentStatus::Healthy, AgentStatus::Degraded]
        );
    }
}
