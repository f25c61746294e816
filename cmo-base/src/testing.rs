//! In-memory implementations of the store traits, for tests and local
//! single-process runs. Semantics mirror the Postgres implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use cmo_core::traits::{
    AgentRegistry, Checkpointer, GradingInsert, GradingStore,
};
use cmo_core::{
    ActivityRecord, AgentRecord, AgentStatus, CheckpointError, DecisionError, DiscoveryFilter,
    GradingEvent, RegistryError, RunRecord, RunStatus, StepRecord, StepReplay, TopicSubscription,
};

/// In-memory agent registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    agents: Mutex<HashMap<String, AgentRecord>>,
    subscriptions: Mutex<Vec<TopicSubscription>>,
}

impl MemoryRegistry {
    /// An empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AgentRegistry for MemoryRegistry {
    async fn register(
        &self,
        agent: AgentRecord,
        lease_seconds: u64,
    ) -> Result<AgentRecord, RegistryError> {
        let record = AgentRecord {
            status: AgentStatus::Starting,
            last_heartbeat: None,
            lease_until: OffsetDateTime::now_utc()
                + time::Duration::seconds(lease_seconds as i64),
            ..agent
        };
        self.agents
            .lock()
            .insert(record.agent_id.clone(), record.clone());
        Ok(record)
    }

    async fn heartbeat(
        &self,
        agent_id: &str,
        status: AgentStatus,
        lease_seconds: u64,
    ) -> Result<AgentRecord, RegistryError> {
        let mut agents = self.agents.lock();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;
        let now = OffsetDateTime::now_utc();
        let extended = now + time::Duration::seconds(lease_seconds as i64);
        record.status = status;
        record.last_heartbeat = Some(now);
        record.lease_until = record.lease_until.max(extended);
        Ok(record.clone())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, RegistryError> {
        Ok(self.agents.lock().get(agent_id).cloned())
    }

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<AgentRecord>, RegistryError> {
        let now = OffsetDateTime::now_utc();
        let statuses = filter.effective_statuses();
        let mut matches: Vec<AgentRecord> = self
            .agents
            .lock()
            .values()
            .filter(|a| a.tenant == filter.tenant && a.project == filter.project)
            .filter(|a| statuses.contains(&a.status))
            .filter(|a| a.lease_until > now)
            .filter(|a| {
                filter
                    .capability
                    .as_ref()
                    .map_or(true, |c| a.capabilities.iter().any(|have| have == c))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(matches)
    }

    async fn mark_unavailable(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;
        record.status = AgentStatus::Unavailable;
        Ok(())
    }

    async fn subscribe_topic(&self, subscription: TopicSubscription) -> Result<(), RegistryError> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains(&subscription) {
            return Err(RegistryError::DuplicateTopicSubscription {
                agent_id: subscription.agent_id,
                topic: subscription.topic,
            });
        }
        subscriptions.push(subscription);
        Ok(())
    }

    async fn unsubscribe_topic(&self, agent_id: &str, topic: &str) -> Result<(), RegistryError> {
        self.subscriptions
            .lock()
            .retain(|s| !(s.agent_id == agent_id && s.topic == topic));
        Ok(())
    }

    async fn mark_expired_agents(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError> {
        let mut expired = Vec::new();
        for record in self.agents.lock().values_mut() {
            if record.lease_until < now && record.status != AgentStatus::Unavailable {
                record.status = AgentStatus::Unavailable;
                expired.push(record.agent_id.clone());
            }
        }
        expired.sort();
        Ok(expired)
    }

    async fn cleanup_inactive_agents(&self, days: u32) -> Result<u64, RegistryError> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(days as i64);
        let mut agents = self.agents.lock();
        let before = agents.len();
        agents.retain(|_, a| {
            !(a.status == AgentStatus::Unavailable
                && a.last_heartbeat.map_or(true, |hb| hb < cutoff))
        });
        Ok((before - agents.len()) as u64)
    }
}

/// In-memory checkpoint journal.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    graphs: Mutex<HashMap<(String, String), serde_json::Value>>,
    runs: Mutex<HashMap<String, RunRecord>>,
    steps: Mutex<BTreeMap<(String, i32), StepRecord>>,
    activities: Mutex<Vec<ActivityRecord>>,
}

impl MemoryCheckpointer {
    /// An empty journal.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn register_graph(
        &self,
        graph_id: &str,
        graph_version: &str,
        definition: serde_json::Value,
    ) -> Result<(), CheckpointError> {
        self.graphs
            .lock()
            .entry((graph_id.to_string(), graph_version.to_string()))
            .or_insert(definition);
        Ok(())
    }

    async fn begin_run(&self, run: RunRecord) -> Result<(), CheckpointError> {
        self.runs
            .lock()
            .entry(run.trace_id.clone())
            .or_insert(run);
        Ok(())
    }

    async fn complete_run(
        &self,
        trace_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), CheckpointError> {
        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(trace_id)
            .ok_or_else(|| CheckpointError::Store(format!("no run for trace `{trace_id}`")))?;
        run.status = status;
        run.completed_at = Some(OffsetDateTime::now_utc());
        run.error = error;
        Ok(())
    }

    async fn get_run(&self, trace_id: &str) -> Result<Option<RunRecord>, CheckpointError> {
        Ok(self.runs.lock().get(trace_id).cloned())
    }

    async fn record_step(&self, step: StepRecord) -> Result<(), CheckpointError> {
        self.steps
            .lock()
            .insert((step.trace_id.clone(), step.step_index), step);
        Ok(())
    }

    async fn record_activity(&self, activity: ActivityRecord) -> Result<bool, CheckpointError> {
        let mut activities = self.activities.lock();
        let duplicate = activities.iter().any(|a| {
            a.trace_id == activity.trace_id
                && a.step_index == activity.step_index
                && a.activity_type == activity.activity_type
                && a.request_hash == activity.request_hash
        });
        if duplicate {
            return Ok(false);
        }
        activities.push(activity);
        Ok(true)
    }

    async fn replay(&self, trace_id: &str) -> Result<Vec<StepReplay>, CheckpointError> {
        let steps = self.steps.lock();
        let activities = self.activities.lock();
        Ok(steps
            .iter()
            .filter(|((trace, _), _)| trace == trace_id)
            .map(|(_, step)| StepReplay {
                step: step.clone(),
                activities: activities
                    .iter()
                    .filter(|a| a.trace_id == trace_id && a.step_index == step.step_index)
                    .cloned()
                    .collect(),
            })
            .collect())
    }

    async fn cleanup_old_executions(&self, retention_days: u32) -> Result<u64, CheckpointError> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(retention_days as i64);
        let mut runs = self.runs.lock();
        let stale: Vec<String> = runs
            .values()
            .filter(|r| r.status.is_terminal() && r.started_at < cutoff)
            .map(|r| r.trace_id.clone())
            .collect();
        for trace_id in &stale {
            runs.remove(trace_id);
            self.steps.lock().retain(|(trace, _), _| trace != trace_id);
            self.activities.lock().retain(|a| &a.trace_id != trace_id);
        }
        Ok(stale.len() as u64)
    }
}

/// In-memory grading-event store.
#[derive(Debug, Default)]
pub struct MemoryGradingStore {
    events: Mutex<Vec<GradingEvent>>,
}

impl MemoryGradingStore {
    /// An empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl GradingStore for MemoryGradingStore {
    async fn insert_once(&self, event: GradingEvent) -> Result<GradingInsert, DecisionError> {
        let mut events = self.events.lock();
        if let Some(existing) = events
            .iter()
            .find(|e| e.idempotency_key == event.idempotency_key)
        {
            return Ok(GradingInsert::Existing(existing.clone()));
        }
        events.push(event);
        Ok(GradingInsert::Inserted)
    }

    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<GradingEvent>, DecisionError> {
        Ok(self
            .events
            .lock()
            .iter()
            .find(|e| e.idempotency_key == key)
            .cloned())
    }

    async fn events_for_trace(&self, trace_id: &str) -> Result<Vec<GradingEvent>, DecisionError> {
        let mut events: Vec<GradingEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.attempt_no);
        Ok(events)
    }
}
