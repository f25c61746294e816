use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use futures_util::future::select_all;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, warn, Instrument};

use cmo_base::db::{PostgresCheckpointer, PostgresGradingStore, PostgresRegistry};
use cmo_base::middleware::{IdempotencyGuard, PolicyChain, TenantScopePolicy};
use cmo_base::publisher::EnvelopePublisher;
use cmo_base::security::ReplayGuard;
use cmo_base::transport::RedisIdempotencyStore;
use cmo_base::{BaseAgent, CoreMetrics, HealthSurface};
use cmo_core::qscore::{CalibrationTable, QScoreCalculator, QScoreWeights};
use cmo_core::traits::{AgentRegistry, Checkpointer, SubscribeOptions, Transport};
use cmo_core::utils::now_utc_millis;
use cmo_core::{well_known, AgentId, AgentRecord, AgentStatus, MessageType, TopicRole, TopicSubscription};

use crate::consumer::{Consumer, EscalationEvent};
use crate::decision::DecisionEngine;
use crate::handlers::{
    ErrorReportHandler, HandlerRegistry, HeartbeatHandler, MemoryEventHandler, TaskResultHandler,
};
use crate::heartbeat::HeartbeatPublisher;
use crate::reaper::{AgentsExpired, LeaseReaper};
use crate::settings::OrchestratorSettings;

/// The id under which the orchestrator registers itself.
const ORCHESTRATOR_AGENT_ID: &str = "cmo-orchestrator";

/// The CMO agent: consumers, decision engine, heartbeat and reaper glued
/// into one process lifecycle.
pub struct Orchestrator {
    tenant: String,
    project: String,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn AgentRegistry>,
    checkpointer: Arc<dyn Checkpointer>,
    engine: Arc<DecisionEngine>,
    handlers: Arc<HandlerRegistry>,
    replay_guard: ReplayGuard,
    policy: Arc<PolicyChain>,
    idempotency: IdempotencyGuard,
    publisher: EnvelopePublisher,
    metrics: Arc<CoreMetrics>,
    health: Arc<HealthSurface>,
    group_prefix: String,
    heartbeat_interval: Duration,
    lease_seconds: u64,
    reaper_interval: Duration,
    retention_days: u32,
    checkpoint_retention_days: u32,
    /// `shutdown` flips this; every long-running task selects on it and the
    /// run supervisor performs the ordered teardown.
    shutdown_tx: watch::Sender<bool>,
    // Wired in from_settings, consumed by run.
    escalation_rx: Mutex<Option<mpsc::UnboundedReceiver<EscalationEvent>>>,
    escalation_tx: mpsc::UnboundedSender<EscalationEvent>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentsExpired>>>,
    expired_tx: mpsc::UnboundedSender<AgentsExpired>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tenant", &self.tenant)
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BaseAgent for Orchestrator {
    const AGENT_NAME: &'static str = "orchestrator";

    type Settings = OrchestratorSettings;

    async fn from_settings(
        settings: Self::Settings,
        metrics: Arc<CoreMetrics>,
        health: Arc<HealthSurface>,
    ) -> Result<Self>
    where
        Self: Sized,
    {
        let tenant = settings.tenant.clone();
        let project = settings.project.clone();

        // Startup order: storage, checkpointer, registry, transport,
        // middleware, handlers. Background tasks start in `run`.
        let db = settings.db().await?;
        let blob = settings.blob_store().map_err(|e| eyre::eyre!(e))?;
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(PostgresCheckpointer::new(
            db.clone(),
            blob,
            settings.blob_max_inline_bytes(),
        ));
        let registry: Arc<dyn AgentRegistry> = Arc::new(PostgresRegistry::new(db.clone()));
        let grading = Arc::new(PostgresGradingStore::new(db));

        let transport = Arc::new(settings.transport()?);
        transport.connect().await?;
        let group_prefix = settings.redis_consumer_group_prefix.clone();

        let idempotency_store = Arc::new(
            RedisIdempotencyStore::connect(&settings.redis_url, &group_prefix).await?,
        );
        let idempotency = IdempotencyGuard::new(idempotency_store);
        let replay_guard = settings.replay_guard();
        let policy = Arc::new(
            PolicyChain::new().with(TenantScopePolicy::new(tenant.clone(), project.clone())),
        );

        let publisher = EnvelopePublisher::new(
            transport.clone() as Arc<dyn Transport>,
            settings.envelope_signer(),
            AgentId::service(ORCHESTRATOR_AGENT_ID),
            tenant.clone(),
            project.clone(),
        );
        let calculator = QScoreCalculator::new(
            QScoreWeights::default(),
            CalibrationTable::identity(),
        )?;
        let engine = Arc::new(DecisionEngine::new(
            calculator,
            registry.clone(),
            grading,
            checkpointer.clone(),
            publisher.clone(),
            &metrics,
            settings.qscore_accept_threshold(),
            settings.max_retries(),
            tenant.clone(),
            project.clone(),
        ));
        engine.register_graph().await?;

        let handlers = Arc::new(
            HandlerRegistry::new()
                .register(
                    MessageType::TaskResult,
                    Arc::new(TaskResultHandler::new(engine.clone())),
                )
                .register(
                    MessageType::Heartbeat,
                    Arc::new(HeartbeatHandler::new(
                        registry.clone(),
                        settings.lease_duration().as_secs(),
                    )),
                )
                .register(MessageType::MemoryEvent, Arc::new(MemoryEventHandler))
                .register(
                    MessageType::Error,
                    Arc::new(ErrorReportHandler::new(engine.clone())),
                ),
        );

        let (escalation_tx, escalation_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let orchestrator = Self {
            tenant,
            project,
            transport: transport as Arc<dyn Transport>,
            registry,
            checkpointer,
            engine,
            handlers,
            replay_guard,
            policy,
            idempotency,
            publisher,
            metrics,
            health,
            group_prefix,
            heartbeat_interval: settings.heartbeat_interval(),
            lease_seconds: settings.lease_duration().as_secs(),
            reaper_interval: settings.reaper_interval(),
            retention_days: settings.agent_retention_days(),
            checkpoint_retention_days: settings.checkpoint_retention_days(),
            shutdown_tx,
            escalation_rx: Mutex::new(Some(escalation_rx)),
            escalation_tx,
            expired_rx: Mutex::new(Some(expired_rx)),
            expired_tx,
        };
        orchestrator.register_self().await?;
        Ok(orchestrator)
    }

    #[allow(clippy::async_yields_async)]
    async fn run(self: Arc<Self>) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("orchestrator");
        let this = self.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = this.shutdown_tx.subscribe();

            // Teardown walks this list front to back: stop the reaper, then
            // drain the consumers, then the rest.
            let mut tasks: Vec<(&'static str, Instrumented<JoinHandle<Result<()>>>)> = Vec::new();
            tasks.push((
                "reaper",
                LeaseReaper::new(
                    this.registry.clone(),
                    this.reaper_interval,
                    this.retention_days,
                    this.expired_tx.clone(),
                    this.shutdown_tx.subscribe(),
                )
                .spawn(),
            ));
            for topic in [
                well_known::specialist_result(&this.tenant, &this.project),
                well_known::registry_heartbeats(&this.tenant, &this.project),
            ] {
                let consumer = Consumer::new(
                    this.transport.clone(),
                    this.replay_guard.clone(),
                    this.policy.clone(),
                    this.idempotency.clone(),
                    this.handlers.clone(),
                    this.escalation_tx.clone(),
                    &this.metrics,
                    topic.clone(),
                    SubscribeOptions::new(
                        format!("{}:{}", this.group_prefix, Self::AGENT_NAME),
                        ORCHESTRATOR_AGENT_ID,
                    ),
                    this.shutdown_tx.subscribe(),
                );
                tasks.push(("consumer", consumer.spawn()));
            }
            tasks.push((
                "heartbeat",
                HeartbeatPublisher::new(
                    this.registry.clone(),
                    this.publisher.clone(),
                    ORCHESTRATOR_AGENT_ID,
                    vec!["decision-orchestration".to_string()],
                    this.heartbeat_interval,
                    this.lease_seconds,
                    this.shutdown_tx.subscribe(),
                )
                .spawn(),
            ));
            tasks.push(("escalations", this.clone().run_escalation_task().await));
            tasks.push(("expiries", this.clone().run_expiry_task().await));
            tasks.push(("health", this.clone().run_health_task()));
            tasks.push((
                "checkpoint-retention",
                this.clone().run_checkpoint_retention_task(),
            ));

            // Supervise until shutdown is requested or any task ends early.
            let mut finished = None;
            let mut first_result: Result<()> = Ok(());
            {
                let watchers = tasks.iter_mut().map(|(_, task)| task);
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    (res, index, _) = select_all(watchers) => {
                        finished = Some(index);
                        first_result = match res {
                            Ok(inner) => inner,
                            Err(e) => Err(e.into()),
                        };
                    }
                }
            }

            // Ordered teardown: signal everything, confirm completion in
            // list order, then release transport and stores.
            let _ = this.shutdown_tx.send(true);
            for (index, (name, task)) in tasks.into_iter().enumerate() {
                if Some(index) == finished {
                    continue;
                }
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(task = name, error = %e, "task ended with error"),
                    Err(e) => warn!(task = name, error = %e, "task join failed"),
                }
            }
            if let Err(e) = this.transport.disconnect().await {
                warn!(error = %e, "transport disconnect failed");
            }
            if let Err(e) = this.registry.close().await {
                warn!(error = %e, "registry close failed");
            }
            if let Err(e) = this.checkpointer.close().await {
                warn!(error = %e, "checkpointer close failed");
            }
            info!("orchestrator shut down");
            first_result
        })
        .instrument(span)
    }

    async fn shutdown(self: Arc<Self>) {
        // The run supervisor owns the ordered teardown; this only asks for
        // it. `agent_main` awaits the run handle afterwards.
        let _ = self.shutdown_tx.send(true);
    }
}

impl Orchestrator {
    /// Register the orchestrator itself and its topic roles.
    async fn register_self(&self) -> Result<()> {
        self.registry
            .register(
                AgentRecord {
                    agent_id: ORCHESTRATOR_AGENT_ID.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    tenant: self.tenant.clone(),
                    project: self.project.clone(),
                    capabilities: vec!["decision-orchestration".to_string()],
                    status: AgentStatus::Starting,
                    last_heartbeat: None,
                    lease_until: now_utc_millis(),
                    metadata: json!({}),
                },
                self.lease_seconds,
            )
            .await?;

        let subscriptions = [
            (
                well_known::specialist_result(&self.tenant, &self.project),
                TopicRole::Subscriber,
            ),
            (
                well_known::registry_heartbeats(&self.tenant, &self.project),
                TopicRole::Both,
            ),
            (
                well_known::cmo_decisions(&self.tenant, &self.project),
                TopicRole::Publisher,
            ),
            (
                well_known::cmo_escalations(&self.tenant, &self.project),
                TopicRole::Publisher,
            ),
            (
                well_known::specialist_invoke(&self.tenant, &self.project),
                TopicRole::Publisher,
            ),
        ];
        for (topic, role) in subscriptions {
            match self
                .registry
                .subscribe_topic(TopicSubscription {
                    agent_id: ORCHESTRATOR_AGENT_ID.to_string(),
                    topic: topic.name().to_string(),
                    role,
                })
                .await
            {
                Ok(()) => {}
                // Restarting over an existing registration is normal.
                Err(cmo_core::RegistryError::DuplicateTopicSubscription { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Turns terminal rejections into ESCALATE notices.
    async fn run_escalation_task(self: Arc<Self>) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("escalations");
        let mut rx = self
            .escalation_rx
            .lock()
            .await
            .take()
            .expect("run called once");
        let mut shutdown = self.shutdown_tx.subscribe();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let escalate = |event: EscalationEvent| {
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine
                        .escalate_failure(&event.envelope, vec![event.reason.clone()])
                        .await
                    {
                        warn!(error = %e, reason = %event.reason, "failed to escalate rejection");
                    }
                }
            };
            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = shutdown.changed() => break,
                };
                let Some(event) = event else { break };
                escalate(event).await;
            }
            // Drain whatever the consumers queued before they stopped; a
            // rejected task must still surface its ESCALATE notice.
            while let Ok(event) = rx.try_recv() {
                escalate(event).await;
            }
            Ok(())
        })
        .instrument(span)
    }

    /// Logs reaper expiries and keeps the registry gauge fresh.
    async fn run_expiry_task(self: Arc<Self>) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("expiries");
        let mut rx = self
            .expired_rx
            .lock()
            .await
            .take()
            .expect("run called once");
        let mut shutdown = self.shutdown_tx.subscribe();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                let expired = tokio::select! {
                    expired = rx.recv() => expired,
                    _ = shutdown.changed() => break,
                };
                let Some(expired) = expired else { break };
                info!(agents = ?expired.agent_ids, "agents marked unavailable");
                metrics
                    .registry_agents()
                    .with_label_values(&[&AgentStatus::Unavailable.to_string()])
                    .add(expired.agent_ids.len() as i64);
            }
            Ok(())
        })
        .instrument(span)
    }

    /// Removes terminal runs past the retention window once an hour.
    fn run_checkpoint_retention_task(self: Arc<Self>) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("checkpoint_retention");
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return Ok(()),
                }
                match self
                    .checkpointer
                    .cleanup_old_executions(self.checkpoint_retention_days)
                    .await
                {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "checkpoint retention removed old runs"),
                    Err(e) => warn!(error = %e, "checkpoint retention failed"),
                }
            }
        })
        .instrument(span)
    }

    /// Refreshes the health surface from component probes.
    fn run_health_task(self: Arc<Self>) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("health");
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return Ok(()),
                }
                match self.transport.health_check().await {
                    Ok(health) => self.health.set("transport", health),
                    Err(e) => self.health.set(
                        "transport",
                        cmo_core::traits::ComponentHealth::unhealthy(e.to_string()),
                    ),
                }
                let registry_health = match self.registry.get(ORCHESTRATOR_AGENT_ID).await {
                    Ok(_) => cmo_core::traits::ComponentHealth::healthy("registry reachable"),
                    Err(e) => cmo_core::traits::ComponentHealth::unhealthy(e.to_string()),
                };
                self.health.set("registry", registry_health);
                let checkpoint_health = match self.checkpointer.get_run("health-probe").await {
                    Ok(_) => cmo_core::traits::ComponentHealth::healthy("checkpointer reachable"),
                    Err(e) => cmo_core::traits::ComponentHealth::unhealthy(e.to_string()),
                };
                self.health.set("checkpointer", checkpoint_health);
            }
        })
        .instrument(span)
    }
}
