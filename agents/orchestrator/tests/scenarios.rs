//! End-to-end decision-loop scenarios over the in-memory transport and
//! stores: the full consume -> verify -> gate -> grade -> decide -> publish
//! pipeline, without a broker or database.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use cmo_base::create_metrics;
use cmo_base::middleware::{IdempotencyGuard, MemoryIdempotencyStore, PolicyChain, TenantScopePolicy};
use cmo_base::publisher::EnvelopePublisher;
use cmo_base::security::{EnvelopeSigner, ReplayGuard};
use cmo_base::testing::{MemoryCheckpointer, MemoryGradingStore, MemoryRegistry};
use cmo_base::transport::InMemoryTransport;
use cmo_core::qscore::{CalibrationTable, QScoreCalculator, QScoreWeights};
use cmo_core::traits::{AgentRegistry, Checkpointer, GradingStore, SubscribeOptions, Transport};
use cmo_core::utils::format_timestamp;
use cmo_core::{
    well_known, Affordance, AgentId, AgentRecord, AgentStatus, Decision, DiscoveryFilter,
    Envelope, MessageType, ResultMetadata, SlicingReport, SummaryItem, TaskInvoke, TaskResult,
    TopicRole, TopicSubscription,
};
use orchestrator::{
    Consumer, DecisionEngine, ErrorReportHandler, EscalationEvent, HandlerRegistry,
    HeartbeatHandler, MemoryEventHandler, TaskResultHandler,
};

const TENANT: &str = "wesign";
const PROJECT: &str = "webapp";
const SECRET: &str = "envelope-secret";
const CAPABILITY: &str = "selector-extraction";

struct Harness {
    transport: Arc<InMemoryTransport>,
    registry: Arc<MemoryRegistry>,
    checkpointer: Arc<MemoryCheckpointer>,
    grading: Arc<MemoryGradingStore>,
    signer: EnvelopeSigner,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    async fn new() -> Self {
        let transport = Arc::new(InMemoryTransport::new());
        transport.connect().await.unwrap();
        let registry = MemoryRegistry::new();
        let checkpointer = MemoryCheckpointer::new();
        let grading = MemoryGradingStore::new();
        let metrics = create_metrics("orchestrator-test", 0).unwrap();
        let signer = EnvelopeSigner::new(SECRET);

        let publisher = EnvelopePublisher::new(
            transport.clone() as Arc<dyn Transport>,
            signer.clone(),
            AgentId::service("cmo-orchestrator"),
            TENANT,
            PROJECT,
        );
        let engine = Arc::new(DecisionEngine::new(
            QScoreCalculator::new(QScoreWeights::default(), CalibrationTable::identity()).unwrap(),
            registry.clone() as Arc<dyn AgentRegistry>,
            grading.clone() as Arc<dyn GradingStore>,
            checkpointer.clone() as Arc<dyn Checkpointer>,
            publisher,
            &metrics,
            0.75,
            2,
            TENANT,
            PROJECT,
        ));

        let handlers = Arc::new(
            HandlerRegistry::new()
                .register(
                    MessageType::TaskResult,
                    Arc::new(TaskResultHandler::new(engine.clone())),
                )
                .register(
                    MessageType::Heartbeat,
                    Arc::new(HeartbeatHandler::new(
                        registry.clone() as Arc<dyn AgentRegistry>,
                        60,
                    )),
                )
                .register(MessageType::MemoryEvent, Arc::new(MemoryEventHandler))
                .register(
                    MessageType::Error,
                    Arc::new(ErrorReportHandler::new(engine.clone())),
                ),
        );
        let (escalation_tx, mut escalation_rx) = mpsc::unbounded_channel::<EscalationEvent>();
        // Glue task: terminal rejections become ESCALATE notices.
        {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(event) = escalation_rx.recv().await {
                    let _ = engine
                        .escalate_failure(
                            &event.envelope,
                            vec![event.reason.clone()],
                        )
                        .await;
                }
            });
        }

        // One consumer per subscribed topic, as in the real agent.
        let (shutdown_tx, _) = watch::channel(false);
        let idempotency = IdempotencyGuard::new(MemoryIdempotencyStore::new());
        let policy = Arc::new(PolicyChain::new().with(TenantScopePolicy::new(TENANT, PROJECT)));
        for topic in [
            well_known::specialist_result(TENANT, PROJECT),
            well_known::registry_heartbeats(TENANT, PROJECT),
        ] {
            let consumer = Consumer::new(
                transport.clone() as Arc<dyn Transport>,
                ReplayGuard::default().with_signer(signer.clone()),
                policy.clone(),
                idempotency.clone(),
                handlers.clone(),
                escalation_tx.clone(),
                &metrics,
                topic,
                SubscribeOptions::new("cmo:orchestrator", "cmo-orchestrator"),
                shutdown_tx.subscribe(),
            );
            consumer.spawn();
        }

        Self {
            transport,
            registry,
            checkpointer,
            grading,
            signer,
            shutdown_tx,
        }
    }

    async fn register_specialist(&self, agent_id: &str) {
        self.registry
            .register(
                AgentRecord {
                    agent_id: agent_id.to_string(),
                    version: "1.0.0".into(),
                    tenant: TENANT.into(),
                    project: PROJECT.into(),
                    capabilities: vec![CAPABILITY.to_string()],
                    status: AgentStatus::Starting,
                    last_heartbeat: None,
                    lease_until: time::OffsetDateTime::now_utc(),
                    metadata: serde_json::json!({}),
                },
                60,
            )
            .await
            .unwrap();
        self.registry
            .heartbeat(agent_id, AgentStatus::Healthy, 60)
            .await
            .unwrap();
    }

    fn result_envelope(&self, trace_id: &str, result: &TaskResult) -> Envelope {
        let mut envelope = Envelope::with_trace(
            MessageType::TaskResult,
            AgentId::agent(result.specialist_id.clone()),
            vec![AgentId::service("cmo-orchestrator")],
            TENANT,
            PROJECT,
            trace_id.to_string(),
            cmo_core::utils::new_message_id(),
            result,
        )
        .unwrap();
        self.signer.sign(&mut envelope).unwrap();
        envelope
    }

    async fn deliver_result(&self, trace_id: &str, result: &TaskResult) -> Envelope {
        let envelope = self.result_envelope(trace_id, result);
        self.transport
            .publish(&well_known::specialist_result(TENANT, PROJECT), &envelope)
            .await
            .unwrap();
        envelope
    }

    /// Wait until `topic` has accumulated `count` appended entries.
    async fn await_appended(&self, topic: &cmo_core::Topic, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.transport.appended(topic).await >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} entries on {topic}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn await_grading_events(&self, trace_id: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.grading.events_for_trace(trace_id).await.unwrap().len() >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} grading events"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn strong_result(specialist: &str, attempt_no: u32) -> TaskResult {
    TaskResult {
        task: "extract login selectors".into(),
        capability: CAPABILITY.into(),
        specialist_id: specialist.into(),
        attempt_no,
        summary: vec![
            SummaryItem { text: "Found login form".into() },
            SummaryItem { text: "Located submit button".into() },
            SummaryItem { text: "Captured field names".into() },
            SummaryItem { text: "Resolved frame path".into() },
            SummaryItem { text: "Verified selectors unique".into() },
            SummaryItem { text: "Recorded fallback selectors".into() },
        ],
        affordances: vec![
            Affordance { action: "click".into(), text: "login submit button".into() },
            Affordance { action: "fill".into(), text: "login username field".into() },
        ],
        slicing: SlicingReport { policy_degraded: false },
        metadata: ResultMetadata { schema_valid: true, latency_ms: 350 },
    }
}

fn weak_result(specialist: &str, attempt_no: u32) -> TaskResult {
    TaskResult {
        task: "extract login selectors".into(),
        capability: CAPABILITY.into(),
        specialist_id: specialist.into(),
        attempt_no,
        summary: vec![SummaryItem { text: "Partial output".into() }],
        affordances: vec![
            Affordance { action: "click".into(), text: "unknown".into() },
            Affordance { action: "scroll".into(), text: "unknown".into() },
            Affordance { action: "hover".into(), text: "unknown".into() },
        ],
        slicing: SlicingReport { policy_degraded: false },
        metadata: ResultMetadata { schema_valid: false, latency_ms: 900 },
    }
}

// S1: a strong first-attempt result is accepted and produces exactly one
// decision notice on the decisions topic.
#[tokio::test]
async fn happy_path_accept() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-sel").await;

    let envelope = harness
        .deliver_result("trace-s1", &strong_result("specialist-sel", 0))
        .await;
    harness.await_grading_events("trace-s1", 1).await;

    let events = harness.grading.events_for_trace("trace-s1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision, Decision::Accept);
    assert!(events[0].qscore >= 0.75, "qscore = {}", events[0].qscore);
    assert_eq!(events[0].message_id, envelope.meta.message_id);

    harness
        .await_appended(&well_known::cmo_decisions(TENANT, PROJECT), 1)
        .await;
    assert_eq!(
        harness
            .transport
            .appended(&well_known::cmo_escalations(TENANT, PROJECT))
            .await,
        0
    );

    // The run completed and its single grading step checkpointed.
    let run = harness.checkpointer.get_run("trace-s1").await.unwrap().unwrap();
    assert_eq!(run.status, cmo_core::RunStatus::Completed);
    let replay = harness.checkpointer.replay("trace-s1").await.unwrap();
    assert_eq!(replay.len(), 1);
    assert_eq!(replay[0].activities.len(), 1);
}

// S2: a weak result retries on a different specialist with the same trace
// and an incremented attempt number.
#[tokio::test]
async fn retry_selects_a_different_specialist() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-a").await;
    harness.register_specialist("specialist-b").await;

    harness
        .deliver_result("trace-s2", &weak_result("specialist-a", 0))
        .await;
    harness.await_grading_events("trace-s2", 1).await;

    let events = harness.grading.events_for_trace("trace-s2").await.unwrap();
    assert_eq!(events[0].decision, Decision::Retry);
    assert_eq!(
        events[0].retry_target_specialist.as_deref(),
        Some("specialist-b")
    );

    // Exactly one new TaskInvoke went out; its contents are checked in
    // `retry_invoke_addresses_single_recipient`.
    let invoke_topic = well_known::specialist_invoke(TENANT, PROJECT);
    harness.await_appended(&invoke_topic, 1).await;
    assert_eq!(harness.transport.appended(&invoke_topic).await, 1);
}

// S3: a policy failure that persists into the retry escalates, with the
// reason recorded, and no further TaskInvoke is published.
#[tokio::test]
async fn repeated_policy_failure_escalates() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-a").await;
    harness.register_specialist("specialist-b").await;

    let mut first = weak_result("specialist-a", 0);
    first.slicing.policy_degraded = true;
    first.metadata.schema_valid = true;
    harness.deliver_result("trace-s3", &first).await;
    harness.await_grading_events("trace-s3", 1).await;

    let invoke_topic = well_known::specialist_invoke(TENANT, PROJECT);
    harness.await_appended(&invoke_topic, 1).await;

    let mut second = weak_result("specialist-b", 1);
    second.slicing.policy_degraded = true;
    second.metadata.schema_valid = true;
    harness.deliver_result("trace-s3", &second).await;
    harness.await_grading_events("trace-s3", 2).await;

    let events = harness.grading.events_for_trace("trace-s3").await.unwrap();
    assert_eq!(events[1].decision, Decision::Escalate);
    assert!(events[1].reasons.iter().any(|r| r == "policy_degraded"));

    harness
        .await_appended(&well_known::cmo_escalations(TENANT, PROJECT), 1)
        .await;
    // No third attempt was dispatched.
    assert_eq!(harness.transport.appended(&invoke_topic).await, 1);
}

// S4: a redelivered TaskResult envelope is dropped by the idempotency
// guard; exactly one grading event and one notice exist.
#[tokio::test]
async fn duplicate_delivery_is_dropped() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-sel").await;

    let result = strong_result("specialist-sel", 0);
    let envelope = harness.result_envelope("trace-s4", &result);
    let topic = well_known::specialist_result(TENANT, PROJECT);
    harness.transport.publish(&topic, &envelope).await.unwrap();
    harness.transport.publish(&topic, &envelope).await.unwrap();

    harness.await_grading_events("trace-s4", 1).await;
    // Give the duplicate time to traverse the pipeline.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        harness.grading.events_for_trace("trace-s4").await.unwrap().len(),
        1
    );
    assert_eq!(
        harness
            .transport
            .appended(&well_known::cmo_decisions(TENANT, PROJECT))
            .await,
        1
    );
    let stats = harness.transport.stats().await.unwrap();
    assert_eq!(stats.acked, 2, "both deliveries settle");
}

// S5: a stale timestamp rejects to the DLQ before any handler runs.
#[tokio::test]
async fn stale_timestamp_rejects_to_dlq() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-sel").await;

    let mut envelope = harness.result_envelope("trace-s5", &strong_result("specialist-sel", 0));
    envelope.meta.ts =
        format_timestamp(time::OffsetDateTime::now_utc() - time::Duration::minutes(10));
    // Re-sign so only the timestamp, not the signature, is at fault.
    harness.signer.sign(&mut envelope).unwrap();

    let topic = well_known::specialist_result(TENANT, PROJECT);
    harness.transport.publish(&topic, &envelope).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let reasons = harness.transport.dlq_reasons(&topic).await;
        if !reasons.is_empty() {
            assert_eq!(reasons, vec!["timestamp_stale".to_string()]);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no DLQ rejection");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The grading pipeline never saw it; the rejection escalated instead.
    let events = harness.grading.events_for_trace("trace-s5").await.unwrap();
    assert!(events.iter().all(|e| e.decision == Decision::Escalate));
}

// S6: leases expire via the reaper, discovery excludes the agent, and
// retention cleanup removes the row.
#[tokio::test]
async fn lease_expiry_and_cleanup() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-sel").await;

    let filter = DiscoveryFilter::new(TENANT, PROJECT).with_capability(CAPABILITY);
    assert_eq!(harness.registry.discover(&filter).await.unwrap().len(), 1);

    // One reaper sweep past the lease horizon.
    let future = time::OffsetDateTime::now_utc() + time::Duration::seconds(61);
    let expired = harness.registry.mark_expired_agents(future).await.unwrap();
    assert_eq!(expired, vec!["specialist-sel".to_string()]);

    assert!(harness.registry.discover(&filter).await.unwrap().is_empty());
    let record = harness.registry.get("specialist-sel").await.unwrap().unwrap();
    assert_eq!(record.status, AgentStatus::Unavailable);

    // Retention cleanup with a zero-day window removes it immediately.
    let removed = harness.registry.cleanup_inactive_agents(0).await.unwrap();
    assert_eq!(removed, 1);
    assert!(harness.registry.get("specialist-sel").await.unwrap().is_none());
}

// Registry round-trip laws beyond S6.
#[tokio::test]
async fn registry_round_trip_laws() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-sel").await;

    let filter = DiscoveryFilter::new(TENANT, PROJECT);
    let discovered = harness.registry.discover(&filter).await.unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].status, AgentStatus::Healthy);

    harness
        .registry
        .mark_unavailable("specialist-sel")
        .await
        .unwrap();
    assert!(harness.registry.discover(&filter).await.unwrap().is_empty());

    // Duplicate topic subscriptions are rejected.
    let subscription = TopicSubscription {
        agent_id: "specialist-sel".into(),
        topic: well_known::specialist_result(TENANT, PROJECT).name().into(),
        role: TopicRole::Subscriber,
    };
    harness
        .registry
        .subscribe_topic(subscription.clone())
        .await
        .unwrap();
    assert!(matches!(
        harness.registry.subscribe_topic(subscription).await,
        Err(cmo_core::RegistryError::DuplicateTopicSubscription { .. })
    ));
}

// A heartbeat from a registered specialist lands in the registry: status
// applied, lease extended monotonically.
#[tokio::test]
async fn heartbeat_updates_registered_specialist() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-sel").await;
    let before = harness.registry.get("specialist-sel").await.unwrap().unwrap();

    let mut envelope = Envelope::new(
        MessageType::Heartbeat,
        AgentId::agent("specialist-sel"),
        vec![AgentId::service("cmo-orchestrator")],
        TENANT,
        PROJECT,
        &cmo_core::HeartbeatPayload {
            agent_id: "specialist-sel".into(),
            status: AgentStatus::Degraded,
            capabilities: vec![CAPABILITY.into()],
        },
    )
    .unwrap();
    harness.signer.sign(&mut envelope).unwrap();
    harness
        .transport
        .publish(&well_known::registry_heartbeats(TENANT, PROJECT), &envelope)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = harness.registry.get("specialist-sel").await.unwrap().unwrap();
        if record.status == AgentStatus::Degraded {
            assert!(record.lease_until >= before.lease_until);
            assert!(record.last_heartbeat.is_some());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "heartbeat never reached the registry"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// A heartbeat from an agent that never registered fails the registry
// contract; redelivery exhausts and the envelope rejects to the DLQ.
#[tokio::test]
async fn unregistered_heartbeat_rejects_to_dlq() {
    let harness = Harness::new().await;

    let mut envelope = Envelope::new(
        MessageType::Heartbeat,
        AgentId::agent("ghost"),
        vec![AgentId::service("cmo-orchestrator")],
        TENANT,
        PROJECT,
        &cmo_core::HeartbeatPayload {
            agent_id: "ghost".into(),
            status: AgentStatus::Healthy,
            capabilities: vec![],
        },
    )
    .unwrap();
    harness.signer.sign(&mut envelope).unwrap();
    let topic = well_known::registry_heartbeats(TENANT, PROJECT);
    harness.transport.publish(&topic, &envelope).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let reasons = harness.transport.dlq_reasons(&topic).await;
        if !reasons.is_empty() {
            assert_eq!(reasons, vec!["handler_failed".to_string()]);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "unregistered heartbeat never rejected"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The failure never registered the agent, and heartbeats are not task
    // traffic, so nothing escalated.
    assert!(harness.registry.get("ghost").await.unwrap().is_none());
    assert_eq!(
        harness
            .transport
            .appended(&well_known::cmo_escalations(TENANT, PROJECT))
            .await,
        0
    );
}

// After the shutdown signal the consumers drain and stop pulling work.
#[tokio::test]
async fn consumers_drain_on_shutdown() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-sel").await;

    harness.shutdown_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness
        .deliver_result("trace-drain", &strong_result("specialist-sel", 0))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness
        .grading
        .events_for_trace("trace-drain")
        .await
        .unwrap()
        .is_empty());
}

// An Error envelope from a specialist escalates with its code in the
// reasons.
#[tokio::test]
async fn error_report_escalates() {
    let harness = Harness::new().await;
    let mut envelope = Envelope::with_trace(
        MessageType::Error,
        AgentId::agent("specialist-sel"),
        vec![AgentId::service("cmo-orchestrator")],
        TENANT,
        PROJECT,
        "trace-err".to_string(),
        cmo_core::utils::new_message_id(),
        &cmo_core::ErrorReport {
            code: "browser_crashed".into(),
            message: "target page crashed".into(),
            retryable: false,
        },
    )
    .unwrap();
    harness.signer.sign(&mut envelope).unwrap();
    harness
        .transport
        .publish(&well_known::specialist_result(TENANT, PROJECT), &envelope)
        .await
        .unwrap();

    harness.await_grading_events("trace-err", 1).await;
    let events = harness.grading.events_for_trace("trace-err").await.unwrap();
    assert_eq!(events[0].decision, Decision::Escalate);
    assert!(events[0].reasons.iter().any(|r| r == "browser_crashed"));
    harness
        .await_appended(&well_known::cmo_escalations(TENANT, PROJECT), 1)
        .await;
}

// A TaskInvoke republished on retry keeps the trace and targets only the
// selected specialist.
#[tokio::test]
async fn retry_invoke_addresses_single_recipient() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-a").await;
    harness.register_specialist("specialist-b").await;

    // Subscribe before publishing so the group sees the invoke.
    let invoke_topic = well_known::specialist_invoke(TENANT, PROJECT);
    let mut invokes = harness
        .transport
        .subscribe(&invoke_topic, SubscribeOptions::new("test:specialists", "s1"))
        .await
        .unwrap();

    harness
        .deliver_result("trace-retry", &weak_result("specialist-a", 0))
        .await;

    let delivery = tokio::time::timeout(Duration::from_secs(5), invokes.deliveries.recv())
        .await
        .expect("retry invoke published")
        .expect("subscription open");
    assert_eq!(delivery.envelope.meta.kind, MessageType::TaskInvoke);
    assert_eq!(delivery.envelope.meta.trace_id, "trace-retry");
    assert_eq!(
        delivery.envelope.meta.to,
        vec![AgentId::agent("specialist-b")]
    );
    let invoke: TaskInvoke = delivery.envelope.typed_payload().unwrap();
    assert_eq!(invoke.attempt_no, 1);
    assert_eq!(invoke.capability, CAPABILITY);
}

// Duplicate checkpoint activities deduplicate silently.
#[tokio::test]
async fn checkpoint_activity_dedupe() {
    let harness = Harness::new().await;
    harness.register_specialist("specialist-sel").await;
    harness
        .deliver_result("trace-ck", &strong_result("specialist-sel", 0))
        .await;
    harness.await_grading_events("trace-ck", 1).await;

    let replay = harness.checkpointer.replay("trace-ck").await.unwrap();
    let activity = replay[0].activities[0].clone();
    // Re-recording the identical activity is a no-op.
    assert!(!harness.checkpointer.record_activity(activity).await.unwrap());
    assert_eq!(
        harness.checkpointer.replay("trace-ck").await.unwrap()[0]
            .activities
            .len(),
        1
    );
}
