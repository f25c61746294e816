//! The decision engine: QScore grading, the three-way decision, idempotent
//! persistence, and the downstream publishes each outcome requires.

mod input;

use std::sync::Arc;

use eyre::{Result, WrapErr};
use prometheus::{HistogramVec, IntCounterVec};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use cmo_base::publisher::EnvelopePublisher;
use cmo_base::CoreMetrics;
use cmo_core::qscore::{PreviousAttempt, QScoreCalculator, QScoreResult};
use cmo_core::traits::{AgentRegistry, Checkpointer, GradingInsert, GradingStore};
use cmo_core::utils::{canonical_hash, now_utc_millis};
use cmo_core::{
    ActivityRecord, ActivityType, AgentId, Decision, DecisionNoticePayload, DiscoveryFilter,
    Envelope, ErrorReport, GradingEvent, RunRecord, RunStatus, StepRecord, TaskInvoke, TaskResult,
};

pub use input::score_input;

/// Graph identity recorded on decision-loop runs.
const GRAPH_ID: &str = "cmo-decision-loop";
const GRAPH_VERSION: &str = "1";
/// Node recorded for each grading step.
const GRADE_NODE: &str = "grade-result";

/// QScore floor for accepting a result that exhausted its retries.
const EXHAUSTED_ACCEPT_FLOOR: f64 = 0.60;

struct DecisionMetrics {
    decisions: IntCounterVec,
    qscore: HistogramVec,
}

/// Grades `TaskResult`s and drives the ACCEPT/RETRY/ESCALATE loop.
pub struct DecisionEngine {
    calculator: QScoreCalculator,
    registry: Arc<dyn AgentRegistry>,
    grading: Arc<dyn GradingStore>,
    checkpointer: Arc<dyn Checkpointer>,
    publisher: EnvelopePublisher,
    metrics: DecisionMetrics,
    accept_threshold: f64,
    max_retries: u32,
    tenant: String,
    project: String,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("accept_threshold", &self.accept_threshold)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl DecisionEngine {
    /// Wire an engine over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        calculator: QScoreCalculator,
        registry: Arc<dyn AgentRegistry>,
        grading: Arc<dyn GradingStore>,
        checkpointer: Arc<dyn Checkpointer>,
        publisher: EnvelopePublisher,
        metrics: &CoreMetrics,
        accept_threshold: f64,
        max_retries: u32,
        tenant: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            calculator,
            registry,
            grading,
            checkpointer,
            publisher,
            metrics: DecisionMetrics {
                decisions: metrics.decisions(),
                qscore: metrics.qscore(),
            },
            accept_threshold,
            max_retries,
            tenant: tenant.into(),
            project: project.into(),
        }
    }

    /// Register the decision-loop graph so runs can reference it.
    pub async fn register_graph(&self) -> Result<()> {
        self.checkpointer
            .register_graph(
                GRAPH_ID,
                GRAPH_VERSION,
                json!({ "nodes": [GRADE_NODE], "edges": [] }),
            )
            .await
            .wrap_err("registering decision graph")
    }

    /// Grade a delivered `TaskResult` envelope and perform the decision's
    /// side effects. Duplicate deliveries return the stored grading event
    /// and perform nothing.
    #[instrument(skip(self, envelope), fields(trace_id = %envelope.meta.trace_id))]
    pub async fn grade(&self, envelope: &Envelope) -> Result<GradingEvent> {
        let result: TaskResult = envelope.typed_payload()?;
        let idempotency_key = envelope.idempotency_key();

        // Fast path for redeliveries that slipped past the KV guard.
        if let Some(existing) = self.grading.get_by_idempotency_key(&idempotency_key).await? {
            debug!(%idempotency_key, "duplicate grading request, returning stored decision");
            return Ok(existing);
        }

        let previous = self.previous_attempt(&envelope.meta.trace_id, &result).await;
        let score = self.calculator.compute(&input::score_input(&result, previous));
        let (decision, reasons, retry_target) = self.decide(&score, &result).await;

        let event = GradingEvent {
            message_id: envelope.meta.message_id.clone(),
            trace_id: envelope.meta.trace_id.clone(),
            attempt_no: result.attempt_no,
            decision,
            qscore: score.calibrated,
            reasons: reasons.clone(),
            idempotency_key,
            specialist_id: result.specialist_id.clone(),
            retry_target_specialist: retry_target.clone(),
            created_at: now_utc_millis(),
        };
        match self.grading.insert_once(event.clone()).await? {
            GradingInsert::Inserted => {}
            GradingInsert::Existing(existing) => {
                debug!("concurrent duplicate grading, repeating stored decision");
                return Ok(existing);
            }
        }

        self.metrics
            .decisions
            .with_label_values(&[&decision.to_string()])
            .inc();
        self.metrics
            .qscore
            .with_label_values(&[&result.capability])
            .observe(score.calibrated);

        self.checkpoint_grading(envelope, &result, &event).await?;
        self.publish_outcome(envelope, &result, &event).await?;

        info!(
            decision = %decision,
            qscore = score.calibrated,
            attempt = result.attempt_no,
            specialist = %result.specialist_id,
            "graded task result"
        );
        Ok(event)
    }

    /// Escalate without grading: used for specialist `Error` reports and
    /// envelopes rejected after exhausting redelivery.
    #[instrument(skip(self, envelope), fields(trace_id = %envelope.meta.trace_id))]
    pub async fn escalate_failure(
        &self,
        envelope: &Envelope,
        mut reasons: Vec<String>,
    ) -> Result<Option<GradingEvent>> {
        let idempotency_key = envelope.idempotency_key();
        if reasons.is_empty() {
            reasons.push("unspecified failure".to_string());
        }
        let event = GradingEvent {
            message_id: envelope.meta.message_id.clone(),
            trace_id: envelope.meta.trace_id.clone(),
            attempt_no: 0,
            decision: Decision::Escalate,
            qscore: 0.0,
            reasons: reasons.clone(),
            idempotency_key,
            specialist_id: envelope.meta.from.id.clone(),
            retry_target_specialist: None,
            created_at: now_utc_millis(),
        };
        match self.grading.insert_once(event.clone()).await? {
            GradingInsert::Existing(_) => return Ok(None),
            GradingInsert::Inserted => {}
        }
        self.metrics
            .decisions
            .with_label_values(&[&Decision::Escalate.to_string()])
            .inc();
        self.publisher
            .publish_decision_notice(
                envelope.meta.trace_id.clone(),
                &DecisionNoticePayload {
                    decision: Decision::Escalate,
                    qscore: 0.0,
                    reasons,
                    specialist_id: event.specialist_id.clone(),
                    attempt_no: event.attempt_no,
                    retry_target_specialist: None,
                },
                true,
            )
            .await?;
        Ok(Some(event))
    }

    /// Escalation payload for a specialist error report.
    pub async fn escalate_error_report(&self, envelope: &Envelope) -> Result<()> {
        let report: ErrorReport = envelope.typed_payload()?;
        self.escalate_failure(
            envelope,
            vec![report.code.clone(), report.message.clone()],
        )
        .await?;
        Ok(())
    }

    /// The three-way policy. Returns the decision, its reasons, and the
    /// retry target when one was selected.
    async fn decide(
        &self,
        score: &QScoreResult,
        result: &TaskResult,
    ) -> (Decision, Vec<String>, Option<String>) {
        let calibrated = score.calibrated;
        let retry_depth = result.attempt_no;
        let mut reasons = vec![score.explanation.clone()];
        if score.signals.policy == 0.0 {
            reasons.push("policy_degraded".to_string());
        }
        if score.signals.schema == 0.0 {
            reasons.push("schema_invalid".to_string());
        }

        // A policy or schema failure that survived a retry is never
        // accepted, whatever the fused score says.
        let hard_failure = score.signals.policy == 0.0 || score.signals.schema == 0.0;
        if hard_failure && retry_depth >= 1 {
            reasons.push("hard failure persisted after retry".to_string());
            return (Decision::Escalate, reasons, None);
        }

        if calibrated >= self.accept_threshold {
            reasons.push(format!(
                "calibrated {calibrated:.3} >= threshold {:.2}",
                self.accept_threshold
            ));
            return (Decision::Accept, reasons, None);
        }
        if calibrated >= EXHAUSTED_ACCEPT_FLOOR && retry_depth >= self.max_retries {
            reasons.push(format!(
                "retries exhausted; calibrated {calibrated:.3} >= floor {EXHAUSTED_ACCEPT_FLOOR:.2}"
            ));
            return (Decision::Accept, reasons, None);
        }

        if retry_depth < self.max_retries {
            match self.select_retry_target(result).await {
                Some(target) => {
                    reasons.push(format!(
                        "calibrated {calibrated:.3} below threshold, retrying on {target}"
                    ));
                    return (Decision::Retry, reasons, Some(target));
                }
                None => {
                    reasons.push(format!(
                        "no retry target with capability `{}`",
                        result.capability
                    ));
                    return (Decision::Escalate, reasons, None);
                }
            }
        }

        reasons.push(format!(
            "calibrated {calibrated:.3} below threshold after {retry_depth} retries"
        ));
        (Decision::Escalate, reasons, None)
    }

    /// A live specialist with the required capability, other than the one
    /// that just failed.
    async fn select_retry_target(&self, result: &TaskResult) -> Option<String> {
        let filter = DiscoveryFilter::new(&self.tenant, &self.project)
            .with_capability(&result.capability);
        let candidates = match self.registry.discover(&filter).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "retry-target discovery failed");
                return None;
            }
        };
        candidates
            .into_iter()
            .map(|agent| agent.agent_id)
            .find(|id| id != &result.specialist_id)
    }

    /// Journal the grading cycle: run, step, and the attempt's keyword
    /// context as an a2a activity for the consistency signal.
    async fn checkpoint_grading(
        &self,
        envelope: &Envelope,
        result: &TaskResult,
        event: &GradingEvent,
    ) -> Result<()> {
        let trace_id = &envelope.meta.trace_id;
        let started_at = now_utc_millis();
        self.checkpointer
            .begin_run(RunRecord {
                trace_id: trace_id.clone(),
                graph_id: GRAPH_ID.to_string(),
                graph_version: GRAPH_VERSION.to_string(),
                status: RunStatus::Running,
                started_at,
                completed_at: None,
                error: None,
                metadata: json!({ "capability": result.capability }),
            })
            .await?;

        let attempt_context = json!({
            "summary_keywords": input::summary_keywords(result),
            "affordance_actions": input::affordance_actions(result),
        });
        let outcome = json!({
            "decision": event.decision,
            "qscore": event.qscore,
        });
        self.checkpointer
            .record_step(StepRecord {
                trace_id: trace_id.clone(),
                step_index: result.attempt_no as i32,
                node_id: GRADE_NODE.to_string(),
                state_hash: canonical_hash(&outcome),
                input_hash: canonical_hash(&envelope.payload),
                output_hash: canonical_hash(&serde_json::to_value(event)?),
                next_edge: match event.decision {
                    Decision::Retry => Some("retry".to_string()),
                    Decision::Accept => Some("accept".to_string()),
                    Decision::Escalate => Some("escalate".to_string()),
                },
                started_at,
                duration_ms: Some(result.metadata.latency_ms as i64),
                error: None,
            })
            .await?;
        self.checkpointer
            .record_activity(ActivityRecord {
                trace_id: trace_id.clone(),
                step_index: result.attempt_no as i32,
                activity_type: ActivityType::A2a,
                request_hash: canonical_hash(&attempt_context),
                request_data: attempt_context,
                response_data: Some(outcome),
                response_blob_ref: None,
                timestamp: started_at,
                duration_ms: Some(result.metadata.latency_ms as i64),
                error: None,
            })
            .await?;

        match event.decision {
            Decision::Accept => {
                self.checkpointer
                    .complete_run(trace_id, RunStatus::Completed, None)
                    .await?;
            }
            Decision::Escalate => {
                self.checkpointer
                    .complete_run(trace_id, RunStatus::Failed, Some(event.reasons.join("; ")))
                    .await?;
            }
            Decision::Retry => {}
        }
        Ok(())
    }

    /// Publish the decision notice and, on RETRY, the next `TaskInvoke`.
    async fn publish_outcome(
        &self,
        envelope: &Envelope,
        result: &TaskResult,
        event: &GradingEvent,
    ) -> Result<()> {
        self.publisher
            .publish_decision_notice(
                envelope.meta.trace_id.clone(),
                &DecisionNoticePayload {
                    decision: event.decision,
                    qscore: event.qscore,
                    reasons: event.reasons.clone(),
                    specialist_id: event.specialist_id.clone(),
                    attempt_no: event.attempt_no,
                    retry_target_specialist: event.retry_target_specialist.clone(),
                },
                event.decision == Decision::Escalate,
            )
            .await?;

        if let (Decision::Retry, Some(target)) =
            (event.decision, event.retry_target_specialist.clone())
        {
            self.publisher
                .publish_task_invoke(
                    AgentId::agent(target),
                    Some(envelope.meta.trace_id.clone()),
                    &TaskInvoke {
                        task: result.task.clone(),
                        capability: result.capability.clone(),
                        inputs: json!({}),
                        attempt_no: result.attempt_no + 1,
                        summary_hint: None,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Keyword context of the previous attempt, recovered from the journal.
    async fn previous_attempt(
        &self,
        trace_id: &str,
        result: &TaskResult,
    ) -> Option<PreviousAttempt> {
        if result.attempt_no == 0 {
            return None;
        }
        let replay = self.checkpointer.replay(trace_id).await.ok()?;
        let previous_index = result.attempt_no as i32 - 1;
        let activity = replay
            .iter()
            .find(|sr| sr.step.step_index == previous_index)?
            .activities
            .iter()
            .find(|a| a.activity_type == ActivityType::A2a)?;
        serde_json::from_value(activity.request_data.clone()).ok()
    }
}
