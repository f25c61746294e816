use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    is_valid_identifier, utils, AgentId, AgentStatus, Decision, ValidationError,
};

/// Protocol version carried by every envelope.
pub const A2A_VERSION: &str = "1.0";

/// The eight recognized envelope types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
pub enum MessageType {
    /// Ask a specialist to perform a task.
    TaskInvoke,
    /// A specialist's result for a prior invocation.
    TaskResult,
    /// The orchestrator's ACCEPT/RETRY/ESCALATE outcome.
    DecisionNotice,
    /// Durable memory-fabric event.
    MemoryEvent,
    /// Context lookup request.
    ContextRequest,
    /// Context lookup response.
    ContextResult,
    /// Registry liveness beacon.
    Heartbeat,
    /// Error report from a peer.
    Error,
}

/// Envelope metadata. Field names are the wire names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    /// Protocol version, always [`A2A_VERSION`].
    pub a2a_version: String,
    /// 128-bit random id, lowercase hex. Globally unique.
    pub message_id: String,
    /// Correlation across retries; stable through a decision cycle.
    pub trace_id: String,
    /// Links a response to its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// RFC 3339 UTC timestamp with millisecond precision.
    pub ts: String,
    /// Producer identity.
    pub from: AgentId,
    /// Recipients; never empty.
    pub to: Vec<AgentId>,
    /// Tenant routing scope.
    pub tenant: String,
    /// Project routing scope.
    pub project: String,
    /// Envelope type; selects the payload schema.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// `SHA-256(trace_id:message_id:ts:from.id)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Lowercase hex HMAC over the canonical envelope, signature excluded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The typed wire unit: meta plus a type-dependent payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing, identity and integrity metadata.
    pub meta: EnvelopeMeta,
    /// Payload; schema depends on `meta.type`.
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope with fresh ids and the current timestamp.
    ///
    /// The idempotency key is derived immediately; the signature is attached
    /// later by the security kit.
    pub fn new<P: Serialize>(
        kind: MessageType,
        from: AgentId,
        to: Vec<AgentId>,
        tenant: impl Into<String>,
        project: impl Into<String>,
        payload: &P,
    ) -> Result<Self, ValidationError> {
        let message_id = utils::new_message_id();
        let trace_id = utils::new_trace_id();
        Self::with_trace(kind, from, to, tenant, project, trace_id, message_id, payload)
    }

    /// Build an envelope continuing an existing trace.
    #[allow(clippy::too_many_arguments)]
    pub fn with_trace<P: Serialize>(
        kind: MessageType,
        from: AgentId,
        to: Vec<AgentId>,
        tenant: impl Into<String>,
        project: impl Into<String>,
        trace_id: String,
        message_id: String,
        payload: &P,
    ) -> Result<Self, ValidationError> {
        let ts = utils::format_timestamp(utils::now_utc_millis());
        let idempotency_key =
            utils::derive_idempotency_key(&trace_id, &message_id, &ts, &from.id);
        let payload = serde_json::to_value(payload)
            .map_err(|e| ValidationError::at("payload", e.to_string()))?;
        let envelope = Envelope {
            meta: EnvelopeMeta {
                a2a_version: A2A_VERSION.to_string(),
                message_id,
                trace_id,
                correlation_id: None,
                ts,
                from,
                to,
                tenant: tenant.into(),
                project: project.into(),
                kind,
                idempotency_key: Some(idempotency_key),
                signature: None,
            },
            payload,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate meta fields and the payload against the type's schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let meta = &self.meta;
        if meta.a2a_version != A2A_VERSION {
            return Err(ValidationError::at(
                "meta.a2a_version",
                format!("expected `{A2A_VERSION}`, found `{}`", meta.a2a_version),
            ));
        }
        if meta.message_id.len() != 32 || !meta.message_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ValidationError::at(
                "meta.message_id",
                "must be 32 lowercase hex characters",
            ));
        }
        if meta.trace_id.is_empty() {
            return Err(ValidationError::at("meta.trace_id", "must be non-empty"));
        }
        utils::parse_timestamp(&meta.ts)
            .map_err(|_| ValidationError::at("meta.ts", "must be RFC 3339 UTC"))?;
        meta.from.validate("meta.from")?;
        if meta.to.is_empty() {
            return Err(ValidationError::at("meta.to", "must be non-empty"));
        }
        for (i, recipient) in meta.to.iter().enumerate() {
            recipient.validate(&format!("meta.to[{i}]"))?;
        }
        if !is_valid_identifier(&meta.tenant) {
            return Err(ValidationError::at("meta.tenant", "must be [a-z0-9_-]+"));
        }
        if !is_valid_identifier(&meta.project) {
            return Err(ValidationError::at("meta.project", "must be [a-z0-9_-]+"));
        }
        validate_payload(meta.kind, &self.payload)
    }

    /// Deserialize the payload as the typed schema for `meta.type`.
    pub fn typed_payload<P: DeserializeOwned>(&self) -> Result<P, ValidationError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ValidationError::at("payload", e.to_string()))
    }

    /// The idempotency key, deriving it when the producer left it unset.
    pub fn idempotency_key(&self) -> String {
        self.meta.idempotency_key.clone().unwrap_or_else(|| {
            utils::derive_idempotency_key(
                &self.meta.trace_id,
                &self.meta.message_id,
                &self.meta.ts,
                &self.meta.from.id,
            )
        })
    }
}

fn check_payload<P: DeserializeOwned>(payload: &Value) -> Result<(), ValidationError> {
    serde_json::from_value::<P>(payload.clone())
        .map(|_| ())
        .map_err(|e| ValidationError::at("payload", e.to_string()))
}

/// Check `payload` against the schema of `kind`.
pub fn validate_payload(kind: MessageType, payload: &Value) -> Result<(), ValidationError> {
    match kind {
        MessageType::TaskInvoke => check_payload::<TaskInvoke>(payload),
        MessageType::TaskResult => check_payload::<TaskResult>(payload),
        MessageType::DecisionNotice => check_payload::<DecisionNoticePayload>(payload),
        MessageType::MemoryEvent => check_payload::<MemoryEvent>(payload),
        MessageType::ContextRequest => check_payload::<ContextRequest>(payload),
        MessageType::ContextResult => check_payload::<ContextResult>(payload),
        MessageType::Heartbeat => check_payload::<HeartbeatPayload>(payload),
        MessageType::Error => check_payload::<ErrorReport>(payload),
    }
}

/// Ask a specialist to perform a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvoke {
    /// Task description handed to the specialist.
    pub task: String,
    /// Capability required to execute the task.
    pub capability: String,
    /// Structured task inputs.
    #[serde(default)]
    pub inputs: Value,
    /// 0 on first dispatch; incremented by the decision engine on RETRY.
    #[serde(default)]
    pub attempt_no: u32,
    /// Optional hint about the expected result shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_hint: Option<String>,
}

/// One summary line of a specialist result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryItem {
    /// Summary text.
    pub text: String,
}

/// One affordance surfaced by a specialist result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affordance {
    /// Action the affordance suggests.
    pub action: String,
    /// Supporting text.
    #[serde(default)]
    pub text: String,
}

/// Policy slicing report attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SlicingReport {
    /// True when the specialist had to degrade a policy to produce output.
    #[serde(default)]
    pub policy_degraded: bool,
}

/// Validation metadata attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Whether the result conformed to the task's output schema.
    pub schema_valid: bool,
    /// End-to-end specialist latency.
    pub latency_ms: u64,
}

/// A specialist's result for a prior [`TaskInvoke`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task description echoed from the invocation.
    pub task: String,
    /// Capability that produced the result.
    pub capability: String,
    /// The specialist that executed the task.
    pub specialist_id: String,
    /// Attempt number echoed from the invocation.
    #[serde(default)]
    pub attempt_no: u32,
    /// Result summary items.
    #[serde(default)]
    pub summary: Vec<SummaryItem>,
    /// Affordances surfaced by the specialist.
    #[serde(default)]
    pub affordances: Vec<Affordance>,
    /// Policy slicing report.
    #[serde(default)]
    pub slicing: SlicingReport,
    /// Validation metadata.
    pub metadata: ResultMetadata,
}

/// Outcome notice published by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNoticePayload {
    /// The three-way decision.
    pub decision: Decision,
    /// Calibrated QScore in `[0, 1]`.
    pub qscore: f64,
    /// Ordered, human-readable reasons.
    pub reasons: Vec<String>,
    /// Specialist whose result was graded.
    pub specialist_id: String,
    /// Attempt number that was graded.
    pub attempt_no: u32,
    /// Specialist selected for the retry, when `decision` is RETRY.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_target_specialist: Option<String>,
}

/// Durable memory-fabric event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Event discriminator, e.g. `heartbeat` or `run-completed`.
    pub event: String,
    /// Event body.
    #[serde(default)]
    pub data: Value,
}

/// Context lookup request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRequest {
    /// Free-text query.
    pub query: String,
    /// Maximum items to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Context lookup response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResult {
    /// Matching context items.
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Registry liveness beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// The agent reporting in.
    pub agent_id: String,
    /// Self-reported status.
    pub status: AgentStatus,
    /// Capabilities currently served.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Error report from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the reporting side considers the operation retryable.
    #[serde(default)]
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_result() -> TaskResult {
        TaskResult {
            task: "extract selectors".to_string(),
            capability: "selector-extraction".to_string(),
            specialist_id: "specialist-sel".to_string(),
            attempt_no: 0,
            summary: vec![SummaryItem {
                text: "found login form".to_string(),
            }],
            affordances: vec![Affordance {
                action: "click".to_string(),
                text: "submit button".to_string(),
            }],
            slicing: SlicingReport::default(),
            metadata: ResultMetadata {
                schema_valid: true,
                latency_ms: 350,
            },
        }
    }

    fn envelope() -> Envelope {
        Envelope::new(
            MessageType::TaskResult,
            AgentId::agent("specialist-sel"),
            vec![AgentId::agent("cmo")],
            "wesign",
            "webapp",
            &task_result(),
        )
        .unwrap()
    }

    #[test]
    fn new_envelope_validates() {
        let env = envelope();
        assert_eq!(env.meta.a2a_version, A2A_VERSION);
        assert!(env.meta.idempotency_key.is_some());
        assert!(env.validate().is_ok());
    }

    #[test]
    fn empty_recipients_rejected() {
        let mut env = envelope();
        env.meta.to.clear();
        let err = env.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_envelope");
        assert!(err.to_string().contains("meta.to"));
    }

    #[test]
    fn tenant_charset_rejected() {
        let mut env = envelope();
        env.meta.tenant = "We$ign".to_string();
        assert!(env.validate().is_err());
    }

    #[test]
    fn payload_schema_checked_per_type() {
        let mut env = envelope();
        env.payload = serde_json::json!({"task": "x"});
        let err = env.validate().unwrap_err();
        assert!(err.to_string().contains("payload"));
    }

    #[test]
    fn typed_payload_round_trip() {
        let env = envelope();
        let result: TaskResult = env.typed_payload().unwrap();
        assert_eq!(result, task_result());
    }

    #[test]
    fn message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::TaskInvoke).unwrap();
        assert_eq!(json, "\"TaskInvoke\"");
    }
}
