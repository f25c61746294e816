use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use time::OffsetDateTime;

/// The three-way outcome of grading a specialist result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// The result is good enough; the trace is done.
    Accept,
    /// Re-dispatch the task to a different specialist.
    Retry,
    /// Hand the trace to a human or supervising system.
    Escalate,
}

/// Durable record of one grading outcome.
///
/// At most one grading event exists per idempotency key; a duplicate
/// delivery returns the stored event unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingEvent {
    /// Message id of the graded `TaskResult`. Primary key.
    pub message_id: String,
    /// Trace the result belongs to.
    pub trace_id: String,
    /// Attempt number that was graded.
    pub attempt_no: u32,
    /// Outcome.
    pub decision: Decision,
    /// Calibrated QScore in `[0, 1]`.
    pub qscore: f64,
    /// Ordered, human-readable reasons.
    pub reasons: Vec<String>,
    /// Unique idempotency key of the graded envelope.
    pub idempotency_key: String,
    /// Specialist whose result was graded.
    pub specialist_id: String,
    /// Specialist selected for the retry, when `decision` is RETRY.
    pub retry_target_specialist: Option<String>,
    /// When the event was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_wire_names() {
        assert_eq!(serde_json::to_string(&Decision::Accept).unwrap(), "\"ACCEPT\"");
        assert_eq!(Decision::Escalate.to_string(), "ESCALATE");
        assert_eq!("RETRY".parse::<Decision>().unwrap(), Decision::Retry);
    }
}
