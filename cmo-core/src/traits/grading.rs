use std::fmt::Debug;

use async_trait::async_trait;

use crate::{DecisionError, GradingEvent};

/// Result of an insert-once attempt on the grading-event store.
#[derive(Debug, Clone, PartialEq)]
pub enum GradingInsert {
    /// The event was recorded by this call.
    Inserted,
    /// An event with the same idempotency key already existed; the stored
    /// event is returned so the caller can repeat the original decision.
    Existing(GradingEvent),
}

/// Durable, insert-once grading-event persistence.
///
/// The unique constraint on `idempotency_key` is the second idempotency
/// layer behind the middleware's fast KV drop; both are required.
#[async_trait]
pub trait GradingStore: Send + Sync + Debug {
    /// Insert an event unless one with the same idempotency key exists.
    async fn insert_once(&self, event: GradingEvent) -> Result<GradingInsert, DecisionError>;

    /// Look up the event recorded under an idempotency key.
    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<GradingEvent>, DecisionError>;

    /// All events of a trace, ordered by attempt number.
    async fn events_for_trace(&self, trace_id: &str) -> Result<Vec<GradingEvent>, DecisionError>;
}
