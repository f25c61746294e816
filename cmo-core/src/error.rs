//! Error taxonomy for the orchestrator core.
//!
//! Every error kind carries a stable string code so that DLQ reasons,
//! metrics labels and grading-event reasons stay identical across releases.

use std::time::Duration;

/// Envelope and topic validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required meta field is missing or malformed. `path` points at the
    /// offending field, e.g. `meta.to[1].id`.
    #[error("invalid envelope at {path}: {problem}")]
    InvalidEnvelope {
        /// Field path of the offending value.
        path: String,
        /// Human-readable description of the problem.
        problem: String,
    },
    /// `meta.type` is not one of the recognized variants.
    #[error("unknown envelope type `{0}`")]
    UnknownType(String),
    /// Token claims failed structural validation.
    #[error("invalid claims: {0}")]
    InvalidClaims(String),
    /// A topic string does not conform to `qa.<tenant>.<project>.<domain>[.<entity>][.<verb>]`.
    #[error("invalid topic `{topic}`: {problem}")]
    InvalidTopic {
        /// The offending topic string.
        topic: String,
        /// What was wrong with it.
        problem: String,
    },
}

impl ValidationError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidEnvelope { .. } => "invalid_envelope",
            ValidationError::UnknownType(_) => "unknown_type",
            ValidationError::InvalidClaims(_) => "invalid_claims",
            ValidationError::InvalidTopic { .. } => "invalid_topic",
        }
    }

    /// Shorthand for an [`ValidationError::InvalidEnvelope`] at `path`.
    pub fn at(path: impl Into<String>, problem: impl Into<String>) -> Self {
        ValidationError::InvalidEnvelope {
            path: path.into(),
            problem: problem.into(),
        }
    }
}

/// Bearer-token, capability-token and signature failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    /// Signature bytes do not verify against the configured key.
    #[error("signature verification failed")]
    InvalidSignature,
    /// The token `exp` claim is in the past.
    #[error("token expired")]
    Expired,
    /// The token `nbf` claim is in the future.
    #[error("token not yet valid")]
    NotBefore,
    /// The `iss` claim does not match the configured issuer.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// The `aud` claim does not match the configured audience.
    #[error("invalid audience")]
    InvalidAudience,
    /// The token could not be parsed at all.
    #[error("malformed token: {0}")]
    Malformed(String),
    /// Claims parsed but failed semantic validation.
    #[error("invalid claims: {0}")]
    InvalidClaims(String),
    /// The token does not grant the capability required for the operation.
    #[error("capability `{required}` not granted")]
    InsufficientCapabilities {
        /// Capability that the operation required.
        required: String,
    },
    /// A resource-scoped operation was attempted with an unscoped token.
    #[error("token is not scoped to resource `{resource}`")]
    ResourceNotScoped {
        /// Resource the operation targeted.
        resource: String,
    },
}

impl SecurityError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            SecurityError::InvalidSignature => "invalid_signature",
            SecurityError::Expired => "expired",
            SecurityError::NotBefore => "not_before",
            SecurityError::InvalidIssuer => "invalid_issuer",
            SecurityError::InvalidAudience => "invalid_audience",
            SecurityError::Malformed(_) => "malformed",
            SecurityError::InvalidClaims(_) => "invalid_claims",
            SecurityError::InsufficientCapabilities { .. } => "insufficient_capabilities",
            SecurityError::ResourceNotScoped { .. } => "resource_not_scoped",
        }
    }
}

/// Replay-protection failures on inbound envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// `meta.ts` is older than the freshness window.
    #[error("envelope timestamp is {age_seconds}s old, window is {window_seconds}s")]
    TimestampStale {
        /// Envelope age in seconds.
        age_seconds: i64,
        /// Configured freshness window in seconds.
        window_seconds: u64,
    },
    /// `meta.ts` is further in the future than the skew tolerance allows.
    #[error("envelope timestamp is {skew_seconds}s in the future")]
    TimestampFuture {
        /// How far ahead of local time the timestamp is.
        skew_seconds: i64,
    },
    /// `meta.ts` is absent or unparseable.
    #[error("envelope timestamp missing or malformed")]
    TimestampMissing,
    /// The combined freshness-plus-signature check failed on the signature.
    #[error("replay signature check failed")]
    SignatureFailed,
}

impl ReplayError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ReplayError::TimestampStale { .. } => "timestamp_stale",
            ReplayError::TimestampFuture { .. } => "timestamp_future",
            ReplayError::TimestampMissing => "timestamp_missing",
            ReplayError::SignatureFailed => "replay_signature_failed",
        }
    }
}

/// Broker transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Operation attempted before `connect` (or after `disconnect`).
    #[error("transport is not connected")]
    NotConnected,
    /// The broker refused or failed an append.
    #[error("publish failed: {0}")]
    PublishFailed(String),
    /// Consumer-group setup or read loop failed.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    /// A request/response wait or an outbound call exceeded its deadline.
    #[error("transport operation timed out after {0:?}")]
    Timeout(Duration),
    /// The per-consumer pending cap is exhausted.
    #[error("backpressure: {pending} messages pending, cap is {cap}")]
    Backpressure {
        /// Messages currently owned by the consumer.
        pending: usize,
        /// Configured cap.
        cap: usize,
    },
    /// The selected transport variant is compiled in but not implemented.
    #[error("transport variant `{0}` is not implemented")]
    NotImplemented(&'static str),
}

impl TransportError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::NotConnected => "not_connected",
            TransportError::PublishFailed(_) => "publish_failed",
            TransportError::SubscribeFailed(_) => "subscribe_failed",
            TransportError::Timeout(_) => "timeout",
            TransportError::Backpressure { .. } => "backpressure",
            TransportError::NotImplemented(_) => "not_implemented",
        }
    }
}

/// Registry store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Heartbeat or lookup for an agent that never registered.
    #[error("agent `{0}` not found")]
    AgentNotFound(String),
    /// The agent's lease expired before the operation.
    #[error("lease for agent `{0}` expired")]
    LeaseExpired(String),
    /// `(agent_id, topic, role)` already exists.
    #[error("agent `{agent_id}` already subscribed to `{topic}`")]
    DuplicateTopicSubscription {
        /// Subscribing agent.
        agent_id: String,
        /// Topic of the duplicate subscription.
        topic: String,
    },
    /// Underlying store failure.
    #[error("registry store error: {0}")]
    Store(String),
}

impl RegistryError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::AgentNotFound(_) => "agent_not_found",
            RegistryError::LeaseExpired(_) => "lease_expired",
            RegistryError::DuplicateTopicSubscription { .. } => "duplicate_topic_sub",
            RegistryError::Store(_) => "store_error",
        }
    }
}

/// Checkpoint store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// A unique-key insert observed conflicting data for the same key.
    #[error("idempotency violation for {key}")]
    IdempotencyViolation {
        /// The conflicting unique key, rendered for diagnostics.
        key: String,
    },
    /// Replay produced a different state hash than the recorded one.
    #[error("state hash mismatch at trace {trace_id} step {step_index}")]
    StepHashMismatch {
        /// Trace being replayed.
        trace_id: String,
        /// Step index where replay drifted.
        step_index: i32,
    },
    /// An externalized payload reference could not be resolved.
    #[error("blob `{0}` missing from object store")]
    BlobMissing(String),
    /// Underlying store failure.
    #[error("checkpoint store error: {0}")]
    Store(String),
}

impl CheckpointError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            CheckpointError::IdempotencyViolation { .. } => "idempotency_violation",
            CheckpointError::StepHashMismatch { .. } => "step_hash_mismatch",
            CheckpointError::BlobMissing(_) => "blob_missing",
            CheckpointError::Store(_) => "store_error",
        }
    }
}

/// Decision-engine failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecisionError {
    /// RETRY was warranted but no alternative specialist holds the capability.
    #[error("no retry target with capability `{capability}`")]
    NoRetryTarget {
        /// Capability the retry required.
        capability: String,
    },
    /// A QScore outside `[0, 1]` reached the decision policy.
    #[error("qscore {0} out of range")]
    QScoreOutOfRange(f64),
    /// The configured signal weights do not sum to 1.0 within tolerance.
    #[error("signal weights sum to {0}, expected 1.0 +/- 0.001")]
    InvalidWeights(f64),
    /// The calibration table bins overlap or are unsorted.
    #[error("invalid calibration table: {0}")]
    InvalidCalibration(String),
    /// Underlying grading-event store failure.
    #[error("decision store error: {0}")]
    Store(String),
}

impl DecisionError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            DecisionError::NoRetryTarget { .. } => "no_retry_target",
            DecisionError::QScoreOutOfRange(_) => "qscore_out_of_range",
            DecisionError::InvalidWeights(_) => "invalid_weights",
            DecisionError::InvalidCalibration(_) => "invalid_calibration",
            DecisionError::Store(_) => "store_error",
        }
    }
}

/// Umbrella error for paths that cross component boundaries.
#[derive(Debug, thiserror::Error)]
pub enum CmoError {
    /// See [`ValidationError`].
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// See [`SecurityError`].
    #[error(transparent)]
    Security(#[from] SecurityError),
    /// See [`ReplayError`].
    #[error(transparent)]
    Replay(#[from] ReplayError),
    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// See [`RegistryError`].
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// See [`CheckpointError`].
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// See [`DecisionError`].
    #[error(transparent)]
    Decision(#[from] DecisionError),
}

impl CmoError {
    /// Stable error code of the wrapped kind.
    pub fn code(&self) -> &'static str {
        match self {
            CmoError::Validation(e) => e.code(),
            CmoError::Security(e) => e.code(),
            CmoError::Replay(e) => e.code(),
            CmoError::Transport(e) => e.code(),
            CmoError::Registry(e) => e.code(),
            CmoError::Checkpoint(e) => e.code(),
            CmoError::Decision(e) => e.code(),
        }
    }
}
