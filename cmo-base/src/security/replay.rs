use std::time::Duration;

use time::OffsetDateTime;

use cmo_core::utils::parse_timestamp;
use cmo_core::{Envelope, ReplayError};

use super::EnvelopeSigner;

/// Default freshness window.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(300);
/// Default tolerated future clock skew.
pub const DEFAULT_SKEW_TOLERANCE: Duration = Duration::from_secs(30);

/// Rejects stale, future-dated and (optionally) unsigned envelopes.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    freshness: Duration,
    skew_tolerance: Duration,
    signer: Option<EnvelopeSigner>,
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self {
            freshness: DEFAULT_FRESHNESS,
            skew_tolerance: DEFAULT_SKEW_TOLERANCE,
            signer: None,
        }
    }
}

impl ReplayGuard {
    /// A guard with explicit windows.
    pub fn new(freshness: Duration, skew_tolerance: Duration) -> Self {
        Self {
            freshness,
            skew_tolerance,
            signer: None,
        }
    }

    /// Also verify the envelope signature as part of the same check.
    pub fn with_signer(mut self, signer: EnvelopeSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Check an envelope against the current clock.
    pub fn check(&self, envelope: &Envelope) -> Result<(), ReplayError> {
        self.check_at(envelope, OffsetDateTime::now_utc())
    }

    /// Check an envelope against an explicit `now`. Split out so tests can
    /// pin the clock.
    pub fn check_at(&self, envelope: &Envelope, now: OffsetDateTime) -> Result<(), ReplayError> {
        let ts = parse_timestamp(&envelope.meta.ts)?;

        let ahead = ts - now;
        if ahead > self.skew_tolerance {
            return Err(ReplayError::TimestampFuture {
                skew_seconds: ahead.whole_seconds(),
            });
        }

        let age = now - ts;
        if age > self.freshness {
            return Err(ReplayError::TimestampStale {
                age_seconds: age.whole_seconds(),
                window_seconds: self.freshness.as_secs(),
            });
        }

        if let Some(signer) = &self.signer {
            signer
                .verify(envelope)
                .map_err(|_| ReplayError::SignatureFailed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmo_core::utils::format_timestamp;
    use cmo_core::{AgentId, MemoryEvent, MessageType};

    fn envelope_at(ts: OffsetDateTime) -> Envelope {
        let mut env = Envelope::new(
            MessageType::MemoryEvent,
            AgentId::agent("planner"),
            vec![AgentId::agent("cmo")],
            "wesign",
            "webapp",
            &MemoryEvent {
                event: "test".into(),
                data: serde_json::json!({}),
            },
        )
        .unwrap();
        env.meta.ts = format_timestamp(ts);
        env
    }

    #[test]
    fn fresh_envelope_passes() {
        let now = OffsetDateTime::now_utc();
        let guard = ReplayGuard::default();
        guard.check_at(&envelope_at(now), now).unwrap();
    }

    #[test]
    fn stale_envelope_rejected() {
        let now = OffsetDateTime::now_utc();
        let guard = ReplayGuard::default();
        let err = guard
            .check_at(&envelope_at(now - time::Duration::minutes(10)), now)
            .unwrap_err();
        assert_eq!(err.code(), "timestamp_stale");
    }

    #[test]
    fn boundary_of_freshness_window() {
        let now = OffsetDateTime::now_utc();
        let guard = ReplayGuard::default();
        // Exactly 300 s old is still inside the window.
        guard
            .check_at(&envelope_at(now - time::Duration::seconds(300)), now)
            .unwrap();
        assert!(guard
            .check_at(&envelope_at(now - time::Duration::seconds(301)), now)
            .is_err());
    }

    #[test]
    fn future_timestamp_beyond_skew_rejected() {
        let now = OffsetDateTime::now_utc();
        let guard = ReplayGuard::default();
        // 30 s ahead is tolerated clock skew; 31 s is not.
        guard
            .check_at(&envelope_at(now + time::Duration::seconds(30)), now)
            .unwrap();
        let err = guard
            .check_at(&envelope_at(now + time::Duration::seconds(31)), now)
            .unwrap_err();
        assert_eq!(err.code(), "timestamp_future");
    }

    #[test]
    fn malformed_timestamp_is_missing() {
        let now = OffsetDateTime::now_utc();
        let mut env = envelope_at(now);
        env.meta.ts = "not-a-timestamp".into();
        assert_eq!(
            ReplayGuard::default().check_at(&env, now).unwrap_err().code(),
            "timestamp_missing"
        );
    }

    #[test]
    fn signature_checked_when_configured() {
        let now = OffsetDateTime::now_utc();
        let signer = EnvelopeSigner::new("secret");
        let guard = ReplayGuard::default().with_signer(signer.clone());

        let mut env = envelope_at(now);
        signer.sign(&mut env).unwrap();
        guard.check_at(&env, now).unwrap();

        env.meta.tenant = "otherco".into();
        assert_eq!(
            guard.check_at(&env, now).unwrap_err().code(),
            "replay_signature_failed"
        );
    }
}
