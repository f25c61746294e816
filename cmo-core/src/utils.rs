use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::ReplayError;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Order-independent digest of a JSON value: SHA-256 over its canonical
/// bytes. This is the hash used for state, input/output and activity
/// request digests.
pub fn canonical_hash(value: &serde_json::Value) -> String {
    sha256_hex(&crate::canonical_json_bytes(value))
}

/// Derive the deterministic idempotency key for an envelope.
///
/// `SHA-256(trace_id:message_id:ts:from_id)`, lowercase hex. Two envelopes
/// collide iff all four components collide.
pub fn derive_idempotency_key(trace_id: &str, message_id: &str, ts: &str, from_id: &str) -> String {
    sha256_hex(format!("{trace_id}:{message_id}:{ts}:{from_id}").as_bytes())
}

/// Current UTC time truncated to millisecond precision.
pub fn now_utc_millis() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    // Sub-millisecond digits never appear on the wire; drop them here so that
    // format/parse round-trips are exact.
    now.replace_nanosecond((now.millisecond() as u32) * 1_000_000)
        .expect("nanosecond in range")
}

/// Format a timestamp as RFC 3339 UTC with millisecond precision.
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).expect("rfc3339 formatting")
}

/// Parse a `meta.ts` wire timestamp. Missing or malformed values map onto
/// the replay taxonomy so callers can reject with the right reason.
pub fn parse_timestamp(ts: &str) -> Result<OffsetDateTime, ReplayError> {
    if ts.is_empty() {
        return Err(ReplayError::TimestampMissing);
    }
    OffsetDateTime::parse(ts, &Rfc3339).map_err(|_| ReplayError::TimestampMissing)
}

/// Fresh 128-bit random message id, lowercase hex without separators.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Fresh trace id. Same alphabet as message ids.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_pure() {
        let a = derive_idempotency_key("t1", "m1", "2026-01-01T00:00:00.000Z", "planner");
        let b = derive_idempotency_key("t1", "m1", "2026-01-01T00:00:00.000Z", "planner");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = derive_idempotency_key("t1", "m2", "2026-01-01T00:00:00.000Z", "planner");
        assert_ne!(a, c);
    }

    #[test]
    fn timestamp_round_trip_keeps_millis() {
        let now = now_utc_millis();
        let parsed = parse_timestamp(&format_timestamp(now)).unwrap();
        assert_eq!(now, parsed);
    }

    #[test]
    fn empty_timestamp_is_missing() {
        assert_eq!(parse_timestamp(""), Err(ReplayError::TimestampMissing));
        assert_eq!(parse_timestamp("yesterday"), Err(ReplayError::TimestampMissing));
    }

    #[test]
    fn message_ids_are_hex_and_unique() {
        let id = new_message_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_message_id());
    }
}
