use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use cmo_core::traits::IdempotencyStore;
use cmo_core::{Envelope, TransportError};

/// Default TTL on recorded idempotency keys.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether a delivery is the first with its idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// First delivery; dispatch it.
    Fresh,
    /// Seen before; ack without dispatch.
    Duplicate,
}

/// The duplicate-drop guard in front of handler dispatch.
///
/// The claim is taken *before* dispatch so that concurrent duplicates race
/// on the store's atomic check-and-set, and released again if dispatch
/// fails so that redelivery gets a clean slate.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
}

impl IdempotencyGuard {
    /// A guard over `store` with the default TTL.
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_KEY_TTL,
        }
    }

    /// Override the key TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Claim the envelope's idempotency key.
    pub async fn claim(&self, envelope: &Envelope) -> Result<IdempotencyOutcome, TransportError> {
        let key = envelope.idempotency_key();
        if self.store.check_and_set(&key, self.ttl).await? {
            Ok(IdempotencyOutcome::Fresh)
        } else {
            Ok(IdempotencyOutcome::Duplicate)
        }
    }

    /// Release a claim after a failed dispatch so the broker may redeliver.
    pub async fn release(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.store.remove(&envelope.idempotency_key()).await
    }
}

/// In-process idempotency store for tests and single-node runs.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    keys: Mutex<HashMap<String, Instant>>,
}

impl MemoryIdempotencyStore {
    /// An empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, TransportError> {
        let mut keys = self.keys.lock();
        let now = Instant::now();
        keys.retain(|_, expiry| *expiry > now);
        match keys.get(key) {
            Some(_) => Ok(false),
            None => {
                keys.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<(), TransportError> {
        self.keys.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmo_core::{AgentId, MemoryEvent, MessageType};

    fn envelope() -> Envelope {
        Envelope::new(
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
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_claims_dropped() {
        let guard = IdempotencyGuard::new(MemoryIdempotencyStore::new());
        let env = envelope();
        assert_eq!(guard.claim(&env).await.unwrap(), IdempotencyOutcome::Fresh);
        assert_eq!(
            guard.claim(&env).await.unwrap(),
            IdempotencyOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn release_permits_reclaim() {
        let guard = IdempotencyGuard::new(MemoryIdempotencyStore::new());
        let env = envelope();
        assert_eq!(guard.claim(&env).await.unwrap(), IdempotencyOutcome::Fresh);
        guard.release(&env).await.unwrap();
        assert_eq!(guard.claim(&env).await.unwrap(), IdempotencyOutcome::Fresh);
    }

    #[tokio::test]
    async fn expired_keys_are_reclaimable() {
        let guard =
            IdempotencyGuard::new(MemoryIdempotencyStore::new()).with_ttl(Duration::from_millis(5));
        let env = envelope();
        assert_eq!(guard.claim(&env).await.unwrap(), IdempotencyOutcome::Fresh);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(guard.claim(&env).await.unwrap(), IdempotencyOutcome::Fresh);
    }

    #[tokio::test]
    async fn distinct_envelopes_are_fresh() {
        let guard = IdempotencyGuard::new(MemoryIdempotencyStore::new());
        assert_eq!(
            guard.claim(&envelope()).await.unwrap(),
            IdempotencyOutcome::Fresh
        );
        assert_eq!(
            guard.claim(&envelope()).await.unwrap(),
            IdempotencyOutcome::Fresh
        );
    }
}
