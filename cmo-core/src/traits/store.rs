use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::{CheckpointError, TransportError};

/// Durable key-value store backing the idempotency guard.
///
/// The broker's KV surface in production, an in-process map in tests. The
/// only hard requirement is that [`IdempotencyStore::check_and_set`] is
/// atomic: two concurrent calls for the same key must not both claim it.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + Debug {
    /// Atomically claim `key` with a TTL. Returns `true` when this call
    /// recorded the key, `false` when it was already present.
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool, TransportError>;

    /// Release a claimed key. Used to permit redelivery after a dispatch
    /// failure.
    async fn remove(&self, key: &str) -> Result<(), TransportError>;
}

/// Content-addressed object store for payloads above the inline threshold.
///
/// Keys are derived from content hashes, so writes are append-only and
/// duplicate puts are cheap.
#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    /// Store `bytes` under `key`.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CheckpointError>;

    /// Fetch the bytes stored under `key`. Fails with `blob_missing` when
    /// the key was never stored.
    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError>;
}
