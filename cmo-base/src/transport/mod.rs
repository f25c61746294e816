//! Broker transport implementations.
//!
//! Redis Streams is the live variant. The in-memory variant backs tests and
//! single-process runs; the NATS variant is a stub that preserves the
//! public contract.

mod memory;
mod nats;
mod redis;

pub use self::redis::{RedisIdempotencyStore, RedisStreamTransport};
pub use memory::InMemoryTransport;
pub use nats::NatsTransport;
