//! Shared infrastructure for CMO agents.
//!
//! This crate is the home of everything an agent process needs around the
//! domain logic in `cmo-core`: settings loading, tracing bootstrap, metrics
//! and the HTTP health surface, the security kit, broker transports, wire
//! middleware, sea-orm persistence, blob storage, typed publishers, and the
//! agent lifecycle runner.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod agent;
/// Blob storage implementations.
pub mod blob;
/// Sea-orm persistence: entities and the registry / checkpoint / grading stores.
pub mod db;
/// Task-shortcut and settings-declaration macros.
pub mod macros;
mod metrics;
/// Wire middleware: policy gate and idempotency guard.
pub mod middleware;
/// Typed, signed envelope publishers.
pub mod publisher;
/// JWT, capability tokens, envelope signing and replay protection.
pub mod security;
mod server;
/// Settings loading and tracing configuration.
pub mod settings;
#[cfg(any(test, feature = "test-utils"))]
/// In-memory store implementations for tests.
pub mod testing;
/// Broker transport implementations.
pub mod transport;

pub use agent::*;
pub use metrics::*;
pub use server::*;
pub use settings::Settings;
