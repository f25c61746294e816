//! Wire-level middleware applied before handler dispatch.
//!
//! The policy gate decides `allow | allow_with_caveat | deny` per envelope;
//! the idempotency guard drops duplicate deliveries. Both run in the
//! consumer loop, after signature and replay checks and before any handler
//! sees the envelope.

mod idempotency;
mod policy;

pub use idempotency::*;
pub use policy::*;
