//! The security kit: identity tokens, capability grants, envelope
//! signatures and replay protection.
//!
//! Two distinct mechanisms live here. Identity is JWT (HS256 or RS256),
//! for bearer and capability tokens. Envelope integrity is HMAC-SHA256
//! over the canonical envelope bytes, with its own secret.

mod capability;
mod jwt;
mod replay;
mod signing;

pub use capability::*;
pub use jwt::*;
pub use replay::*;
pub use signing::*;
