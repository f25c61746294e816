//! Core domain model for the Core Message Orchestrator (CMO).
//!
//! This crate holds the pure, I/O-free pieces of the orchestrator: the A2A
//! envelope wire model and its canonical byte form, topic naming and routing,
//! the QScore calculator, the error taxonomy, and the capability traits
//! implemented by `cmo-base` (transport, registry, checkpointer, stores).
//!
//! Everything here is deterministic. Anything that contacts a broker, a
//! database, or another agent lives behind one of the traits in [`traits`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;

/// QScore signal computation, fusion and calibration.
pub mod qscore;
/// Capability traits implemented by the infrastructure crate.
pub mod traits;
/// Wire and domain types.
pub mod types;
/// Hashing and timestamp helpers shared by signing and checkpointing.
pub mod utils;

pub use error::*;
pub use types::*;
