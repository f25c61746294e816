//! The Core Message Orchestrator (CMO) agent.
//!
//! Consumes specialist results and registry heartbeats off the A2A fabric,
//! grades results with the QScore calculator, makes the three-way
//! ACCEPT/RETRY/ESCALATE decision, checkpoints every transition, and keeps
//! the agent registry honest with a heartbeat publisher and a lease reaper.

mod consumer;
mod decision;
mod handlers;
mod heartbeat;
mod orchestrator;
mod reaper;
mod settings;

pub use consumer::{Consumer, EscalationEvent};
pub use decision::DecisionEngine;
pub use handlers::{
    ErrorReportHandler, HandlerRegistry, HeartbeatHandler, InboundHandler, MemoryEventHandler,
    TaskResultHandler,
};
pub use heartbeat::HeartbeatPublisher;
pub use orchestrator::Orchestrator;
pub use reaper::{AgentsExpired, LeaseReaper};
pub use settings::OrchestratorSettings;
