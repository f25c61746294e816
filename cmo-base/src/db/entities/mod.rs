//! Hand-written entities for the CMO relational schema. The DDL lives in
//! the `migration` crate; keep both in sync.

#![allow(missing_docs)]

pub mod agent;
pub mod agent_topic;
pub mod cmo_activity;
pub mod cmo_graph;
pub mod cmo_grading_event;
pub mod cmo_run;
pub mod cmo_step;
