//! The Core Message Orchestrator binary.

use cmo_base::agent_main;
use eyre::Result;
use orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    agent_main::<Orchestrator>().await
}
