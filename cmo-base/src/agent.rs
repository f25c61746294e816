use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Report, Result};
use tokio::task::JoinHandle;
use tracing::{info, instrument::Instrumented};

use crate::{create_metrics, CoreMetrics, HealthSurface, Server, Settings};

/// Settings of an agent.
pub trait NewFromSettings: AsRef<Settings> + Sized {
    /// The error type returned by new on failures to parse.
    type Error: Into<Report>;

    /// Create a new instance of these settings by reading the configs and
    /// env vars.
    fn new() -> std::result::Result<Self, Self::Error>;
}

/// A fundamental agent which does not make any assumptions about the tools
/// which are used.
#[async_trait]
pub trait BaseAgent: Send + Sync + Debug {
    /// The agent's name
    const AGENT_NAME: &'static str;

    /// The settings object for this agent
    type Settings: NewFromSettings;

    /// Instantiate the agent from the standard settings object
    async fn from_settings(
        settings: Self::Settings,
        metrics: Arc<CoreMetrics>,
        health: Arc<HealthSurface>,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Start running this agent.
    #[allow(clippy::async_yields_async)]
    async fn run(self: Arc<Self>) -> Instrumented<JoinHandle<Result<()>>>;

    /// Ask the agent to stop. Implementations signal their run tasks to
    /// drain and release resources; `agent_main` then awaits the run handle
    /// until the teardown completes.
    async fn shutdown(self: Arc<Self>) {}
}

/// Call this from `main` to fully initialize and run the agent for its
/// entire lifecycle. This assumes only a single agent is being run. This
/// will initialize the metrics server and tracing as well.
pub async fn agent_main<A: BaseAgent + 'static>() -> Result<()> {
    let settings = A::Settings::new().map_err(|e| e.into())?;
    let core_settings: &Settings = settings.as_ref();

    core_settings
        .tracing
        .start_tracing(&core_settings.log_level)?;
    let metrics = create_metrics(A::AGENT_NAME, core_settings.metrics_port())?;
    let health = HealthSurface::new();
    let agent = Arc::new(A::from_settings(settings, metrics.clone(), health.clone()).await?);
    Server::new(metrics, health).run();

    let mut run = agent.clone().run().await;
    tokio::select! {
        res = &mut run => {
            agent.shutdown().await;
            res?
        }
        _ = tokio::signal::ctrl_c() => {
            info!(agent = A::AGENT_NAME, "shutdown signal received, draining");
            agent.shutdown().await;
            // The run task performs the ordered teardown; wait for it.
            run.await?
        }
    }
}
