use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::RwLock;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::info;

use cmo_core::traits::{ComponentHealth, HealthState};

use crate::CoreMetrics;

/// Aggregated component health, exposed on `/health`.
///
/// Components write their latest state here; the server reads it. The
/// aggregate is `unhealthy` if any component is, `degraded` if any
/// component is, and `healthy` otherwise.
#[derive(Debug, Default)]
pub struct HealthSurface {
    components: RwLock<BTreeMap<String, ComponentHealth>>,
}

impl HealthSurface {
    /// A surface with no components yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the latest health of a component.
    pub fn set(&self, component: impl Into<String>, health: ComponentHealth) {
        self.components.write().insert(component.into(), health);
    }

    /// The aggregate state and a snapshot of per-component details.
    pub fn snapshot(&self) -> (HealthState, BTreeMap<String, ComponentHealth>) {
        let components = self.components.read().clone();
        let aggregate = if components
            .values()
            .any(|c| c.state == HealthState::Unhealthy)
        {
            HealthState::Unhealthy
        } else if components.values().any(|c| c.state == HealthState::Degraded) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        (aggregate, components)
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<CoreMetrics>,
    health: Arc<HealthSurface>,
}

/// HTTP server exposing `/metrics` (OpenMetrics) and `/health`.
pub struct Server {
    metrics: Arc<CoreMetrics>,
    health: Arc<HealthSurface>,
}

impl Server {
    /// Create a new server instance.
    pub fn new(metrics: Arc<CoreMetrics>, health: Arc<HealthSurface>) -> Arc<Self> {
        Arc::new(Self { metrics, health })
    }

    /// Run the HTTP server on the metrics port.
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        let port = self.metrics.listen_port();
        info!(port, "starting metrics and health server on 0.0.0.0");

        let state = AppState {
            metrics: self.metrics.clone(),
            health: self.health.clone(),
        };
        tokio::spawn(async move {
            let app = Router::new()
                .route("/metrics", get(serve_metrics))
                .route("/health", get(serve_health))
                .with_state(state);

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            axum::Server::bind(&addr)
                .serve(app.into_make_service())
                .await
                .expect("Failed to start server");
        })
    }
}

async fn serve_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.gather() {
        Ok(report) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; charset=utf-8")],
            report,
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain; charset=utf-8")],
            b"Failed to encode metrics".to_vec(),
        ),
    }
}

async fn serve_health(State(state): State<AppState>) -> impl IntoResponse {
    let (aggregate, components) = state.health.snapshot();
    let status = match aggregate {
        HealthState::Healthy => StatusCode::OK,
        HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(json!({
            "status": aggregate,
            "components": components,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_is_worst_component() {
        let surface = HealthSurface::new();
        surface.set("transport", ComponentHealth::healthy("connected"));
        assert_eq!(surface.snapshot().0, HealthState::Healthy);

        surface.set(
            "registry",
            ComponentHealth {
                state: HealthState::Degraded,
                detail: "slow".into(),
            },
        );
        assert_eq!(surface.snapshot().0, HealthState::Degraded);

        surface.set("checkpointer", ComponentHealth::unhealthy("down"));
        assert_eq!(surface.snapshot().0, HealthState::Unhealthy);
    }
}
