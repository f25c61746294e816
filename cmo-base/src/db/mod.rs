//! Sea-orm persistence for the registry, checkpointer and grading events.

pub use checkpoint::PostgresCheckpointer;
use eyre::Result;
pub use grading::PostgresGradingStore;
pub use registry::PostgresRegistry;
use sea_orm::{ConnectOptions, Database, DbConn};
use tracing::instrument;

use cmo_core::traits::ComponentHealth;

pub(crate) mod date_time;
/// Hand-written sea-orm entities for the CMO schema.
pub mod entities;

mod checkpoint;
mod grading;
mod registry;

/// Database handle shared by the registry, checkpointer and grading stores.
#[derive(Clone, Debug)]
pub struct Db(DbConn);

impl Db {
    #[instrument(skip(url))]
    /// Connect a pool with the configured limits.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        connect_timeout: std::time::Duration,
        query_timeout: std::time::Duration,
    ) -> Result<Self> {
        let mut options = ConnectOptions::new(url.to_string());
        options
            .max_connections(max_connections)
            .connect_timeout(connect_timeout)
            .acquire_timeout(query_timeout)
            .sqlx_logging(false);
        let db = Database::connect(options).await?;
        Ok(Self(db))
    }

    /// The underlying connection.
    pub fn conn(&self) -> &DbConn {
        &self.0
    }

    /// Liveness probe for the health surface.
    pub async fn health_check(&self) -> ComponentHealth {
        match self.0.ping().await {
            Ok(()) => ComponentHealth::healthy("database reachable"),
            Err(e) => ComponentHealth::unhealthy(format!("ping failed: {e}")),
        }
    }

    /// Close the underlying pool. The connection is pool-backed, so closing
    /// any clone closes them all; calling this twice is harmless.
    pub async fn close(&self) -> Result<(), sea_orm::DbErr> {
        self.0.clone().close().await
    }
}
