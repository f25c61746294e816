//! Apply all pending migrations to the database at `PG_URL`.

use migration::{Migrator, MigratorTrait};
use sea_orm::Database;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let url = std::env::var("PG_URL")
        .unwrap_or_else(|_| "postgres://localhost:5432/cmo".to_string());
    tracing::info!(%url, "applying migrations");
    let db = Database::connect(&url).await?;
    Migrator::up(&db, None).await?;
    tracing::info!("migrations applied");
    Ok(())
}
