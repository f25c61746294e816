pub use sea_orm_migration::prelude::*;

mod m20250601_000001_create_table_agent;
mod m20250601_000001_create_table_cmo_graph;
mod m20250601_000002_create_table_agent_topic;
mod m20250601_000002_create_table_cmo_run;
mod m20250601_000003_create_table_cmo_activity;
mod m20250601_000003_create_table_cmo_step;
mod m20250601_000004_create_table_grading_event;
mod m20250601_000005_create_views;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        // This order is important, grouped by a topological sort; within
        // each group (the last number) order does not matter.
        vec![
            Box::new(m20250601_000001_create_table_agent::Migration),
            Box::new(m20250601_000001_create_table_cmo_graph::Migration),
            Box::new(m20250601_000002_create_table_agent_topic::Migration),
            Box::new(m20250601_000002_create_table_cmo_run::Migration),
            Box::new(m20250601_000003_create_table_cmo_activity::Migration),
            Box::new(m20250601_000003_create_table_cmo_step::Migration),
            Box::new(m20250601_000004_create_table_grading_event::Migration),
            Box::new(m20250601_000005_create_views::Migration),
        ]
    }
}
