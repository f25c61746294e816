use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

/// Live agents with topic counts and remaining lease seconds.
const AGENTS_ACTIVE: &str = r#"
CREATE VIEW agents_active AS
SELECT
    a.agent_id,
    a.tenant,
    a.project,
    a.capabilities,
    a.status,
    a.last_heartbeat,
    a.lease_until,
    GREATEST(EXTRACT(EPOCH FROM (a.lease_until - NOW())), 0)::bigint AS lease_remaining_seconds,
    (SELECT COUNT(*) FROM agent_topics t WHERE t.agent_id = a.agent_id) AS topic_count
FROM agents a
WHERE a.lease_until > NOW()
  AND a.status IN ('HEALTHY', 'DEGRADED')
"#;

/// Per-run step/activity counts and durations.
const CMO_EXECUTION_SUMMARY: &str = r#"
CREATE VIEW cmo_execution_summary AS
SELECT
    r.trace_id,
    r.graph_id,
    r.graph_version,
    r.status,
    r.started_at,
    r.completed_at,
    EXTRACT(EPOCH FROM (COALESCE(r.completed_at, NOW()) - r.started_at))::bigint AS run_seconds,
    (SELECT COUNT(*) FROM cmo_steps s WHERE s.trace_id = r.trace_id) AS step_count,
    (SELECT COALESCE(SUM(s.duration_ms), 0) FROM cmo_steps s WHERE s.trace_id = r.trace_id) AS step_duration_ms,
    (SELECT COUNT(*) FROM cmo_activities act WHERE act.trace_id = r.trace_id) AS activity_count
FROM cmo_runs r
"#;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let connection = manager.get_connection();
        connection.execute_unprepared(AGENTS_ACTIVE).await?;
        connection.execute_unprepared(CMO_EXECUTION_SUMMARY).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let connection = manager.get_connection();
        connection
            .execute_unprepared("DROP VIEW IF EXISTS cmo_execution_summary")
            .await?;
        connection
            .execute_unprepared("DROP VIEW IF EXISTS agents_active")
            .await?;
        Ok(())
    }
}
