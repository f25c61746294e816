use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CmoGradingEvent::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CmoGradingEvent::MessageId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CmoGradingEvent::TraceId).text().not_null())
                    .col(
                        ColumnDef::new(CmoGradingEvent::AttemptNo)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CmoGradingEvent::Decision).text().not_null())
                    .col(ColumnDef::new(CmoGradingEvent::Qscore).double().not_null())
                    .col(
                        ColumnDef::new(CmoGradingEvent::Reasons)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CmoGradingEvent::IdempotencyKey)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(CmoGradingEvent::SpecialistId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CmoGradingEvent::RetryTargetSpecialist).text())
                    .col(
                        ColumnDef::new(CmoGradingEvent::CreatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(CmoGradingEvent::Table)
                    .name("idx_cmo_grading_events_trace")
                    .col(CmoGradingEvent::TraceId)
                    .col(CmoGradingEvent::AttemptNo)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CmoGradingEvent::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum CmoGradingEvent {
    #[iden = "cmo_grading_events"]
    Table,
    /// Message id of the graded result
    MessageId,
    /// Trace the result belongs to
    TraceId,
    /// Attempt number graded
    AttemptNo,
    /// ACCEPT, RETRY or ESCALATE
    Decision,
    /// Calibrated QScore
    Qscore,
    /// Ordered decision reasons
    Reasons,
    /// Unique idempotency key of the graded envelope
    IdempotencyKey,
    /// Specialist whose result was graded
    SpecialistId,
    /// Specialist selected for the retry
    RetryTargetSpecialist,
    /// Time of record creation
    CreatedAt,
}
