use sea_orm_migration::prelude::*;

use crate::m20250601_000002_create_table_cmo_run::CmoRun;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CmoActivity::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CmoActivity::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CmoActivity::TraceId).text().not_null())
                    .col(ColumnDef::new(CmoActivity::StepIndex).integer().not_null())
                    .col(ColumnDef::new(CmoActivity::ActivityType).text().not_null())
                    .col(ColumnDef::new(CmoActivity::RequestHash).text().not_null())
                    .col(
                        ColumnDef::new(CmoActivity::RequestData)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CmoActivity::ResponseData).json_binary())
                    .col(ColumnDef::new(CmoActivity::ResponseBlobRef).text())
                    .col(ColumnDef::new(CmoActivity::Timestamp).timestamp().not_null())
                    .col(ColumnDef::new(CmoActivity::DurationMs).big_integer())
                    .col(ColumnDef::new(CmoActivity::Error).text())
                    .foreign_key(
                        ForeignKey::create()
                            .from(CmoActivity::Table, CmoActivity::TraceId)
                            .to(CmoRun::Table, CmoRun::TraceId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .table(CmoActivity::Table)
                    .name("uq_cmo_activities_request")
                    .col(CmoActivity::TraceId)
                    .col(CmoActivity::StepIndex)
                    .col(CmoActivity::ActivityType)
                    .col(CmoActivity::RequestHash)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CmoActivity::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum CmoActivity {
    #[iden = "cmo_activities"]
    Table,
    Id,
    /// Run the activity belongs to
    TraceId,
    /// Step the activity occurred in
    StepIndex,
    /// Kind of I/O captured
    ActivityType,
    /// Digest of the canonical request bytes
    RequestHash,
    /// The request as issued
    RequestData,
    /// Inline response
    ResponseData,
    /// Object-store reference for oversized responses
    ResponseBlobRef,
    /// When the activity completed
    Timestamp,
    /// Activity duration
    DurationMs,
    /// Error detail when the activity failed
    Error,
}
