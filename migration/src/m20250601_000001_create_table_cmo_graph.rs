use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CmoGraph::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(CmoGraph::GraphId).text().not_null())
                    .col(ColumnDef::new(CmoGraph::GraphVersion).text().not_null())
                    .col(ColumnDef::new(CmoGraph::Definition).json_binary().not_null())
                    .col(ColumnDef::new(CmoGraph::TimeCreated).timestamp().not_null())
                    .primary_key(
                        Index::create()
                            .col(CmoGraph::GraphId)
                            .col(CmoGraph::GraphVersion),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CmoGraph::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum CmoGraph {
    #[iden = "cmo_graphs"]
    Table,
    /// Graph identifier
    GraphId,
    /// Graph definition version
    GraphVersion,
    /// Graph definition body
    Definition,
    /// Time of record creation
    TimeCreated,
}
