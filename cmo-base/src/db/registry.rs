use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, EntityTrait, Insert, QueryFilter, QueryOrder,
};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use cmo_core::traits::AgentRegistry;
use cmo_core::{
    AgentRecord, AgentStatus, DiscoveryFilter, RegistryError, TopicSubscription,
};

use super::date_time;
use super::entities::{agent, agent_topic};
use super::Db;

/// Registry store on Postgres. Register and heartbeat are single-row
/// upserts; the reaper and retention cleanup are bulk statements.
#[derive(Clone, Debug)]
pub struct PostgresRegistry {
    db: Db,
}

fn store_err(e: sea_orm::DbErr) -> RegistryError {
    RegistryError::Store(e.to_string())
}

fn to_record(model: agent::Model) -> Result<AgentRecord, RegistryError> {
    let status: AgentStatus = model
        .status
        .parse()
        .map_err(|_| RegistryError::Store(format!("bad status `{}`", model.status)))?;
    let capabilities: Vec<String> = serde_json::from_value(model.capabilities)
        .map_err(|e| RegistryError::Store(e.to_string()))?;
    Ok(AgentRecord {
        agent_id: model.agent_id,
        version: model.version,
        tenant: model.tenant,
        project: model.project,
        capabilities,
        status,
        last_heartbeat: model.last_heartbeat.map(date_time::from_db),
        lease_until: date_time::from_db(model.lease_until),
        metadata: model.metadata,
    })
}

impl PostgresRegistry {
    /// A registry over the shared database handle.
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AgentRegistry for PostgresRegistry {
    #[instrument(skip(self, agent), fields(agent_id = %agent.agent_id))]
    async fn register(
        &self,
        agent: AgentRecord,
        lease_seconds: u64,
    ) -> Result<AgentRecord, RegistryError> {
        let now = OffsetDateTime::now_utc();
        let lease_until = now + time::Duration::seconds(lease_seconds as i64);
        let capabilities = serde_json::to_value(&agent.capabilities)
            .map_err(|e| RegistryError::Store(e.to_string()))?;

        let model = agent::ActiveModel {
            agent_id: Set(agent.agent_id.clone()),
            version: Set(agent.version.clone()),
            tenant: Set(agent.tenant.clone()),
            project: Set(agent.project.clone()),
            capabilities: Set(capabilities),
            status: Set(AgentStatus::Starting.to_string()),
            last_heartbeat: Set(None),
            lease_until: Set(date_time::to_db(lease_until)),
            metadata: Set(agent.metadata.clone()),
            time_created: Set(date_time::to_db(now)),
            time_updated: Set(date_time::to_db(now)),
        };
        Insert::one(model)
            .on_conflict(
                OnConflict::column(agent::Column::AgentId)
                    .update_columns([
                        agent::Column::Version,
                        agent::Column::Tenant,
                        agent::Column::Project,
                        agent::Column::Capabilities,
                        agent::Column::Status,
                        agent::Column::LeaseUntil,
                        agent::Column::Metadata,
                        agent::Column::TimeUpdated,
                    ])
                    .to_owned(),
            )
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;

        Ok(AgentRecord {
            status: AgentStatus::Starting,
            last_heartbeat: None,
            lease_until,
            ..agent
        })
    }

    #[instrument(skip(self))]
    async fn heartbeat(
        &self,
        agent_id: &str,
        status: AgentStatus,
        lease_seconds: u64,
    ) -> Result<AgentRecord, RegistryError> {
        let existing = agent::Entity::find_by_id(agent_id)
            .one(self.db.conn())
            .await
            .map_err(store_err)?
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let extended = now + time::Duration::seconds(lease_seconds as i64);
        // Lease reset is monotone: a late heartbeat never shortens it.
        let lease_until = extended.max(date_time::from_db(existing.lease_until));

        let mut model: agent::ActiveModel = existing.clone().into();
        model.status = Set(status.to_string());
        model.last_heartbeat = Set(Some(date_time::to_db(now)));
        model.lease_until = Set(date_time::to_db(lease_until));
        model.time_updated = Set(date_time::to_db(now));
        let updated = sea_orm::ActiveModelTrait::update(model, self.db.conn())
            .await
            .map_err(store_err)?;
        to_record(updated)
    }

    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, RegistryError> {
        agent::Entity::find_by_id(agent_id)
            .one(self.db.conn())
            .await
            .map_err(store_err)?
            .map(to_record)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<AgentRecord>, RegistryError> {
        let statuses: Vec<String> = filter
            .effective_statuses()
            .iter()
            .map(AgentStatus::to_string)
            .collect();
        let now = date_time::to_db(OffsetDateTime::now_utc());

        let models = agent::Entity::find()
            .filter(agent::Column::Tenant.eq(filter.tenant.as_str()))
            .filter(agent::Column::Project.eq(filter.project.as_str()))
            .filter(agent::Column::Status.is_in(statuses))
            .filter(agent::Column::LeaseUntil.gt(now))
            .order_by_asc(agent::Column::AgentId)
            .all(self.db.conn())
            .await
            .map_err(store_err)?;

        let mut records = Vec::with_capacity(models.len());
        for model in models {
            let record = to_record(model)?;
            if let Some(capability) = &filter.capability {
                if !record.capabilities.iter().any(|c| c == capability) {
                    continue;
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn mark_unavailable(&self, agent_id: &str) -> Result<(), RegistryError> {
        let result = agent::Entity::update_many()
            .col_expr(
                agent::Column::Status,
                Expr::value(AgentStatus::Unavailable.to_string()),
            )
            .col_expr(agent::Column::TimeUpdated, Expr::value(date_time::now()))
            .filter(agent::Column::AgentId.eq(agent_id))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        if result.rows_affected == 0 {
            return Err(RegistryError::AgentNotFound(agent_id.to_string()));
        }
        Ok(())
    }

    async fn subscribe_topic(&self, subscription: TopicSubscription) -> Result<(), RegistryError> {
        let model = agent_topic::ActiveModel {
            agent_id: Set(subscription.agent_id.clone()),
            topic: Set(subscription.topic.clone()),
            role: Set(subscription.role.to_string()),
            time_created: Set(date_time::now()),
            ..Default::default()
        };
        let inserted = Insert::one(model)
            .on_conflict(
                OnConflict::columns([
                    agent_topic::Column::AgentId,
                    agent_topic::Column::Topic,
                    agent_topic::Column::Role,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.db.conn())
            .await
            .map_err(store_err)?;
        if inserted == 0 {
            return Err(RegistryError::DuplicateTopicSubscription {
                agent_id: subscription.agent_id,
                topic: subscription.topic,
            });
        }
        Ok(())
    }

    async fn unsubscribe_topic(&self, agent_id: &str, topic: &str) -> Result<(), RegistryError> {
        agent_topic::Entity::delete_many()
            .filter(agent_topic::Column::AgentId.eq(agent_id))
            .filter(agent_topic::Column::Topic.eq(topic))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_expired_agents(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError> {
        let cutoff = date_time::to_db(now);
        let expired: Vec<String> = agent::Entity::find()
            .filter(agent::Column::LeaseUntil.lt(cutoff))
            .filter(agent::Column::Status.ne(AgentStatus::Unavailable.to_string()))
            .all(self.db.conn())
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|m| m.agent_id)
            .collect();

        if expired.is_empty() {
            return Ok(expired);
        }
        debug!(count = expired.len(), "marking expired agents unavailable");
        agent::Entity::update_many()
            .col_expr(
                agent::Column::Status,
                Expr::value(AgentStatus::Unavailable.to_string()),
            )
            .col_expr(agent::Column::TimeUpdated, Expr::value(date_time::to_db(now)))
            .filter(agent::Column::AgentId.is_in(expired.clone()))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        Ok(expired)
    }

    #[instrument(skip(self))]
    async fn cleanup_inactive_agents(&self, days: u32) -> Result<u64, RegistryError> {
        let cutoff =
            date_time::to_db(OffsetDateTime::now_utc() - time::Duration::days(days as i64));
        let stale: Vec<String> = agent::Entity::find()
            .filter(agent::Column::Status.eq(AgentStatus::Unavailable.to_string()))
            .filter(agent::Column::TimeUpdated.lt(cutoff))
            .all(self.db.conn())
            .await
            .map_err(store_err)?
            .into_iter()
            .map(|m| m.agent_id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        agent_topic::Entity::delete_many()
            .filter(agent_topic::Column::AgentId.is_in(stale.clone()))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        let result = agent::Entity::delete_many()
            .filter(agent::Column::AgentId.is_in(stale))
            .exec(self.db.conn())
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected)
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.db.close().await.map_err(store_err)
    }
}
