use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Schema,
};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use crate::entities;
use crate::entry::{AuditLogEntry, UsageEntry};
use crate::store::{LogStore, StoreError};

/// SQLite's default bind-parameter budget, the lowest of the supported
/// backends; rows per statement are sized against it.
const SQLITE_PARAM_LIMIT: usize = 999;
const AUDIT_COLUMNS: usize = 16;
const USAGE_COLUMNS: usize = 14;

const AUDIT_CHUNK: usize = SQLITE_PARAM_LIMIT / AUDIT_COLUMNS;
const USAGE_CHUNK: usize = SQLITE_PARAM_LIMIT / USAGE_COLUMNS;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const RETENTION_SWEEP_DEADLINE: Duration = Duration::from_secs(300);

/// Shared SQLite/Postgres connection plus schema and index bootstrap.
#[derive(Clone)]
pub struct RelationalBackend {
    db: DatabaseConnection,
}

impl RelationalBackend {
    pub async fn connect(dsn: &str) -> Result<Self, DbErr> {
        let db = Database::connect(dsn).await?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::AuditLogs)
            .register(entities::UsageLogs)
            .sync(&self.db)
            .await?;
        self.create_indexes().await
    }

    async fn create_indexes(&self) -> Result<(), DbErr> {
        // Commonly-filtered audit columns; the payload stays in the JSON
        // column and is not indexed.
        const STATEMENTS: &[&str] = &[
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs (timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_model ON audit_logs (model)",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_provider ON audit_logs (provider)",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_status_code ON audit_logs (status_code)",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_request_id ON audit_logs (request_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_client_ip ON audit_logs (client_ip)",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_path ON audit_logs (path)",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_error_type ON audit_logs (error_type)",
            "CREATE INDEX IF NOT EXISTS idx_usage_logs_timestamp ON usage_logs (timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_usage_logs_request_id ON usage_logs (request_id)",
            "CREATE INDEX IF NOT EXISTS idx_usage_logs_model ON usage_logs (model)",
        ];
        for statement in STATEMENTS {
            self.db.execute_unprepared(statement).await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), DbErr> {
        self.db.clone().close().await
    }

    /// Hourly sweep deleting rows older than the retention window. The
    /// returned handle is aborted at shutdown.
    pub fn spawn_retention_sweeper(&self, retention_days: u32) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            let mut ticker = tokio_time::interval(RETENTION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff =
                    OffsetDateTime::now_utc() - Duration::from_secs(retention_days as u64 * 86400);
                let sweep = tokio_time::timeout(RETENTION_SWEEP_DEADLINE, async {
                    let audits = entities::AuditLogs::delete_many()
                        .filter(entities::audit_logs::Column::Timestamp.lt(cutoff))
                        .exec(&db)
                        .await?;
                    let usages = entities::UsageLogs::delete_many()
                        .filter(entities::usage_logs::Column::Timestamp.lt(cutoff))
                        .exec(&db)
                        .await?;
                    Ok::<(u64, u64), DbErr>((audits.rows_affected, usages.rows_affected))
                })
                .await;

                match sweep {
                    Ok(Ok((audits, usages))) => {
                        if audits + usages > 0 {
                            tracing::info!(audits, usages, "retention sweep removed rows");
                        }
                    }
                    Ok(Err(err)) => tracing::warn!(%err, "retention sweep failed"),
                    Err(_) => tracing::warn!("retention sweep deadline exceeded"),
                }
            }
        })
    }
}

pub struct RelationalAuditStore {
    backend: RelationalBackend,
}

impl RelationalAuditStore {
    pub fn new(backend: RelationalBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LogStore<AuditLogEntry> for RelationalAuditStore {
    async fn write_batch(&self, batch: &[AuditLogEntry]) -> Result<(), StoreError> {
        for chunk in batch.chunks(AUDIT_CHUNK) {
            let models = chunk.iter().map(audit_active_model);
            entities::AuditLogs::insert_many(models)
                .on_conflict(
                    OnConflict::column(entities::audit_logs::Column::Id)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(self.backend.connection())
                .await?;
        }
        Ok(())
    }
}

pub struct RelationalUsageStore {
    backend: RelationalBackend,
}

impl RelationalUsageStore {
    pub fn new(backend: RelationalBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LogStore<UsageEntry> for RelationalUsageStore {
    async fn write_batch(&self, batch: &[UsageEntry]) -> Result<(), StoreError> {
        for chunk in batch.chunks(USAGE_CHUNK) {
            let models = chunk.iter().map(usage_active_model);
            entities::UsageLogs::insert_many(models)
                .on_conflict(
                    OnConflict::column(entities::usage_logs::Column::Id)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(self.backend.connection())
                .await?;
        }
        Ok(())
    }
}

fn audit_active_model(entry: &AuditLogEntry) -> entities::audit_logs::ActiveModel {
    entities::audit_logs::ActiveModel {
        id: ActiveValue::Set(entry.id),
        timestamp: ActiveValue::Set(entry.timestamp),
        duration_ns: ActiveValue::Set(entry.duration_ns),
        request_id: ActiveValue::Set(entry.request_id.clone()),
        client_ip: ActiveValue::Set(entry.client_ip.clone()),
        method: ActiveValue::Set(entry.method.clone()),
        path: ActiveValue::Set(entry.path.clone()),
        stream: ActiveValue::Set(entry.stream),
        model: ActiveValue::Set(entry.model.clone()),
        provider: ActiveValue::Set(entry.provider.clone()),
        status_code: ActiveValue::Set(entry.status_code),
        prompt_tokens: ActiveValue::Set(entry.prompt_tokens),
        completion_tokens: ActiveValue::Set(entry.completion_tokens),
        total_tokens: ActiveValue::Set(entry.total_tokens),
        error_type: ActiveValue::Set(entry.error_type.clone()),
        data: ActiveValue::Set(
            serde_json::to_value(&entry.payload).unwrap_or(serde_json::Value::Null),
        ),
    }
}

fn usage_active_model(entry: &UsageEntry) -> entities::usage_logs::ActiveModel {
    entities::usage_logs::ActiveModel {
        id: ActiveValue::Set(entry.id),
        request_id: ActiveValue::Set(entry.request_id.clone()),
        provider_response_id: ActiveValue::Set(entry.provider_response_id.clone()),
        timestamp: ActiveValue::Set(entry.timestamp),
        model: ActiveValue::Set(entry.model.clone()),
        provider: ActiveValue::Set(entry.provider.clone()),
        endpoint: ActiveValue::Set(entry.endpoint.clone()),
        input_tokens: ActiveValue::Set(entry.input_tokens),
        output_tokens: ActiveValue::Set(entry.output_tokens),
        total_tokens: ActiveValue::Set(entry.total_tokens),
        input_cost: ActiveValue::Set(entry.input_cost),
        output_cost: ActiveValue::Set(entry.output_cost),
        total_cost: ActiveValue::Set(entry.total_cost),
        data: ActiveValue::Set(entry.extra.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_fit_the_parameter_budget() {
        assert_eq!(AUDIT_CHUNK, 62);
        assert_eq!(USAGE_CHUNK, 71);
        assert!(AUDIT_CHUNK * AUDIT_COLUMNS <= SQLITE_PARAM_LIMIT);
        assert!(USAGE_CHUNK * USAGE_COLUMNS <= SQLITE_PARAM_LIMIT);
    }
}
