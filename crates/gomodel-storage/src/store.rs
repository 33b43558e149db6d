use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::entry::{AuditLogEntry, UsageEntry};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Some rows in a batch landed and some did not. The logger counts these
    /// without halting its worker.
    #[error("partial write: {failed} of {attempted} rows failed")]
    PartialWrite { attempted: usize, failed: usize },
    #[error("store write timed out")]
    Timeout,
    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
    #[error("{0}")]
    Backend(String),
}

/// Pluggable batch sink for one entry type. Relational and document variants
/// keep their own schema and indexing code behind this seam.
#[async_trait]
pub trait LogStore<E>: Send + Sync {
    async fn write_batch(&self, batch: &[E]) -> Result<(), StoreError>;

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub type AuditStore = Arc<dyn LogStore<AuditLogEntry>>;
pub type UsageStore = Arc<dyn LogStore<UsageEntry>>;
