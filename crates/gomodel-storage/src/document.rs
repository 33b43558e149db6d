use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{Bson, DateTime as BsonDateTime, Document, doc};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};

use crate::entry::{AuditLogEntry, UsageEntry};
use crate::store::{LogStore, StoreError};

const AUDIT_COLLECTION: &str = "audit_logs";
const USAGE_COLLECTION: &str = "usage_logs";

/// MongoDB backend. Retention is the database's job here: a TTL index on
/// `timestamp` expires documents instead of a sweep task.
#[derive(Clone)]
pub struct DocumentBackend {
    client: Client,
    audit: Collection<Document>,
    usage: Collection<Document>,
}

impl DocumentBackend {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let db = client.database(database);
        Ok(Self {
            audit: db.collection(AUDIT_COLLECTION),
            usage: db.collection(USAGE_COLLECTION),
            client,
        })
    }

    pub async fn ensure_indexes(&self, retention_days: u32) -> Result<(), StoreError> {
        let ttl = Duration::from_secs(retention_days as u64 * 86400);
        for collection in [&self.audit, &self.usage] {
            collection
                .create_index(
                    IndexModel::builder()
                        .keys(doc! { "timestamp": 1 })
                        .options(IndexOptions::builder().expire_after(ttl).build())
                        .build(),
                )
                .await
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            collection
                .create_index(
                    IndexModel::builder().keys(doc! { "request_id": 1 }).build(),
                )
                .await
                .map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        self.audit
            .create_index(IndexModel::builder().keys(doc! { "model": 1 }).build())
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }

    pub async fn close(self) {
        self.client.shutdown().await;
    }
}

pub struct DocumentAuditStore {
    backend: DocumentBackend,
}

impl DocumentAuditStore {
    pub fn new(backend: DocumentBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LogStore<AuditLogEntry> for DocumentAuditStore {
    async fn write_batch(&self, batch: &[AuditLogEntry]) -> Result<(), StoreError> {
        let documents: Vec<Document> = batch.iter().map(audit_document).collect();
        insert_unordered(&self.backend.audit, documents).await
    }
}

pub struct DocumentUsageStore {
    backend: DocumentBackend,
}

impl DocumentUsageStore {
    pub fn new(backend: DocumentBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LogStore<UsageEntry> for DocumentUsageStore {
    async fn write_batch(&self, batch: &[UsageEntry]) -> Result<(), StoreError> {
        let documents: Vec<Document> = batch.iter().map(usage_document).collect();
        insert_unordered(&self.backend.usage, documents).await
    }
}

/// Unordered insert so one bad document cannot abort the rest of the batch.
/// Duplicate `_id`s (idempotent usage re-writes) are expected and do not
/// count against the batch.
async fn insert_unordered(
    collection: &Collection<Document>,
    documents: Vec<Document>,
) -> Result<(), StoreError> {
    if documents.is_empty() {
        return Ok(());
    }
    let attempted = documents.len();
    match collection.insert_many(documents).ordered(false).await {
        Ok(_) => Ok(()),
        Err(err) => match *err.kind {
            mongodb::error::ErrorKind::InsertMany(ref failure) => {
                let failed = failure
                    .write_errors
                    .as_ref()
                    .map(|errors| errors.len())
                    .unwrap_or(0);
                let duplicates = failure
                    .write_errors
                    .as_ref()
                    .map(|errors| {
                        errors
                            .iter()
                            .filter(|write_error| write_error.code == 11000)
                            .count()
                    })
                    .unwrap_or(0);
                if failed == duplicates {
                    return Ok(());
                }
                Err(StoreError::PartialWrite {
                    attempted,
                    failed: failed - duplicates,
                })
            }
            _ => Err(StoreError::Backend(err.to_string())),
        },
    }
}

fn bson_timestamp(stamp: time::OffsetDateTime) -> BsonDateTime {
    BsonDateTime::from_millis((stamp.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn json_to_bson(value: &serde_json::Value) -> Bson {
    Bson::try_from(value.clone()).unwrap_or(Bson::Null)
}

fn audit_document(entry: &AuditLogEntry) -> Document {
    let payload = serde_json::to_value(&entry.payload).unwrap_or(serde_json::Value::Null);
    doc! {
        "_id": entry.id.to_string(),
        "timestamp": bson_timestamp(entry.timestamp),
        "duration_ns": entry.duration_ns,
        "request_id": entry.request_id.clone(),
        "client_ip": entry.client_ip.clone(),
        "method": entry.method.clone(),
        "path": entry.path.clone(),
        "stream": entry.stream,
        "model": entry.model.clone(),
        "provider": entry.provider.clone(),
        "status_code": entry.status_code,
        "prompt_tokens": entry.prompt_tokens,
        "completion_tokens": entry.completion_tokens,
        "total_tokens": entry.total_tokens,
        "error_type": entry.error_type.clone(),
        "data": json_to_bson(&payload),
    }
}

fn usage_document(entry: &UsageEntry) -> Document {
    doc! {
        "_id": entry.id.to_string(),
        "request_id": entry.request_id.clone(),
        "provider_response_id": entry.provider_response_id.clone(),
        "timestamp": bson_timestamp(entry.timestamp),
        "model": entry.model.clone(),
        "provider": entry.provider.clone(),
        "endpoint": entry.endpoint.clone(),
        "input_tokens": entry.input_tokens,
        "output_tokens": entry.output_tokens,
        "total_tokens": entry.total_tokens,
        "input_cost": entry.input_cost,
        "output_cost": entry.output_cost,
        "total_cost": entry.total_cost,
        "data": json_to_bson(&entry.extra),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_document_keeps_indexed_fields_top_level() {
        let mut entry = AuditLogEntry::begin("rid-1", "POST", "/v1/chat/completions");
        entry.model = Some("gpt-4".to_string());
        entry.status_code = Some(200);
        entry.payload.api_key_hash = Some("abcd".to_string());

        let document = audit_document(&entry);
        assert_eq!(document.get_str("request_id").unwrap(), "rid-1");
        assert_eq!(document.get_str("model").unwrap(), "gpt-4");
        assert_eq!(document.get_i32("status_code").unwrap(), 200);
        let data = document.get_document("data").unwrap();
        assert_eq!(data.get_str("api_key_hash").unwrap(), "abcd");
    }

    #[test]
    fn usage_document_null_costs() {
        let entry = UsageEntry::new("rid", "resp", "m", "openai", "chat");
        let document = usage_document(&entry);
        assert_eq!(document.get("input_cost"), Some(&Bson::Null));
    }
}
