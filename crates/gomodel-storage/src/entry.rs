use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use gomodel_common::BodyValue;

/// One audited request. Indexed fields live at the top level; everything else
/// goes into the free-form payload column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub duration_ns: i64,
    pub request_id: String,
    pub client_ip: Option<String>,
    pub method: String,
    pub path: String,
    pub stream: bool,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub status_code: Option<i32>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub error_type: Option<String>,
    pub payload: AuditPayload,
}

impl AuditLogEntry {
    pub fn begin(request_id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: OffsetDateTime::now_utc(),
            duration_ns: 0,
            request_id: request_id.into(),
            client_ip: None,
            method: method.into(),
            path: path.into(),
            stream: false,
            model: None,
            provider: None,
            status_code: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            error_type: None,
            payload: AuditPayload::default(),
        }
    }

    /// Duration from the entry's start timestamp until now, in nanoseconds.
    pub fn finish_duration(&mut self) {
        let elapsed = OffsetDateTime::now_utc() - self.timestamp;
        self.duration_ns = elapsed.whole_nanoseconds().clamp(0, i64::MAX as i128) as i64;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// First 16 hex chars of SHA-256 of the bearer token; never the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_hash: Option<String>,
    /// Redacted request headers, captured only when header logging is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<BodyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<BodyValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub request_body_too_big_to_handle: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub response_body_too_big_to_handle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One usage record. Narrower than the audit entry and always fully indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub id: Uuid,
    pub request_id: String,
    pub provider_response_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub model: String,
    pub provider: String,
    pub endpoint: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub input_cost: Option<f64>,
    pub output_cost: Option<f64>,
    pub total_cost: Option<f64>,
    #[serde(default)]
    pub extra: Value,
}

impl UsageEntry {
    pub fn new(
        request_id: impl Into<String>,
        provider_response_id: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let request_id = request_id.into();
        let provider_response_id = provider_response_id.into();
        let endpoint = endpoint.into();
        Self {
            id: deterministic_id(&request_id, &endpoint, &provider_response_id),
            request_id,
            provider_response_id,
            timestamp: OffsetDateTime::now_utc(),
            model: model.into(),
            provider: provider.into(),
            endpoint,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            input_cost: None,
            output_cost: None,
            total_cost: None,
            extra: Value::Null,
        }
    }

    pub fn with_tokens(mut self, input: i64, output: i64, total: i64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self.total_tokens = total;
        self
    }
}

/// Deterministic UUIDv5 over the uniqueness key so idempotent re-writes
/// dedupe at the store.
pub fn deterministic_id(request_id: &str, endpoint: &str, provider_response_id: &str) -> Uuid {
    let material = format!("{request_id}\u{1f}{endpoint}\u{1f}{provider_response_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_ids_are_deterministic() {
        let a = UsageEntry::new("rid-1", "chatcmpl-9", "gpt-4", "openai", "chat");
        let b = UsageEntry::new("rid-1", "chatcmpl-9", "gpt-4", "openai", "chat");
        assert_eq!(a.id, b.id);

        let c = UsageEntry::new("rid-1", "chatcmpl-9", "gpt-4", "openai", "responses");
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn payload_omits_empty_fields() {
        let entry = AuditLogEntry::begin("rid-1", "POST", "/v1/chat/completions");
        let json = serde_json::to_value(&entry.payload).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn duration_is_non_negative() {
        let mut entry = AuditLogEntry::begin("rid-1", "GET", "/health");
        entry.finish_duration();
        assert!(entry.duration_ns >= 0);
    }
}
