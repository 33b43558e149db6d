use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry in the registry and in `GET /v1/models` output. The optional
/// metadata block is gateway-local enrichment; unknown upstream fields ride
/// along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default = "default_model_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
    #[serde(skip)]
    pub provider_name: String,
    #[serde(skip)]
    pub provider_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_model_object() -> String {
    "model".to_string()
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created: 0,
            owned_by: owned_by.into(),
            provider_name: String::new(),
            provider_type: String::new(),
            display_name: None,
            family: None,
            context_window: None,
            max_output_tokens: None,
            pricing: None,
            extra: Map::new(),
        }
    }
}

/// Per-million-token rates; `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_per_million: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_per_million: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_per_million: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_output_per_million: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_image: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

impl ModelsResponse {
    pub fn new(mut data: Vec<ModelEntry>) -> Self {
        data.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_sorted_by_id() {
        let response = ModelsResponse::new(vec![
            ModelEntry::new("zeta", "z"),
            ModelEntry::new("alpha", "a"),
            ModelEntry::new("mid", "m"),
        ]);
        let ids: Vec<&str> = response.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn provider_fields_stay_internal() {
        let mut entry = ModelEntry::new("gpt-4", "openai");
        entry.provider_name = "primary".to_string();
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("provider_name").is_none());
        assert_eq!(json["object"], "model");
    }
}
