use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chat::Usage;

/// Responses API request. `input` is either a plain string or a list of
/// input items; the gateway treats it opaquely except for translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponsesRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesResponse {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub model: String,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponsesUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputItem {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<OutputContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputContent {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Responses-API usage uses input/output naming instead of prompt/completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl From<Usage> for ResponsesUsage {
    fn from(usage: Usage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            extra: Map::new(),
        }
    }
}

/// The subset of `response.*` stream events the gateway inspects. Unknown
/// event types deserialize into `Other` and are ignored, not fatal.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ResponsesStreamEvent {
    #[serde(rename = "response.created")]
    Created { response: ResponsesResponse },
    #[serde(rename = "response.in_progress")]
    InProgress { response: ResponsesResponse },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.completed")]
    Completed { response: ResponsesResponse },
    #[serde(rename = "response.done")]
    Done { response: ResponsesResponse },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tagging() {
        let raw = r#"{"type":"response.output_text.delta","delta":"Hi"}"#;
        match serde_json::from_str::<ResponsesStreamEvent>(raw).unwrap() {
            ResponsesStreamEvent::OutputTextDelta { delta } => assert_eq!(delta, "Hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_events_are_tolerated() {
        let raw = r#"{"type":"response.audio.delta","delta":"zzz"}"#;
        assert!(matches!(
            serde_json::from_str::<ResponsesStreamEvent>(raw).unwrap(),
            ResponsesStreamEvent::Other
        ));
    }

    #[test]
    fn completed_event_carries_envelope() {
        let raw = r#"{"type":"response.completed","response":{
            "id":"resp_1","object":"response","created_at":99,"status":"completed",
            "model":"m","output":[],
            "usage":{"input_tokens":3,"output_tokens":4,"total_tokens":7}}}"#;
        match serde_json::from_str::<ResponsesStreamEvent>(raw).unwrap() {
            ResponsesStreamEvent::Completed { response } => {
                assert_eq!(response.id, "resp_1");
                assert_eq!(response.usage.unwrap().total_tokens, 7);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
