use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Chat completion request in the OpenAI dialect. Only the fields the gateway
/// inspects are typed; everything else flows through `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Ask OpenAI-compatible upstreams for the trailing usage event.
    pub fn ensure_stream_usage(&mut self) {
        let options = self.stream_options.get_or_insert_with(StreamOptions::default);
        if options.include_usage.is_none() {
            options.include_usage = Some(true);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(Value::String(content.to_string())),
            extra: Map::new(),
        }
    }

    /// The message content as plain text, when it is a plain string.
    pub fn content_text(&self) -> Option<&str> {
        self.content.as_ref().and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One SSE chunk of a streamed chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_round_trip() {
        let raw = r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hi"}],
                      "temperature":0.2,"top_p":0.9}"#;
        let req: ChatCompletionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.model, "gpt-4");
        assert_eq!(req.extra["temperature"], 0.2);

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["top_p"], 0.9);
    }

    #[test]
    fn ensure_stream_usage_is_idempotent() {
        let mut req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"m","messages":[],"stream":true,
                "stream_options":{"include_usage":false}}"#,
        )
        .unwrap();
        req.ensure_stream_usage();
        // An explicit caller choice is left alone.
        assert_eq!(
            req.stream_options.as_ref().unwrap().include_usage,
            Some(false)
        );

        let mut req: ChatCompletionRequest =
            serde_json::from_str(r#"{"model":"m","messages":[],"stream":true}"#).unwrap();
        req.ensure_stream_usage();
        assert_eq!(
            req.stream_options.as_ref().unwrap().include_usage,
            Some(true)
        );
    }

    #[test]
    fn chunk_with_usage_only() {
        let raw = r#"{"id":"c1","object":"chat.completion.chunk","created":1,
                      "model":"m","choices":[],
                      "usage":{"prompt_tokens":5,"completion_tokens":10,"total_tokens":15}}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(raw).unwrap();
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().total_tokens, 15);
    }
}
