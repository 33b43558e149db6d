use bytes::Bytes;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use gomodel_client::ByteStream;
use gomodel_protocol::chat::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChatMessage};
use gomodel_protocol::responses::{OutputContent, OutputItem, ResponsesRequest, ResponsesResponse,
    ResponsesUsage};
use gomodel_protocol::sse::SseFrameParser;

/// Request-level fields that carry over from a Responses request to chat.
const CARRIED_FIELDS: &[(&str, &str)] = &[
    ("temperature", "temperature"),
    ("top_p", "top_p"),
    ("max_output_tokens", "max_tokens"),
];

/// Build the chat request a Responses call maps onto for upstreams that only
/// speak `/chat/completions`.
pub fn responses_request_to_chat(request: &ResponsesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(instructions) = &request.instructions {
        messages.push(ChatMessage::text("system", instructions));
    }

    match &request.input {
        Some(Value::String(text)) => messages.push(ChatMessage::text("user", text)),
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(message) = input_item_to_message(item) {
                    messages.push(message);
                }
            }
        }
        _ => {}
    }

    let mut extra = Map::new();
    for (source, target) in CARRIED_FIELDS {
        if let Some(value) = request.extra.get(*source) {
            extra.insert((*target).to_string(), value.clone());
        }
    }

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream,
        stream_options: None,
        extra,
    }
}

fn input_item_to_message(item: &Value) -> Option<ChatMessage> {
    let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
    let content = item.get("content")?;

    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };

    Some(ChatMessage::text(role, &text))
}

/// Shape a chat completion as the `response` object the caller asked for.
pub fn chat_response_to_responses(chat: ChatCompletionResponse) -> ResponsesResponse {
    let text = chat
        .choices
        .first()
        .and_then(|choice| choice.message.content_text())
        .unwrap_or_default()
        .to_string();

    ResponsesResponse {
        id: format!("resp_{}", chat.id),
        object: "response".to_string(),
        created_at: chat.created,
        status: Some("completed".to_string()),
        model: chat.model,
        output: vec![OutputItem {
            r#type: "message".to_string(),
            id: Some(format!("msg_{}", chat.id)),
            role: Some("assistant".to_string()),
            status: Some("completed".to_string()),
            content: vec![OutputContent {
                r#type: "output_text".to_string(),
                text: Some(text),
                extra: Map::new(),
            }],
            extra: Map::new(),
        }],
        usage: chat.usage.map(ResponsesUsage::from),
        extra: Map::new(),
    }
}

/// Translate a streamed chat completion into `response.*` events in-flight.
/// The upstream chunk stream is consumed on a relay task; the returned
/// receiver yields ready-to-forward SSE bytes.
pub fn chat_stream_to_responses(mut upstream: ByteStream) -> ByteStream {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let mut parser = SseFrameParser::new();
        let mut state = TranslationState::default();

        while let Some(item) = upstream.recv().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };
            for frame in parser.push_bytes(&chunk) {
                if frame.is_done_marker() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<ChatCompletionChunk>(&frame.data) else {
                    continue;
                };
                for event in state.consume(parsed) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        }

        if let Some(event) = state.finish() {
            let _ = tx.send(Ok(event)).await;
        }
    });

    rx
}

#[derive(Default)]
struct TranslationState {
    started: bool,
    finished: bool,
    id: String,
    model: String,
    created: i64,
    text: String,
    usage: Option<ResponsesUsage>,
}

impl TranslationState {
    fn consume(&mut self, chunk: ChatCompletionChunk) -> Vec<Bytes> {
        let mut events = Vec::new();

        if !self.started && !chunk.id.is_empty() {
            self.started = true;
            self.id = chunk.id.clone();
            self.model = chunk.model.clone();
            self.created = chunk.created;
            events.push(self.event(
                "response.created",
                json!({"type": "response.created", "response": self.envelope("in_progress")}),
            ));
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(ResponsesUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
                extra: Map::new(),
            });
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(delta) = choice.delta.content.as_deref()
                && !delta.is_empty()
            {
                self.text.push_str(delta);
                events.push(self.event(
                    "response.output_text.delta",
                    json!({"type": "response.output_text.delta", "delta": delta}),
                ));
            }
            if choice.finish_reason.is_some() {
                events.push(self.completed_event());
            }
        }

        events
    }

    fn finish(&mut self) -> Option<Bytes> {
        if self.started && !self.finished {
            Some(self.completed_event())
        } else {
            None
        }
    }

    fn completed_event(&mut self) -> Bytes {
        self.finished = true;
        let mut envelope = self.envelope("completed");
        if let Some(usage) = &self.usage {
            envelope["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
        }
        envelope["output"] = json!([{
            "type": "message",
            "id": format!("msg_{}", self.id),
            "role": "assistant",
            "status": "completed",
            "content": [{"type": "output_text", "text": self.text}],
        }]);
        self.event(
            "response.completed",
            json!({"type": "response.completed", "response": envelope}),
        )
    }

    fn envelope(&self, status: &str) -> Value {
        json!({
            "id": format!("resp_{}", self.id),
            "object": "response",
            "created_at": self.created,
            "status": status,
            "model": self.model,
            "output": [],
        })
    }

    fn event(&self, name: &str, payload: Value) -> Bytes {
        Bytes::from(format!("event: {name}\ndata: {payload}\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_input_becomes_user_message() {
        let request: ResponsesRequest = serde_json::from_str(
            r#"{"model":"m","input":"Hi","instructions":"be brief","temperature":0.1}"#,
        )
        .unwrap();
        let chat = responses_request_to_chat(&request);
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, "system");
        assert_eq!(chat.messages[1].content_text(), Some("Hi"));
        assert_eq!(chat.extra["temperature"], 0.1);
    }

    #[test]
    fn item_input_joins_text_parts() {
        let request: ResponsesRequest = serde_json::from_str(
            r#"{"model":"m","input":[
                {"role":"user","content":[{"type":"input_text","text":"a"},
                                          {"type":"input_text","text":"b"}]}]}"#,
        )
        .unwrap();
        let chat = responses_request_to_chat(&request);
        assert_eq!(chat.messages[0].content_text(), Some("ab"));
    }

    #[test]
    fn chat_response_maps_to_response_object() {
        let chat: ChatCompletionResponse = serde_json::from_str(
            r#"{"id":"c1","object":"chat.completion","created":7,"model":"m",
                "choices":[{"index":0,"message":{"role":"assistant","content":"Hello"},
                            "finish_reason":"stop"}],
                "usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#,
        )
        .unwrap();
        let response = chat_response_to_responses(chat);
        assert_eq!(response.object, "response");
        assert_eq!(response.output[0].content[0].text.as_deref(), Some("Hello"));
        assert_eq!(response.usage.unwrap().total_tokens, 3);
    }

    #[tokio::test]
    async fn stream_translation_emits_created_delta_completed() {
        let (tx, upstream) = mpsc::channel(8);
        tx.send(Ok(Bytes::from(
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\
             \"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        )))
        .await
        .unwrap();
        tx.send(Ok(Bytes::from(
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{},\
             \"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n",
        )))
        .await
        .unwrap();
        drop(tx);

        let mut translated = chat_stream_to_responses(upstream);
        let mut collected = String::new();
        while let Some(item) = translated.recv().await {
            collected.push_str(&String::from_utf8_lossy(&item.unwrap()));
        }

        assert!(collected.contains("event: response.created"));
        assert!(collected.contains("\"delta\":\"Hi\""));
        assert!(collected.contains("event: response.completed"));
        assert!(collected.contains("\"text\":\"Hi\""));
    }
}
