use bytes::Bytes;
use serde_json::{Value, json};

use gomodel_common::BodyValue;
use gomodel_protocol::chat::ChatCompletionChunk;
use gomodel_protocol::responses::ResponsesStreamEvent;
use gomodel_protocol::sse::SseFrameParser;

/// Accumulated-content cap for the reconstructed body.
const MAX_ACCUMULATED_CONTENT: usize = 1024 * 1024;

/// Rolling raw-byte tail kept for the final-event usage scrape fallback.
const TAIL_BYTES: usize = 8 * 1024;

/// Which response shape the stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Chat,
    Responses,
}

/// Normalized token totals lifted from the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Parses SSE frames as the client reads them and rebuilds the response the
/// upstream would have returned without streaming. Frames may arrive split
/// anywhere; the inner parser carries pending bytes between feeds.
pub struct StreamScanner {
    kind: StreamKind,
    parser: SseFrameParser,
    tail: Vec<u8>,
    pub id: Option<String>,
    pub model: Option<String>,
    pub created: Option<i64>,
    pub role: Option<String>,
    pub finish_reason: Option<String>,
    pub status: Option<String>,
    pub content: String,
    pub truncated: bool,
    pub usage: Option<StreamUsage>,
}

impl StreamScanner {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            parser: SseFrameParser::new(),
            tail: Vec::new(),
            id: None,
            model: None,
            created: None,
            role: None,
            finish_reason: None,
            status: None,
            content: String::new(),
            truncated: false,
            usage: None,
        }
    }

    pub fn feed(&mut self, bytes: &Bytes) {
        self.extend_tail(bytes);
        let frames = self.parser.push_bytes(bytes);
        for frame in frames {
            self.apply(&frame.data);
        }
    }

    /// Flush pending bytes and fall back to the raw tail when no usage event
    /// was decoded from well-formed frames.
    pub fn finish(&mut self) {
        let frames = self.parser.finish();
        for frame in frames {
            self.apply(&frame.data);
        }
        if self.usage.is_none() {
            self.usage = scrape_usage_from_tail(&self.tail);
        }
    }

    fn extend_tail(&mut self, bytes: &[u8]) {
        self.tail.extend_from_slice(bytes);
        if self.tail.len() > TAIL_BYTES {
            let excess = self.tail.len() - TAIL_BYTES;
            self.tail.drain(..excess);
        }
    }

    fn apply(&mut self, data: &str) {
        if data.trim().is_empty() || data.trim() == "[DONE]" {
            return;
        }
        match self.kind {
            StreamKind::Chat => self.apply_chat(data),
            StreamKind::Responses => self.apply_responses(data),
        }
    }

    fn apply_chat(&mut self, data: &str) {
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) else {
            return;
        };

        if self.id.is_none() && !chunk.id.is_empty() {
            self.id = Some(chunk.id.clone());
            self.model = Some(chunk.model.clone());
            self.created = Some(chunk.created);
        }

        if let Some(usage) = &chunk.usage {
            self.usage = Some(StreamUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(role) = &choice.delta.role {
                self.role = Some(role.clone());
            }
            if let Some(delta) = &choice.delta.content {
                self.append_content(delta);
            }
            if let Some(reason) = &choice.finish_reason
                && !reason.is_empty()
            {
                self.finish_reason = Some(reason.clone());
            }
        }
    }

    fn apply_responses(&mut self, data: &str) {
        let Ok(event) = serde_json::from_str::<ResponsesStreamEvent>(data) else {
            return;
        };
        match event {
            ResponsesStreamEvent::Created { response }
            | ResponsesStreamEvent::InProgress { response } => {
                self.id.get_or_insert(response.id);
                self.model.get_or_insert(response.model);
                self.created.get_or_insert(response.created_at);
                if let Some(status) = response.status {
                    self.status = Some(status);
                }
            }
            ResponsesStreamEvent::OutputTextDelta { delta } => {
                self.append_content(&delta);
            }
            ResponsesStreamEvent::Completed { response }
            | ResponsesStreamEvent::Done { response } => {
                self.id.get_or_insert(response.id);
                self.model.get_or_insert(response.model);
                self.created.get_or_insert(response.created_at);
                if let Some(status) = response.status {
                    self.status = Some(status);
                }
                if let Some(usage) = response.usage {
                    self.usage = Some(StreamUsage {
                        prompt_tokens: usage.input_tokens,
                        completion_tokens: usage.output_tokens,
                        total_tokens: usage.total_tokens,
                    });
                }
            }
            ResponsesStreamEvent::Other => {}
        }
    }

    fn append_content(&mut self, delta: &str) {
        if self.truncated {
            return;
        }
        let remaining = MAX_ACCUMULATED_CONTENT - self.content.len();
        if delta.len() > remaining {
            let mut cut = remaining;
            while cut > 0 && !delta.is_char_boundary(cut) {
                cut -= 1;
            }
            self.content.push_str(&delta[..cut]);
            self.truncated = true;
        } else {
            self.content.push_str(delta);
        }
    }

    /// The canonical non-streaming body the upstream would have returned.
    pub fn synthesize_body(&self) -> BodyValue {
        let value = match self.kind {
            StreamKind::Chat => {
                let mut body = json!({
                    "id": self.id.clone().unwrap_or_default(),
                    "object": "chat.completion",
                    "created": self.created.unwrap_or_default(),
                    "model": self.model.clone().unwrap_or_default(),
                    "choices": [{
                        "index": 0,
                        "message": {
                            "role": self.role.clone().unwrap_or_else(|| "assistant".to_string()),
                            "content": self.content,
                        },
                        "finish_reason": self.finish_reason,
                    }],
                });
                if let Some(usage) = self.usage {
                    body["usage"] = usage_json(self.kind, usage);
                }
                body
            }
            StreamKind::Responses => {
                let mut body = json!({
                    "id": self.id.clone().unwrap_or_default(),
                    "object": "response",
                    "created_at": self.created.unwrap_or_default(),
                    "status": self.status.clone().unwrap_or_else(|| "completed".to_string()),
                    "model": self.model.clone().unwrap_or_default(),
                    "output": [{
                        "type": "message",
                        "role": "assistant",
                        "status": "completed",
                        "content": [{"type": "output_text", "text": self.content}],
                    }],
                });
                if let Some(usage) = self.usage {
                    body["usage"] = usage_json(self.kind, usage);
                }
                body
            }
        };
        BodyValue::Json(value)
    }
}

fn usage_json(kind: StreamKind, usage: StreamUsage) -> Value {
    match kind {
        StreamKind::Chat => json!({
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        }),
        StreamKind::Responses => json!({
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        }),
    }
}

/// Last-ditch usage scrape over the rolling raw tail: find the final
/// `"usage"` object and balance its braces. Covers upstreams whose trailing
/// event arrives malformed or outside a well-terminated frame.
fn scrape_usage_from_tail(tail: &[u8]) -> Option<StreamUsage> {
    let text = String::from_utf8_lossy(tail);
    let at = text.rfind("\"usage\"")?;
    let after = &text[at..];
    let open = after.find('{')?;
    let object = &after[open..];

    let mut depth = 0usize;
    let mut end = None;
    for (index, ch) in object.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    end = Some(index + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let object = &object[..end?];
    let value: Value = serde_json::from_str(object).ok()?;

    let field = |names: &[&str]| -> i64 {
        names
            .iter()
            .find_map(|name| value.get(*name).and_then(Value::as_i64))
            .unwrap_or(0)
    };
    Some(StreamUsage {
        prompt_tokens: field(&["prompt_tokens", "input_tokens"]),
        completion_tokens: field(&["completion_tokens", "output_tokens"]),
        total_tokens: field(&["total_tokens"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(scanner: &mut StreamScanner, frames: &str) {
        scanner.feed(&Bytes::copy_from_slice(frames.as_bytes()));
    }

    #[test]
    fn chat_stream_rebuilds_the_completion() {
        let mut scanner = StreamScanner::new(StreamKind::Chat);
        feed_all(
            &mut scanner,
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":5,\
             \"model\":\"gpt-4\",\"choices\":[{\"index\":0,\
             \"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"}}]}\n\n",
        );
        feed_all(
            &mut scanner,
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\
             \"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n",
        );
        feed_all(
            &mut scanner,
            "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\
             \"completion_tokens\":10,\"total_tokens\":15}}\n\ndata: [DONE]\n\n",
        );
        scanner.finish();

        assert_eq!(scanner.content, "Hello world");
        assert_eq!(
            scanner.usage,
            Some(StreamUsage {
                prompt_tokens: 5,
                completion_tokens: 10,
                total_tokens: 15
            })
        );

        let body = scanner.synthesize_body();
        let json = body.as_json().unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "gpt-4");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["usage"]["total_tokens"], 15);
    }

    #[test]
    fn frames_split_across_reads_still_parse() {
        let mut scanner = StreamScanner::new(StreamKind::Chat);
        let frame = "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\
                     \"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ab\"}}]}\n\n";
        let (left, right) = frame.split_at(frame.len() / 2);
        feed_all(&mut scanner, left);
        feed_all(&mut scanner, right);
        assert_eq!(scanner.content, "ab");
    }

    #[test]
    fn responses_stream_envelope_and_deltas() {
        let mut scanner = StreamScanner::new(StreamKind::Responses);
        feed_all(
            &mut scanner,
            "event: response.created\ndata: {\"type\":\"response.created\",\"response\":\
             {\"id\":\"resp_1\",\"object\":\"response\",\"created_at\":9,\
             \"status\":\"in_progress\",\"model\":\"m\",\"output\":[]}}\n\n",
        );
        feed_all(
            &mut scanner,
            "event: response.output_text.delta\ndata: {\"type\":\"response.output_text.delta\",\
             \"delta\":\"Hi\"}\n\n",
        );
        feed_all(
            &mut scanner,
            "event: response.completed\ndata: {\"type\":\"response.completed\",\"response\":\
             {\"id\":\"resp_1\",\"object\":\"response\",\"created_at\":9,\
             \"status\":\"completed\",\"model\":\"m\",\"output\":[],\
             \"usage\":{\"input_tokens\":3,\"output_tokens\":4,\"total_tokens\":7}}}\n\n",
        );
        scanner.finish();

        assert_eq!(scanner.content, "Hi");
        assert_eq!(scanner.status.as_deref(), Some("completed"));
        assert_eq!(scanner.usage.unwrap().total_tokens, 7);

        let body = scanner.synthesize_body();
        let json = body.as_json().unwrap();
        assert_eq!(json["object"], "response");
        assert_eq!(json["output"][0]["content"][0]["text"], "Hi");
        assert_eq!(json["usage"]["input_tokens"], 3);
    }

    #[test]
    fn content_cap_sets_truncated() {
        let mut scanner = StreamScanner::new(StreamKind::Chat);
        scanner.append_content(&"a".repeat(MAX_ACCUMULATED_CONTENT - 1));
        scanner.append_content("bcd");
        assert!(scanner.truncated);
        assert_eq!(scanner.content.len(), MAX_ACCUMULATED_CONTENT);
    }

    #[test]
    fn tail_scrape_recovers_unframed_usage() {
        let mut scanner = StreamScanner::new(StreamKind::Chat);
        // A final event the frame parser cannot decode still leaves its raw
        // bytes in the tail.
        feed_all(
            &mut scanner,
            "garbled \"usage\":{\"prompt_tokens\":2,\
             \"completion_tokens\":3,\"total_tokens\":5} trailing",
        );
        scanner.finish();
        assert_eq!(
            scanner.usage,
            Some(StreamUsage {
                prompt_tokens: 2,
                completion_tokens: 3,
                total_tokens: 5
            })
        );
    }

    #[test]
    fn unknown_events_are_ignored() {
        let mut scanner = StreamScanner::new(StreamKind::Responses);
        feed_all(&mut scanner, "data: {\"type\":\"response.ping\"}\n\n");
        feed_all(&mut scanner, "data: not-json\n\n");
        scanner.finish();
        assert!(scanner.content.is_empty());
    }
}
