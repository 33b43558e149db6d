use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use gomodel_client::client::HttpMethod;
use gomodel_client::{ByteStream, LlmClient};
use gomodel_common::{GatewayError, GatewayResult};
use gomodel_protocol::chat::{ChatCompletionRequest, ChatCompletionResponse};
use gomodel_protocol::embeddings::{EmbeddingsRequest, EmbeddingsResponse};
use gomodel_protocol::models::ModelEntry;
use gomodel_protocol::responses::{ResponsesRequest, ResponsesResponse};

use crate::provider::Provider;
use crate::translate;

/// Anthropic adapter. Chat and streaming go through the upstream's
/// OpenAI-compatible surface; model listing uses the native endpoint with
/// `after_id` pagination; Responses is chat translation; embeddings are not
/// offered upstream.
pub struct AnthropicProvider {
    name: String,
    client: LlmClient,
}

const LIST_PAGE_LIMIT: u32 = 100;

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, client: LlmClient) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> &str {
        "anthropic"
    }

    async fn chat(
        &self,
        request: ChatCompletionRequest,
    ) -> GatewayResult<ChatCompletionResponse> {
        let body = serde_json::to_value(&request)
            .map_err(|err| GatewayError::internal(format!("encode chat request: {err}")))?;
        self.client
            .request_json(HttpMethod::Post, "/chat/completions", Some(&body))
            .await
    }

    async fn chat_stream(&self, mut request: ChatCompletionRequest) -> GatewayResult<ByteStream> {
        request.stream = Some(true);
        request.ensure_stream_usage();
        let body = serde_json::to_value(&request)
            .map_err(|err| GatewayError::internal(format!("encode chat request: {err}")))?;
        self.client.stream("/chat/completions", &body).await
    }

    async fn responses(&self, request: ResponsesRequest) -> GatewayResult<ResponsesResponse> {
        let chat = self.chat(translate::responses_request_to_chat(&request)).await?;
        Ok(translate::chat_response_to_responses(chat))
    }

    async fn responses_stream(&self, request: ResponsesRequest) -> GatewayResult<ByteStream> {
        let mut chat = translate::responses_request_to_chat(&request);
        chat.stream = Some(true);
        let upstream = self.chat_stream(chat).await?;
        Ok(translate::chat_stream_to_responses(upstream))
    }

    async fn embeddings(&self, _request: EmbeddingsRequest) -> GatewayResult<EmbeddingsResponse> {
        Err(GatewayError::invalid_request(
            "embeddings are not supported by provider anthropic",
        ))
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelEntry>> {
        let mut entries = Vec::new();
        let mut after_id: Option<String> = None;

        loop {
            let path = match &after_id {
                Some(id) => format!("/models?limit={LIST_PAGE_LIMIT}&after_id={id}"),
                None => format!("/models?limit={LIST_PAGE_LIMIT}"),
            };
            let page: NativeModelPage = self
                .client
                .request_json(HttpMethod::Get, &path, None)
                .await?;

            for model in &page.data {
                let mut entry = ModelEntry::new(&model.id, "anthropic");
                entry.display_name = model.display_name.clone();
                entry.created = model
                    .created_at
                    .as_deref()
                    .and_then(|stamp| OffsetDateTime::parse(stamp, &Rfc3339).ok())
                    .map(OffsetDateTime::unix_timestamp)
                    .unwrap_or_default();
                entries.push(entry);
            }

            if !page.has_more {
                break;
            }
            after_id = page.last_id.or_else(|| page.data.last().map(|m| m.id.clone()));
            if after_id.is_none() {
                break;
            }
        }

        Ok(entries)
    }
}

#[derive(Debug, Deserialize)]
struct NativeModelPage {
    #[serde(default)]
    data: Vec<NativeModel>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NativeModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(flatten)]
    _extra: Map<String, Value>,
}
