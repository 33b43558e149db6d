use async_trait::async_trait;
use serde::Deserialize;

use gomodel_client::client::HttpMethod;
use gomodel_client::{ByteStream, LlmClient};
use gomodel_common::{GatewayError, GatewayResult};
use gomodel_protocol::chat::{ChatCompletionRequest, ChatCompletionResponse};
use gomodel_protocol::embeddings::{EmbeddingsRequest, EmbeddingsResponse};
use gomodel_protocol::models::ModelEntry;
use gomodel_protocol::responses::{ResponsesRequest, ResponsesResponse};

use crate::provider::Provider;
use crate::translate;

/// Google Gemini adapter. The client's base URL points at `/v1beta`; chat and
/// embeddings use the OpenAI-compatibility surface under `openai/`, model
/// listing uses the native endpoint with `pageToken` pagination post-filtered
/// to generation-capable models.
pub struct GeminiProvider {
    name: String,
    client: LlmClient,
}

const LIST_PAGE_SIZE: u32 = 100;

impl GeminiProvider {
    pub fn new(name: impl Into<String>, client: LlmClient) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> &str {
        "gemini"
    }

    async fn chat(
        &self,
        request: ChatCompletionRequest,
    ) -> GatewayResult<ChatCompletionResponse> {
        let body = serde_json::to_value(&request)
            .map_err(|err| GatewayError::internal(format!("encode chat request: {err}")))?;
        self.client
            .request_json(HttpMethod::Post, "/openai/chat/completions", Some(&body))
            .await
    }

    async fn chat_stream(&self, mut request: ChatCompletionRequest) -> GatewayResult<ByteStream> {
        request.stream = Some(true);
        request.ensure_stream_usage();
        let body = serde_json::to_value(&request)
            .map_err(|err| GatewayError::internal(format!("encode chat request: {err}")))?;
        self.client.stream("/openai/chat/completions", &body).await
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

    async fn embeddings(&self, request: EmbeddingsRequest) -> GatewayResult<EmbeddingsResponse> {
        let body = serde_json::to_value(&request)
            .map_err(|err| GatewayError::internal(format!("encode embeddings request: {err}")))?;
        self.client
            .request_json(HttpMethod::Post, "/openai/embeddings", Some(&body))
            .await
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelEntry>> {
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let path = match &page_token {
                Some(token) => format!("/models?pageSize={LIST_PAGE_SIZE}&pageToken={token}"),
                None => format!("/models?pageSize={LIST_PAGE_SIZE}"),
            };
            let page: NativeModelPage = self
                .client
                .request_json(HttpMethod::Get, &path, None)
                .await?;

            for model in page.models {
                // Only models that can actually serve generation requests.
                if !model
                    .supported_generation_methods
                    .iter()
                    .any(|method| method == "generateContent")
                {
                    continue;
                }
                let id = model
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&model.name)
                    .to_string();
                let mut entry = ModelEntry::new(id, "google");
                entry.display_name = model.display_name;
                entry.context_window = model.input_token_limit;
                entry.max_output_tokens = model.output_token_limit;
                entries.push(entry);
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(entries)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NativeModelPage {
    #[serde(default)]
    models: Vec<NativeModel>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NativeModel {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    input_token_limit: Option<i64>,
    #[serde(default)]
    output_token_limit: Option<i64>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}
