use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use gomodel_client::client::HttpMethod;
use gomodel_client::{ByteStream, LlmClient};
use gomodel_common::{GatewayError, GatewayResult};
use gomodel_protocol::chat::{ChatCompletionRequest, ChatCompletionResponse};
use gomodel_protocol::embeddings::{EmbeddingsRequest, EmbeddingsResponse};
use gomodel_protocol::models::ModelEntry;
use gomodel_protocol::responses::{ResponsesRequest, ResponsesResponse};

use crate::provider::Provider;
use crate::translate;

/// Adapter for any upstream that speaks the OpenAI REST dialect. Covers
/// openai itself plus groq, xai, and ollama; upstreams lacking a native
/// `/responses` endpoint get the Responses surface by chat translation.
pub struct OpenAiProvider {
    name: String,
    provider_type: String,
    client: LlmClient,
    native_responses: bool,
}

impl OpenAiProvider {
    pub fn new(
        name: impl Into<String>,
        provider_type: impl Into<String>,
        client: LlmClient,
        native_responses: bool,
    ) -> Self {
        Self {
            name: name.into(),
            provider_type: provider_type.into(),
            client,
            native_responses,
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> &str {
        &self.provider_type
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
        if self.native_responses {
            let body = serde_json::to_value(&request)
                .map_err(|err| GatewayError::internal(format!("encode responses request: {err}")))?;
            return self
                .client
                .request_json(HttpMethod::Post, "/responses", Some(&body))
                .await;
        }

        let chat = self.chat(translate::responses_request_to_chat(&request)).await?;
        Ok(translate::chat_response_to_responses(chat))
    }

    async fn responses_stream(&self, mut request: ResponsesRequest) -> GatewayResult<ByteStream> {
        if self.native_responses {
            request.stream = Some(true);
            let body = serde_json::to_value(&request)
                .map_err(|err| GatewayError::internal(format!("encode responses request: {err}")))?;
            return self.client.stream("/responses", &body).await;
        }

        let mut chat = translate::responses_request_to_chat(&request);
        chat.stream = Some(true);
        let upstream = self.chat_stream(chat).await?;
        Ok(translate::chat_stream_to_responses(upstream))
    }

    async fn embeddings(&self, request: EmbeddingsRequest) -> GatewayResult<EmbeddingsResponse> {
        let body = serde_json::to_value(&request)
            .map_err(|err| GatewayError::internal(format!("encode embeddings request: {err}")))?;
        self.client
            .request_json(HttpMethod::Post, "/embeddings", Some(&body))
            .await
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelEntry>> {
        let listing: ModelListing = self
            .client
            .request_json(HttpMethod::Get, "/models", None)
            .await?;
        Ok(listing
            .data
            .into_iter()
            .map(|model| ModelEntry {
                id: model.id,
                object: "model".to_string(),
                created: model.created,
                owned_by: model.owned_by,
                provider_name: String::new(),
                provider_type: String::new(),
                display_name: None,
                family: None,
                context_window: None,
                max_output_tokens: None,
                pricing: None,
                extra: model.extra,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    data: Vec<ListedModel>,
}

#[derive(Debug, Deserialize)]
struct ListedModel {
    id: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    owned_by: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}
