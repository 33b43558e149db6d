use std::sync::Arc;

use gomodel_client::ByteStream;
use gomodel_common::{GatewayError, GatewayResult};
use gomodel_protocol::chat::{ChatCompletionRequest, ChatCompletionResponse};
use gomodel_protocol::embeddings::{EmbeddingsRequest, EmbeddingsResponse};
use gomodel_protocol::models::ModelsResponse;
use gomodel_protocol::responses::{ResponsesRequest, ResponsesResponse};
use gomodel_provider::{ModelRegistry, Provider};

/// Pure dispatcher: look the model up in the registry and delegate the call
/// to its provider.
pub struct Router {
    registry: Arc<ModelRegistry>,
}

impl Router {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    fn provider_for(&self, model: &str) -> GatewayResult<Arc<dyn Provider>> {
        self.registry
            .lookup(model)
            .ok_or_else(|| GatewayError::invalid_request(format!("unsupported model: {model}")))
    }

    pub fn supports(&self, model: &str) -> bool {
        self.registry.supports(model)
    }

    pub fn provider_type(&self, model: &str) -> Option<String> {
        self.registry.provider_type_of(model)
    }

    /// Registry snapshot; upstreams are not consulted.
    pub fn list_models(&self) -> ModelsResponse {
        self.registry.snapshot()
    }

    pub async fn chat(
        &self,
        request: ChatCompletionRequest,
    ) -> GatewayResult<ChatCompletionResponse> {
        self.provider_for(&request.model)?.chat(request).await
    }

    pub async fn chat_stream(&self, request: ChatCompletionRequest) -> GatewayResult<ByteStream> {
        self.provider_for(&request.model)?.chat_stream(request).await
    }

    pub async fn responses(&self, request: ResponsesRequest) -> GatewayResult<ResponsesResponse> {
        self.provider_for(&request.model)?.responses(request).await
    }

    pub async fn responses_stream(&self, request: ResponsesRequest) -> GatewayResult<ByteStream> {
        self.provider_for(&request.model)?
            .responses_stream(request)
            .await
    }

    pub async fn embeddings(&self, request: EmbeddingsRequest) -> GatewayResult<EmbeddingsResponse> {
        self.provider_for(&request.model)?.embeddings(request).await
    }
}
