use async_trait::async_trait;

use gomodel_client::ByteStream;
use gomodel_common::GatewayResult;
use gomodel_protocol::chat::{ChatCompletionRequest, ChatCompletionResponse};
use gomodel_protocol::embeddings::{EmbeddingsRequest, EmbeddingsResponse};
use gomodel_protocol::models::ModelEntry;
use gomodel_protocol::responses::{ResponsesRequest, ResponsesResponse};

/// One upstream behind the uniform capability set. Streaming methods return
/// the upstream SSE body for verbatim pass-through; adapters may translate
/// shapes where the upstream is not OpenAI-compatible.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Local name from the configuration (unique across the gateway).
    fn name(&self) -> &str;

    /// Upstream family, e.g. `openai`, `anthropic`, `gemini`, `ollama`.
    fn provider_type(&self) -> &str;

    async fn chat(&self, request: ChatCompletionRequest)
        -> GatewayResult<ChatCompletionResponse>;

    async fn chat_stream(&self, request: ChatCompletionRequest) -> GatewayResult<ByteStream>;

    async fn responses(&self, request: ResponsesRequest) -> GatewayResult<ResponsesResponse>;

    async fn responses_stream(&self, request: ResponsesRequest) -> GatewayResult<ByteStream>;

    async fn embeddings(&self, request: EmbeddingsRequest) -> GatewayResult<EmbeddingsResponse>;

    async fn list_models(&self) -> GatewayResult<Vec<ModelEntry>>;
}
