use std::collections::HashMap;
use std::sync::Arc;

use gomodel_client::{BreakerConfig, HookSet, LlmClient, LlmClientConfig, RetryConfig};
use gomodel_common::{GatewayError, GatewayResult};

use crate::anthropic::AnthropicProvider;
use crate::gemini::GeminiProvider;
use crate::openai::OpenAiProvider;
use crate::provider::Provider;

/// One provider entry from the configuration. Immutable after load.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub provider_type: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub retry: Option<RetryConfig>,
    pub breaker: Option<BreakerConfig>,
}

/// Defaults applied where a provider entry has no override.
#[derive(Debug, Clone, Default)]
pub struct ResilienceDefaults {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

pub fn default_base_url(provider_type: &str) -> Option<&'static str> {
    match provider_type {
        "openai" => Some("https://api.openai.com/v1"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "xai" => Some("https://api.x.ai/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        _ => None,
    }
}

fn requires_api_key(provider_type: &str) -> bool {
    provider_type != "ollama"
}

struct BuildInput {
    config: ProviderConfig,
    client: LlmClient,
}

type Constructor = fn(BuildInput) -> Arc<dyn Provider>;

/// Explicit constructor registry: type string → constructor, populated at
/// startup rather than through global registration side effects.
pub struct ProviderFactory {
    constructors: HashMap<&'static str, Constructor>,
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProviderFactory {
    pub fn builtin() -> Self {
        let mut constructors: HashMap<&'static str, Constructor> = HashMap::new();
        constructors.insert("openai", |input| {
            Arc::new(OpenAiProvider::new(
                input.config.name,
                "openai",
                input.client,
                true,
            ))
        });
        constructors.insert("groq", |input| {
            Arc::new(OpenAiProvider::new(
                input.config.name,
                "groq",
                input.client,
                false,
            ))
        });
        constructors.insert("xai", |input| {
            Arc::new(OpenAiProvider::new(
                input.config.name,
                "xai",
                input.client,
                false,
            ))
        });
        constructors.insert("ollama", |input| {
            Arc::new(OpenAiProvider::new(
                input.config.name,
                "ollama",
                input.client,
                false,
            ))
        });
        constructors.insert("anthropic", |input| {
            Arc::new(AnthropicProvider::new(input.config.name, input.client))
        });
        constructors.insert("gemini", |input| {
            Arc::new(GeminiProvider::new(input.config.name, input.client))
        });
        Self { constructors }
    }

    pub fn supported_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.constructors.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn build(
        &self,
        config: ProviderConfig,
        defaults: &ResilienceDefaults,
        hooks: HookSet,
    ) -> GatewayResult<Arc<dyn Provider>> {
        let constructor = self
            .constructors
            .get(config.provider_type.as_str())
            .ok_or_else(|| {
                GatewayError::internal(format!(
                    "unknown provider type {} for provider {}",
                    config.provider_type, config.name
                ))
            })?;

        if requires_api_key(&config.provider_type) && config.api_key.is_none() {
            return Err(GatewayError::internal(format!(
                "provider {} is missing an api key",
                config.name
            )));
        }

        let base_url = config
            .base_url
            .clone()
            .or_else(|| default_base_url(&config.provider_type).map(str::to_string))
            .ok_or_else(|| {
                GatewayError::internal(format!(
                    "provider {} has no base url",
                    config.name
                ))
            })?;

        let mut client_config = LlmClientConfig::new(base_url);
        client_config.retry = config.retry.clone().unwrap_or_else(|| defaults.retry.clone());
        client_config.breaker = config
            .breaker
            .clone()
            .unwrap_or_else(|| defaults.breaker.clone());

        let header_fn = auth_headers(&config.provider_type, config.api_key.clone());
        let client = LlmClient::new(
            config.provider_type.clone(),
            client_config,
            header_fn,
            hooks,
        )?;

        Ok(constructor(BuildInput { config, client }))
    }
}

fn auth_headers(
    provider_type: &str,
    api_key: Option<String>,
) -> Arc<dyn Fn(&mut Vec<(String, String)>) + Send + Sync> {
    let provider_type = provider_type.to_string();
    Arc::new(move |headers| {
        let Some(key) = api_key.as_deref() else {
            return;
        };
        match provider_type.as_str() {
            "anthropic" => {
                headers.push(("x-api-key".to_string(), key.to_string()));
                headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
                headers.push(("authorization".to_string(), format!("Bearer {key}")));
            }
            "gemini" => {
                headers.push(("x-goog-api-key".to_string(), key.to_string()));
                headers.push(("authorization".to_string(), format!("Bearer {key}")));
            }
            _ => {
                headers.push(("authorization".to_string(), format!("Bearer {key}")));
            }
        }
    })
}

/// Convenience wrapper used by bootstrap.
pub fn build_provider(
    config: ProviderConfig,
    defaults: &ResilienceDefaults,
    hooks: HookSet,
) -> GatewayResult<Arc<dyn Provider>> {
    ProviderFactory::builtin().build(config, defaults, hooks)
}
