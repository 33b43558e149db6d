use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use gomodel_protocol::models::{ModelEntry, ModelPricing, ModelsResponse};

use crate::cache::{CacheRecord, CachedModel, ModelCache};
use crate::provider::Provider;

/// Process-wide model-id → provider map. Readers never observe a torn map:
/// refresh rebuilds off-lock and installs the result with single assignments
/// inside a short write section.
pub struct ModelRegistry {
    inner: RwLock<Inner>,
    cache: Option<ModelCache>,
}

#[derive(Default)]
struct Inner {
    providers: Vec<Arc<dyn Provider>>,
    provider_models: HashMap<String, Vec<ModelEntry>>,
    models_by_id: HashMap<String, String>,
    pricing: HashMap<String, ModelPricing>,
}

impl ModelRegistry {
    pub fn new(cache: Option<ModelCache>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            cache,
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.providers.push(provider);
    }

    /// Configured per-model rates, stamped onto refreshed entries whose
    /// upstream listing carries no pricing of its own.
    pub fn set_pricing(&self, pricing: HashMap<String, ModelPricing>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.pricing = pricing;
    }

    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.providers.clone()
    }

    pub fn lookup(&self, model: &str) -> Option<Arc<dyn Provider>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let provider_name = inner.models_by_id.get(model)?;
        inner
            .providers
            .iter()
            .find(|provider| provider.name() == provider_name)
            .cloned()
    }

    pub fn supports(&self, model: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.models_by_id.contains_key(model)
    }

    pub fn provider_type_of(&self, model: &str) -> Option<String> {
        self.lookup(model)
            .map(|provider| provider.provider_type().to_string())
    }

    /// OpenAI-format listing across providers, deterministically sorted.
    pub fn snapshot(&self) -> ModelsResponse {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let models = inner
            .provider_models
            .values()
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        ModelsResponse::new(models)
    }

    pub fn model_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.models_by_id.len()
    }

    /// Ask every provider for its models. A provider failure keeps its
    /// previous slice; the combined map is rebuilt and swapped once.
    pub async fn refresh(&self) {
        let (providers, pricing) = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            (inner.providers.clone(), inner.pricing.clone())
        };

        let mut refreshed: HashMap<String, Vec<ModelEntry>> = HashMap::new();
        for provider in &providers {
            match provider.list_models().await {
                Ok(mut models) => {
                    for model in &mut models {
                        model.provider_name = provider.name().to_string();
                        model.provider_type = provider.provider_type().to_string();
                        if model.pricing.is_none()
                            && let Some(rates) = pricing.get(&model.id)
                        {
                            model.pricing = Some(rates.clone());
                        }
                    }
                    refreshed.insert(provider.name().to_string(), models);
                }
                Err(err) => {
                    tracing::warn!(
                        provider = provider.name(),
                        %err,
                        "model refresh failed; keeping previous models"
                    );
                }
            }
        }

        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            for (name, models) in refreshed {
                inner.provider_models.insert(name, models);
            }
            let combined = build_model_map(&inner.providers, &inner.provider_models);
            inner.models_by_id = combined;
        }

        self.persist_cache();
        tracing::debug!(models = self.model_count(), "model registry refreshed");
    }

    /// Publish the persisted cache as the initial snapshot, then refresh out
    /// of band; the refresh result supersedes the cache when it lands.
    pub fn initialize_async(self: &Arc<Self>) {
        if let Some(record) = self.cache.as_ref().and_then(ModelCache::load) {
            let mut by_provider: HashMap<String, Vec<ModelEntry>> = HashMap::new();
            for cached in record.models {
                let entry = cached.into_entry();
                by_provider
                    .entry(entry.provider_name.clone())
                    .or_default()
                    .push(entry);
            }

            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let registered: Vec<String> = inner
                .providers
                .iter()
                .map(|provider| provider.name().to_string())
                .collect();
            // Cached entries for providers that no longer exist cannot route.
            by_provider.retain(|name, _| registered.iter().any(|r| r == name));
            inner.provider_models = by_provider;
            let combined = build_model_map(&inner.providers, &inner.provider_models);
            inner.models_by_id = combined;
            let published = inner.models_by_id.len();
            drop(inner);
            tracing::info!(models = published, "model registry primed from cache");
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.refresh().await;
        });
    }

    pub fn start_background_refresh(self: &Arc<Self>, interval: Duration) -> RefreshHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let registry = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; initialize_async already
            // covers startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.refresh().await;
                    }
                    result = stop_rx.changed() => {
                        if result.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        RefreshHandle {
            stop_tx,
            handle,
        }
    }

    fn persist_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };

        let record = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            let models: Vec<CachedModel> = inner
                .provider_models
                .values()
                .flatten()
                .map(CachedModel::from_entry)
                .collect();
            let listing: Value = serde_json::to_value(&inner.provider_models)
                .unwrap_or(Value::Null);
            CacheRecord::new(models, listing)
        };

        if let Err(err) = cache.store(&record) {
            tracing::warn!(path = %cache.path().display(), %err, "model cache write failed");
        }
    }
}

/// Combined map in provider registration order; on collision the last writer
/// wins and we say so.
fn build_model_map(
    providers: &[Arc<dyn Provider>],
    provider_models: &HashMap<String, Vec<ModelEntry>>,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for provider in providers {
        let Some(models) = provider_models.get(provider.name()) else {
            continue;
        };
        for model in models {
            if let Some(previous) =
                map.insert(model.id.clone(), provider.name().to_string())
                && previous != provider.name()
            {
                tracing::warn!(
                    model = %model.id,
                    previous = %previous,
                    winner = provider.name(),
                    "model id registered by multiple providers"
                );
            }
        }
    }
    map
}

/// Stop handle for the periodic refresh task.
pub struct RefreshHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}
