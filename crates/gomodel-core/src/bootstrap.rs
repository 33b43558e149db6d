use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio::task::JoinHandle;

use gomodel_client::HookSet;
use gomodel_protocol::models::ModelPricing;
use gomodel_provider::config::ResilienceDefaults;
use gomodel_provider::{ModelCache, ModelRegistry, RefreshHandle, build_provider};
use gomodel_storage::document::{DocumentAuditStore, DocumentBackend, DocumentUsageStore};
use gomodel_storage::relational::{RelationalAuditStore, RelationalBackend, RelationalUsageStore};
use gomodel_storage::{AuditLogger, LoggerConfig, Pricing, PricingTable, UsageLogger};

use crate::config::{GatewayConfig, PricingRule, StorageKind};
use crate::router::Router;

enum StorageHandles {
    Relational {
        backend: RelationalBackend,
        retention: JoinHandle<()>,
    },
    Document(DocumentBackend),
    Disabled,
}

/// Everything the HTTP surface needs, wired in startup order and torn down in
/// shutdown order.
pub struct Gateway {
    pub config: GatewayConfig,
    pub registry: Arc<ModelRegistry>,
    pub router: Arc<Router>,
    pub audit: Option<Arc<AuditLogger>>,
    pub usage: Option<Arc<UsageLogger>>,
    refresh: std::sync::Mutex<Option<RefreshHandle>>,
    storage: std::sync::Mutex<Option<StorageHandles>>,
    shutdown_started: AtomicBool,
}

/// Start-up order: hooks, cache, providers, registry (cache-primed, then
/// refreshed out of band), background refresh, storage, loggers, router.
pub async fn bootstrap(config: GatewayConfig, hooks: HookSet) -> anyhow::Result<Gateway> {
    let cache = ModelCache::new(&config.cache_dir);

    let defaults = ResilienceDefaults {
        retry: config.retry.clone(),
        breaker: config.breaker.clone(),
    };

    let registry = Arc::new(ModelRegistry::new(Some(cache)));
    let mut initialized = 0usize;
    for provider_config in &config.providers {
        match build_provider(provider_config.clone(), &defaults, hooks.clone()) {
            Ok(provider) => {
                tracing::info!(
                    provider = provider.name(),
                    provider_type = provider.provider_type(),
                    "provider registered"
                );
                registry.register(provider);
                initialized += 1;
            }
            Err(err) => {
                tracing::warn!(
                    provider = %provider_config.name,
                    %err,
                    "provider skipped"
                );
            }
        }
    }
    if initialized == 0 {
        anyhow::bail!("no providers initialized; set at least one provider api key");
    }

    let pricing_table = build_pricing_table(&config.pricing);
    registry.set_pricing(pricing_overlay(&config.pricing));
    registry.initialize_async();
    let refresh = registry.start_background_refresh(config.refresh_interval);

    let (audit, usage, storage) = if config.logging.enabled {
        let logger_config = LoggerConfig {
            buffer_size: config.logging.buffer_size,
            flush_interval: config.logging.flush_interval,
        };

        match config.storage.kind {
            StorageKind::Sqlite | StorageKind::Postgres => {
                let dsn = config
                    .relational_dsn()
                    .context("relational storage selected but no dsn configured")?;
                if config.storage.kind == StorageKind::Sqlite {
                    ensure_sqlite_parent(&config.storage.sqlite_path)?;
                }
                let backend = RelationalBackend::connect(&dsn)
                    .await
                    .context("connect log storage")?;
                backend.sync().await.context("sync log schema")?;
                let retention = backend.spawn_retention_sweeper(config.logging.retention_days);

                let audit = Arc::new(AuditLogger::new(
                    Arc::new(RelationalAuditStore::new(backend.clone())),
                    logger_config.clone(),
                ));
                let usage = Arc::new(UsageLogger::new(
                    Arc::new(RelationalUsageStore::new(backend.clone())),
                    logger_config,
                    pricing_table.clone(),
                ));
                (
                    Some(audit),
                    Some(usage),
                    StorageHandles::Relational { backend, retention },
                )
            }
            StorageKind::MongoDb => {
                let uri = config
                    .storage
                    .mongodb_uri
                    .as_deref()
                    .context("mongodb storage selected but MONGODB_URI is unset")?;
                let backend = DocumentBackend::connect(uri, &config.storage.mongodb_database)
                    .await
                    .context("connect log storage")?;
                backend
                    .ensure_indexes(config.logging.retention_days)
                    .await
                    .context("create log indexes")?;

                let audit = Arc::new(AuditLogger::new(
                    Arc::new(DocumentAuditStore::new(backend.clone())),
                    logger_config.clone(),
                ));
                let usage = Arc::new(UsageLogger::new(
                    Arc::new(DocumentUsageStore::new(backend.clone())),
                    logger_config,
                    pricing_table.clone(),
                ));
                (Some(audit), Some(usage), StorageHandles::Document(backend))
            }
        }
    } else {
        (None, None, StorageHandles::Disabled)
    };

    let router = Arc::new(Router::new(registry.clone()));

    Ok(Gateway {
        config,
        registry,
        router,
        audit,
        usage,
        refresh: std::sync::Mutex::new(Some(refresh)),
        storage: std::sync::Mutex::new(Some(storage)),
        shutdown_started: AtomicBool::new(false),
    })
}

fn build_pricing_table(rules: &[PricingRule]) -> Option<PricingTable> {
    if rules.is_empty() {
        return None;
    }
    let mut table = PricingTable::new();
    for rule in rules {
        table.insert(
            rule.model.clone(),
            rule.provider.clone(),
            Pricing {
                input_per_million: rule.input_per_million,
                output_per_million: rule.output_per_million,
            },
        );
    }
    Some(table)
}

/// The same rules, shaped as the per-model metadata the registry attaches to
/// `GET /v1/models` entries.
fn pricing_overlay(rules: &[PricingRule]) -> HashMap<String, ModelPricing> {
    rules
        .iter()
        .map(|rule| {
            (
                rule.model.clone(),
                ModelPricing {
                    input_per_million: Some(rule.input_per_million),
                    output_per_million: Some(rule.output_per_million),
                    ..ModelPricing::default()
                },
            )
        })
        .collect()
}

fn ensure_sqlite_parent(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create sqlite directory {}", parent.display()))?;
    }
    Ok(())
}

impl Gateway {
    /// Shutdown order: stop background refresh, close usage then audit
    /// (each drains and flushes), then the storage connections. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("stopping background refresh");
        let refresh = {
            let mut guard = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(refresh) = refresh {
            refresh.stop().await;
        }

        if let Some(usage) = &self.usage {
            tracing::info!("draining usage logger");
            usage.close().await;
        }
        if let Some(audit) = &self.audit {
            tracing::info!("draining audit logger");
            audit.close().await;
        }

        let storage = {
            let mut guard = self.storage.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        match storage {
            Some(StorageHandles::Relational { backend, retention }) => {
                retention.abort();
                if let Err(err) = backend.close().await {
                    tracing::warn!(%err, "storage close failed");
                }
            }
            Some(StorageHandles::Document(backend)) => {
                backend.close().await;
            }
            Some(StorageHandles::Disabled) | None => {}
        }

        tracing::info!("shutdown complete");
    }
}
