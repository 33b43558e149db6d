use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use gomodel_client::{BreakerConfig, RetryConfig};
use gomodel_provider::ProviderConfig;
use gomodel_provider::config::default_base_url;

const YAML_CANDIDATES: &[&str] = &["config/config.yaml", "./config.yaml"];

const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Provider types that can be configured purely through environment
/// variables, paired with their API-key variable (ollama needs none).
const ENV_PROVIDERS: &[(&str, Option<&str>, &str)] = &[
    ("openai", Some("OPENAI_API_KEY"), "OPENAI_BASE_URL"),
    ("anthropic", Some("ANTHROPIC_API_KEY"), "ANTHROPIC_BASE_URL"),
    ("gemini", Some("GEMINI_API_KEY"), "GEMINI_BASE_URL"),
    ("groq", Some("GROQ_API_KEY"), "GROQ_BASE_URL"),
    ("xai", Some("XAI_API_KEY"), "XAI_BASE_URL"),
    ("ollama", None, "OLLAMA_BASE_URL"),
];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Empty means no auth (unsafe; meant for local use).
    pub master_key: Option<String>,
    pub cache_dir: PathBuf,
    pub body_limit_bytes: usize,
    pub refresh_interval: Duration,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub providers: Vec<ProviderConfig>,
    pub pricing: Vec<PricingRule>,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
}

/// Per-million-token rates for one (model, provider-type) pair, used for
/// usage cost computation and surfaced as model metadata. YAML-only; there
/// is no sane environment-variable encoding for a rate table.
#[derive(Debug, Clone)]
pub struct PricingRule {
    pub model: String,
    pub provider: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_bodies: bool,
    pub log_headers: bool,
    pub buffer_size: usize,
    pub flush_interval: Duration,
    pub retention_days: u32,
    pub only_model_interactions: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_bodies: false,
            log_headers: false,
            buffer_size: 1000,
            flush_interval: Duration::from_secs(5),
            retention_days: 30,
            only_model_interactions: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Sqlite,
    Postgres,
    MongoDb,
}

impl StorageKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "postgresql" | "postgres" => Some(Self::Postgres),
            "mongodb" => Some(Self::MongoDb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub sqlite_path: PathBuf,
    pub postgres_dsn: Option<String>,
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Sqlite,
            sqlite_path: PathBuf::from("./.cache/gomodel.db"),
            postgres_dsn: None,
            mongodb_uri: None,
            mongodb_database: "gomodel".to_string(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            master_key: None,
            cache_dir: PathBuf::from("./.cache"),
            body_limit_bytes: DEFAULT_BODY_LIMIT,
            refresh_interval: Duration::from_secs(3600),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            providers: Vec::new(),
            pricing: Vec::new(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Three-layer merge: built-in defaults ← YAML file ← environment.
    pub fn load() -> anyhow::Result<Self> {
        let yaml = read_yaml_file()?;
        let env: HashMap<String, String> = std::env::vars().collect();
        Ok(Self::from_layers(yaml, &env))
    }

    pub fn from_layers(yaml: Option<RawConfig>, env: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = yaml {
            config.apply_yaml(raw, env);
        }
        config.apply_env(env);
        config.append_env_providers(env);
        config
    }

    fn apply_yaml(&mut self, raw: RawConfig, env: &HashMap<String, String>) {
        if let Some(server) = raw.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.port {
                self.port = port;
            }
            if let Some(limit) = server.body_limit_bytes {
                self.body_limit_bytes = limit;
            }
        }
        if let Some(key) = raw.master_key
            && let Some(key) = resolve_placeholders(&key, env)
            && !key.is_empty()
        {
            self.master_key = Some(key);
        }
        if let Some(dir) = raw.cache_dir {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(secs) = raw.model_refresh_interval_secs {
            self.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(retry) = raw.retry {
            retry.apply(&mut self.retry);
        }
        if let Some(breaker) = raw.circuit_breaker {
            breaker.apply(&mut self.breaker);
        }
        if let Some(logging) = raw.logging {
            logging.apply(&mut self.logging);
        }
        if let Some(storage) = raw.storage {
            storage.apply(&mut self.storage);
        }
        for provider in raw.providers.unwrap_or_default() {
            // An unresolved ${VAR} anywhere in the entry drops it silently.
            let Some(provider) = provider.resolve(env) else {
                continue;
            };
            self.providers.push(provider);
        }
        for rule in raw.pricing.unwrap_or_default() {
            self.pricing.push(PricingRule {
                model: rule.model,
                provider: rule.provider,
                input_per_million: rule.input_per_million,
                output_per_million: rule.output_per_million,
            });
        }
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) {
        if let Some(host) = non_empty(env.get("GOMODEL_HOST")) {
            self.host = host;
        }
        if let Some(port) = parse_env(env, "GOMODEL_PORT") {
            self.port = port;
        }
        if let Some(key) = non_empty(env.get("GOMODEL_MASTER_KEY")) {
            self.master_key = Some(key);
        }
        if let Some(dir) = non_empty(env.get("GOMODEL_CACHE_DIR")) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(limit) = parse_env(env, "GOMODEL_BODY_LIMIT_BYTES") {
            self.body_limit_bytes = limit;
        }
        if let Some(secs) = parse_env::<u64>(env, "MODEL_REFRESH_INTERVAL") {
            self.refresh_interval = Duration::from_secs(secs);
        }

        if let Some(value) = parse_env(env, "RETRY_MAX_RETRIES") {
            self.retry.max_retries = value;
        }
        if let Some(secs) = parse_env::<f64>(env, "RETRY_INITIAL_BACKOFF") {
            self.retry.initial_backoff = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = parse_env::<f64>(env, "RETRY_MAX_BACKOFF") {
            self.retry.max_backoff = Duration::from_secs_f64(secs);
        }
        if let Some(value) = parse_env(env, "RETRY_BACKOFF_FACTOR") {
            self.retry.backoff_factor = value;
        }
        if let Some(value) = parse_env(env, "RETRY_JITTER_FACTOR") {
            self.retry.jitter_factor = value;
        }

        if let Some(value) = parse_env(env, "CIRCUIT_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = value;
        }
        if let Some(value) = parse_env(env, "CIRCUIT_BREAKER_SUCCESS_THRESHOLD") {
            self.breaker.success_threshold = value;
        }
        if let Some(secs) = parse_env::<f64>(env, "CIRCUIT_BREAKER_TIMEOUT") {
            self.breaker.timeout = Duration::from_secs_f64(secs);
        }

        if let Some(value) = parse_bool(env, "LOGGING_ENABLED") {
            self.logging.enabled = value;
        }
        if let Some(value) = parse_bool(env, "LOGGING_BODIES") {
            self.logging.log_bodies = value;
        }
        if let Some(value) = parse_bool(env, "LOGGING_HEADERS") {
            self.logging.log_headers = value;
        }
        if let Some(value) = parse_env(env, "BUFFER_SIZE") {
            self.logging.buffer_size = value;
        }
        if let Some(secs) = parse_env::<u64>(env, "FLUSH_INTERVAL") {
            self.logging.flush_interval = Duration::from_secs(secs);
        }
        if let Some(value) = parse_env(env, "RETENTION_DAYS") {
            self.logging.retention_days = value;
        }
        if let Some(value) = parse_bool(env, "ONLY_MODEL_INTERACTIONS") {
            self.logging.only_model_interactions = value;
        }

        if let Some(kind) = non_empty(env.get("STORAGE_TYPE")).and_then(|v| StorageKind::parse(&v))
        {
            self.storage.kind = kind;
        }
        if let Some(path) = non_empty(env.get("SQLITE_PATH")) {
            self.storage.sqlite_path = PathBuf::from(path);
        }
        if let Some(dsn) = non_empty(env.get("POSTGRES_DSN")) {
            self.storage.postgres_dsn = Some(dsn);
        }
        if let Some(uri) = non_empty(env.get("MONGODB_URI")) {
            self.storage.mongodb_uri = Some(uri);
        }
        if let Some(db) = non_empty(env.get("MONGODB_DATABASE")) {
            self.storage.mongodb_database = db;
        }
    }

    /// Environment-only provider entries for types the YAML did not declare.
    fn append_env_providers(&mut self, env: &HashMap<String, String>) {
        for (provider_type, key_var, base_url_var) in ENV_PROVIDERS {
            if self
                .providers
                .iter()
                .any(|provider| provider.provider_type == *provider_type)
            {
                continue;
            }

            let api_key = key_var.and_then(|var| non_empty(env.get(var)));
            if key_var.is_some() && api_key.is_none() {
                continue;
            }
            let base_url = non_empty(env.get(*base_url_var));
            if *provider_type == "ollama" && base_url.is_none() {
                // Ollama is opt-in: no key to signal intent, so the base URL
                // (even the default one, set explicitly) is the signal.
                continue;
            }

            self.providers.push(ProviderConfig {
                name: provider_type.to_string(),
                provider_type: provider_type.to_string(),
                base_url: base_url
                    .or_else(|| default_base_url(provider_type).map(str::to_string)),
                api_key,
                retry: None,
                breaker: None,
            });
        }
    }

    /// The relational DSN (sqlite/postgres) for the configured backend.
    pub fn relational_dsn(&self) -> Option<String> {
        match self.storage.kind {
            StorageKind::Sqlite => Some(format!(
                "sqlite://{}?mode=rwc",
                self.storage.sqlite_path.display()
            )),
            StorageKind::Postgres => self.storage.postgres_dsn.clone(),
            StorageKind::MongoDb => None,
        }
    }
}

fn read_yaml_file() -> anyhow::Result<Option<RawConfig>> {
    for candidate in YAML_CANDIDATES {
        let path = PathBuf::from(candidate);
        if !path.exists() {
            continue;
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("read config file {candidate}"))?;
        let raw: RawConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parse config file {candidate}"))?;
        return Ok(Some(raw));
    }
    Ok(None)
}

/// Replace every `${VAR}` with its environment value; `None` when any
/// variable is missing or empty.
fn resolve_placeholders(input: &str, env: &HashMap<String, String>) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find('}')?;
        let var = &tail[..end];
        let value = env.get(var).filter(|value| !value.is_empty())?;
        out.push_str(value);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(env: &HashMap<String, String>, key: &str) -> Option<T> {
    non_empty(env.get(key)).and_then(|value| value.parse().ok())
}

fn parse_bool(env: &HashMap<String, String>, key: &str) -> Option<bool> {
    non_empty(env.get(key)).map(|value| {
        matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

// Raw YAML shapes; every field optional so partial files overlay cleanly.

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub server: Option<RawServer>,
    pub master_key: Option<String>,
    pub cache_dir: Option<String>,
    pub model_refresh_interval_secs: Option<u64>,
    pub retry: Option<RawRetry>,
    pub circuit_breaker: Option<RawBreaker>,
    pub logging: Option<RawLogging>,
    pub storage: Option<RawStorage>,
    pub providers: Option<Vec<RawProvider>>,
    pub pricing: Option<Vec<RawPricing>>,
}

#[derive(Debug, Deserialize)]
pub struct RawPricing {
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawServer {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub body_limit_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawRetry {
    pub max_retries: Option<u32>,
    pub initial_backoff_secs: Option<f64>,
    pub max_backoff_secs: Option<f64>,
    pub backoff_factor: Option<f64>,
    pub jitter_factor: Option<f64>,
}

impl RawRetry {
    fn apply(&self, retry: &mut RetryConfig) {
        if let Some(value) = self.max_retries {
            retry.max_retries = value;
        }
        if let Some(secs) = self.initial_backoff_secs {
            retry.initial_backoff = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = self.max_backoff_secs {
            retry.max_backoff = Duration::from_secs_f64(secs);
        }
        if let Some(value) = self.backoff_factor {
            retry.backoff_factor = value;
        }
        if let Some(value) = self.jitter_factor {
            retry.jitter_factor = value;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawBreaker {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub timeout_secs: Option<f64>,
}

impl RawBreaker {
    fn apply(&self, breaker: &mut BreakerConfig) {
        if let Some(value) = self.failure_threshold {
            breaker.failure_threshold = value;
        }
        if let Some(value) = self.success_threshold {
            breaker.success_threshold = value;
        }
        if let Some(secs) = self.timeout_secs {
            breaker.timeout = Duration::from_secs_f64(secs);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawLogging {
    pub enabled: Option<bool>,
    pub log_bodies: Option<bool>,
    pub log_headers: Option<bool>,
    pub buffer_size: Option<usize>,
    pub flush_interval_secs: Option<u64>,
    pub retention_days: Option<u32>,
    pub only_model_interactions: Option<bool>,
}

impl RawLogging {
    fn apply(&self, logging: &mut LoggingConfig) {
        if let Some(value) = self.enabled {
            logging.enabled = value;
        }
        if let Some(value) = self.log_bodies {
            logging.log_bodies = value;
        }
        if let Some(value) = self.log_headers {
            logging.log_headers = value;
        }
        if let Some(value) = self.buffer_size {
            logging.buffer_size = value;
        }
        if let Some(secs) = self.flush_interval_secs {
            logging.flush_interval = Duration::from_secs(secs);
        }
        if let Some(value) = self.retention_days {
            logging.retention_days = value;
        }
        if let Some(value) = self.only_model_interactions {
            logging.only_model_interactions = value;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawStorage {
    pub r#type: Option<String>,
    pub sqlite_path: Option<String>,
    pub postgres_dsn: Option<String>,
    pub mongodb_uri: Option<String>,
    pub mongodb_database: Option<String>,
}

impl RawStorage {
    fn apply(&self, storage: &mut StorageConfig) {
        if let Some(kind) = self.r#type.as_deref().and_then(StorageKind::parse) {
            storage.kind = kind;
        }
        if let Some(path) = &self.sqlite_path {
            storage.sqlite_path = PathBuf::from(path);
        }
        if let Some(dsn) = &self.postgres_dsn {
            storage.postgres_dsn = Some(dsn.clone());
        }
        if let Some(uri) = &self.mongodb_uri {
            storage.mongodb_uri = Some(uri.clone());
        }
        if let Some(db) = &self.mongodb_database {
            storage.mongodb_database = db.clone();
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RawProvider {
    pub name: Option<String>,
    pub r#type: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_retries: Option<u32>,
    pub failure_threshold: Option<u32>,
}

impl RawProvider {
    fn resolve(self, env: &HashMap<String, String>) -> Option<ProviderConfig> {
        let api_key = match self.api_key {
            Some(raw) => Some(resolve_placeholders(&raw, env)?),
            None => None,
        };
        let base_url = match self.base_url {
            Some(raw) => Some(resolve_placeholders(&raw, env)?),
            None => None,
        };

        let retry = self.max_retries.map(|max_retries| RetryConfig {
            max_retries,
            ..RetryConfig::default()
        });
        let breaker = self.failure_threshold.map(|failure_threshold| BreakerConfig {
            failure_threshold,
            ..BreakerConfig::default()
        });

        Some(ProviderConfig {
            name: self.name.unwrap_or_else(|| self.r#type.clone()),
            provider_type: self.r#type,
            base_url,
            api_key,
            retry,
            breaker,
        })
    }
}
