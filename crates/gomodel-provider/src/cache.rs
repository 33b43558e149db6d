use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use gomodel_protocol::models::ModelEntry;

pub const CACHE_VERSION: u32 = 1;

/// Persisted registry snapshot: `<cache-dir>/models.json`. Lets the gateway
/// serve traffic immediately on restart while the first refresh runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub version: u32,
    pub updated_at: i64,
    pub models: Vec<CachedModel>,
    #[serde(default)]
    pub model_list_data: Value,
}

impl CacheRecord {
    pub fn new(models: Vec<CachedModel>, model_list_data: Value) -> Self {
        Self {
            version: CACHE_VERSION,
            updated_at: OffsetDateTime::now_utc().unix_timestamp(),
            models,
            model_list_data,
        }
    }
}

/// A model entry plus the routing fields the wire shape deliberately omits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedModel {
    pub provider_name: String,
    pub provider_type: String,
    #[serde(flatten)]
    pub entry: ModelEntry,
}

impl CachedModel {
    pub fn from_entry(entry: &ModelEntry) -> Self {
        Self {
            provider_name: entry.provider_name.clone(),
            provider_type: entry.provider_type.clone(),
            entry: entry.clone(),
        }
    }

    pub fn into_entry(self) -> ModelEntry {
        let mut entry = self.entry;
        entry.provider_name = self.provider_name;
        entry.provider_type = self.provider_type;
        entry
    }
}

#[derive(Debug, Clone)]
pub struct ModelCache {
    path: PathBuf,
}

impl ModelCache {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            path: cache_dir.as_ref().join("models.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or corrupt cache files are tolerated: the registry starts
    /// empty and the first refresh repopulates it.
    pub fn load(&self) -> Option<CacheRecord> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), %err, "model cache unreadable");
                return None;
            }
        };

        let record: CacheRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), %err, "model cache corrupt");
                return None;
            }
        };

        if record.version != CACHE_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                version = record.version,
                "model cache version mismatch"
            );
            return None;
        }

        Some(record)
    }

    /// Atomic rewrite: temp file in the same directory, then rename.
    pub fn store(&self, record: &CacheRecord) -> io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let payload = serde_json::to_vec_pretty(record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gomodel-cache-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(id: &str, provider: &str) -> ModelEntry {
        let mut entry = ModelEntry::new(id, provider);
        entry.provider_name = provider.to_string();
        entry.provider_type = "openai".to_string();
        entry
    }

    #[test]
    fn round_trips_models_with_routing_fields() {
        let dir = scratch_dir();
        let cache = ModelCache::new(&dir);

        let record = CacheRecord::new(
            vec![CachedModel::from_entry(&entry("gpt-4", "primary"))],
            serde_json::json!({"primary": {"object": "list"}}),
        );
        cache.store(&record).unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.version, CACHE_VERSION);
        let model = loaded.models.into_iter().next().unwrap().into_entry();
        assert_eq!(model.id, "gpt-4");
        assert_eq!(model.provider_name, "primary");
        assert_eq!(model.provider_type, "openai");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_and_corrupt_files_yield_none() {
        let dir = scratch_dir();
        let cache = ModelCache::new(&dir);
        assert!(cache.load().is_none());

        fs::write(cache.path(), b"{not json").unwrap();
        assert!(cache.load().is_none());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn version_mismatch_is_treated_as_corrupt() {
        let dir = scratch_dir();
        let cache = ModelCache::new(&dir);

        let mut record = CacheRecord::new(Vec::new(), Value::Null);
        record.version = 99;
        cache.store(&record).unwrap();
        assert!(cache.load().is_none());

        fs::remove_dir_all(&dir).ok();
    }
}
