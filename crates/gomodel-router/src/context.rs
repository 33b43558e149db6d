use std::sync::{Arc, Mutex};

use bytes::Bytes;

use gomodel_core::Router;
use gomodel_storage::{AuditLogEntry, AuditLogger, UsageLogger};

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub audit: Option<Arc<AuditLogger>>,
    pub usage: Option<Arc<UsageLogger>>,
    pub master_key: Option<String>,
    pub body_limit_bytes: usize,
    pub log_bodies: bool,
    pub log_headers: bool,
    pub only_model_interactions: bool,
}

/// Request id, propagated on the request context and echoed in the response.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// The buffered request body; read once under the size limit and shared by
/// model validation, audit capture, and the handler.
#[derive(Debug, Clone)]
pub struct BufferedBody(pub Bytes);

/// Resolved provider type for the requested model.
#[derive(Debug, Clone)]
pub struct ProviderType(pub String);

/// The in-flight audit entry. The middleware creates it, validation and the
/// handler enrich it, and exactly one of middleware/stream-wrapper writes it.
#[derive(Clone)]
pub struct AuditHandle(pub Arc<Mutex<AuditLogEntry>>);

impl AuditHandle {
    pub fn new(entry: AuditLogEntry) -> Self {
        Self(Arc::new(Mutex::new(entry)))
    }

    pub fn update(&self, apply: impl FnOnce(&mut AuditLogEntry)) {
        let mut entry = self.0.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut entry);
    }

    pub fn snapshot(&self) -> AuditLogEntry {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Response-extension marker: the handler handed the body to the stream log
/// wrapper, which now owns the audit write.
#[derive(Debug, Clone, Copy)]
pub struct StreamingMarker;
