use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use gomodel_common::ErrorKind;

/// What a hook sees after each upstream attempt completes.
#[derive(Debug, Clone)]
pub struct ClientObservation {
    pub provider_type: String,
    pub endpoint: String,
    pub status: Option<u16>,
    pub duration: Duration,
    pub error: Option<ErrorKind>,
}

/// Process-wide observation callback (metrics exporters plug in here).
/// Implementations must not block.
pub trait ClientHook: Send + Sync {
    fn observe(&self, observation: &ClientObservation);
}

/// The hook set is assembled once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn ClientHook>>,
}

impl HookSet {
    pub fn new(hooks: Vec<Arc<dyn ClientHook>>) -> Self {
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// A panicking hook must never take the request path down with it.
    pub fn observe(&self, observation: &ClientObservation) {
        for hook in &self.hooks {
            let result = catch_unwind(AssertUnwindSafe(|| hook.observe(observation)));
            if result.is_err() {
                tracing::warn!(
                    endpoint = %observation.endpoint,
                    "client hook panicked; continuing"
                );
            }
        }
    }
}
