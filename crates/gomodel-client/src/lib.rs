pub mod breaker;
pub mod client;
pub mod hooks;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use client::{ByteStream, HeaderFn, HttpMethod, LlmClient, LlmClientConfig};
pub use hooks::{ClientHook, ClientObservation, HookSet};
pub use retry::RetryConfig;
