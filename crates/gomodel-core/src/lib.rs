pub mod bootstrap;
pub mod config;
pub mod router;

pub use bootstrap::{bootstrap, Gateway};
pub use config::{GatewayConfig, LoggingConfig, PricingRule, StorageConfig, StorageKind};
pub use router::Router;
