// Synod - Distributed coordination for cooperating processes
//
// Groups with leader election and messaging, locks, barriers and queues on a
// ZooKeeper-class coordination store.

pub mod logging;

// Re-export the coordination primitives
pub use synod_coordination::*;

// Re-export configuration
pub use synod_config;
pub use synod_config::{ConfigError, CoordinationConfiguration, ServerEntry};

/// Load a configuration file (with environment overrides) and start a
/// service on the ZooKeeper ensemble it names.
#[cfg(feature = "zookeeper")]
pub async fn start(path: impl AsRef<std::path::Path>) -> CoordinationResult<CoordinationService> {
    let config = CoordinationConfiguration::load(path)?;
    CoordinationService::connect_zookeeper(config).await
}
