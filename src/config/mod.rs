//! Configuration module for container-backup
//!
//! Engine settings come from the environment. Per-service configuration is
//! resolved from several sources.
//!
//! ## Configuration Inheritance
//!
//! Settings are applied in this order (later overrides earlier), field by
//! field rather than section by section:
//! 1. Built-in defaults (no stopping, no exclusions, time-based retention of
//!    `BACKUP_RETENTION_DAYS`, priority 100)
//! 2. Built-in presets for well-known applications
//! 3. The config file named by `CONFIG_FILE`
//! 4. `SERVICE_CONFIG_<NAME>` JSON blocks in the environment
//!
//! ## Example Usage
//!
//! ```no_run
//! use container_backup::config::{ConfigResolver, EngineConfig};
//!
//! let engine = EngineConfig::from_env()?;
//! let resolver = ConfigResolver::from_engine(&engine);
//! let wordpress = resolver.resolve("wordpress");
//! println!("Retention: {}", wordpress.global.retention_policy);
//! # Ok::<(), container_backup::config::ConfigError>(())
//! ```

mod loader;
mod resolver;
mod types;

pub use loader::{
    env_overlays, expand_tilde, file_overlays, load_service_file, parse_duration, parse_overlay, ConfigError,
    Result, SERVICE_CONFIG_PREFIX,
};
pub use resolver::ConfigResolver;
pub use types::*;

/// Exclusions applied to every service's file archive
pub const GLOBAL_FILE_EXCLUSIONS: &[&str] = &["*/cache/*", "*/tmp/*", "*/logs/*.log", "*/backups/*", "*/.git/*"];

/// Get the merged exclude patterns for a service
/// This combines the global exclusions with service-specific exclusions
pub fn get_effective_excludes(service: &ServiceConfig) -> Vec<String> {
    let mut excludes: Vec<String> = service.files.exclusions.clone();

    for pattern in GLOBAL_FILE_EXCLUSIONS {
        if !excludes.iter().any(|e| e == pattern) {
            excludes.push(pattern.to_string());
        }
    }

    excludes
}
