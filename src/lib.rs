//! Container Backup Library
//!
//! This library discovers Docker services, backs up their databases and data
//! directories into per-service archives, and applies retention to them.

pub mod config;
pub mod managers;
pub mod strategies;
pub mod utils;

// Re-export commonly used types
pub use config::{ConfigResolver, EngineConfig, ServiceConfig};
pub use managers::backup::{BackupManager, RunError, RunReport};
pub use managers::logging::{init_console_logging, init_logging, LogGuard};
pub use managers::retention::{RetentionManager, RetentionReport};
pub use managers::service_backup::{BackupState, ServiceOutcome, ServiceReport};
