//! Test utilities for container-backup
//!
//! This crate provides shared test utilities, fixtures and re-exported mock
//! implementations for testing the container-backup engine.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use test_utils::{fixtures, ServiceConfigBuilder, ConfigBuilder, TestContext};
//!
//! #[test]
//! fn my_test() {
//!     let ctx = TestContext::from_builder(
//!         ConfigBuilder::new().service("blog", ServiceConfigBuilder::new().data_paths(&["html"])),
//!     )
//!     .with_container(fixtures::container("blog", "blog-web", "nginx"));
//!     let report = ctx.manager().run_backup(None).unwrap();
//!     // ... assertions
//! }
//! ```

pub mod config_builder;
pub mod fixtures;
pub mod test_context;

// Re-export commonly used items
pub use config_builder::{ConfigBuilder, ServiceConfigBuilder};
pub use test_context::{ResultAssertions, TestContext};

// Re-export types from the main crate for convenience
pub use container_backup::config::{DatabaseType, EngineConfig, RetentionPolicy, ServiceConfig};
pub use container_backup::managers::backup::{RunError, RunReport};
pub use container_backup::managers::service_backup::{BackupMethod, BackupState, ComponentStatus, ServiceOutcome};

// Re-export mock implementations from the main crate
pub use container_backup::managers::service_backup::mock::RecordingObserver;
pub use container_backup::utils::docker_ops::mock::{MockRuntime, RuntimeCall};
pub use container_backup::utils::docker_ops::ContainerRuntime;
pub use container_backup::utils::executor::mock::{MockExecutor, MockResponse};
pub use container_backup::utils::executor::CommandExecutor;
pub use container_backup::utils::portainer::mock::MockStackApi;
pub use container_backup::utils::portainer::StackApi;

/// Common test result type
pub type TestResult<T = ()> = anyhow::Result<T>;
