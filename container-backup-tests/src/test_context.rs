//! Test context and harness for scenario testing
//!
//! Bundles an engine configuration in a temp dir with a mock container
//! runtime, an optional mock stack API and a recording state observer.

use crate::config_builder::ConfigBuilder;
use crate::fixtures;
use container_backup::config::{ConfigResolver, EngineConfig};
use container_backup::managers::backup::BackupManager;
use container_backup::managers::credentials::CredentialClient;
use container_backup::managers::retention::RetentionManager;
use container_backup::managers::service_backup::mock::RecordingObserver;
use container_backup::utils::docker_ops::mock::MockRuntime;
use container_backup::utils::docker_ops::ContainerInfo;
use container_backup::utils::executor::mock::MockResponse;
use container_backup::utils::portainer::mock::MockStackApi;
use container_backup::utils::portainer::StackApi;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Test context that manages test resources and provides common utilities
pub struct TestContext {
    temp_dir: TempDir,
    config: EngineConfig,
    pub runtime: MockRuntime,
    pub stack_api: Option<MockStackApi>,
    pub observer: RecordingObserver,
}

impl TestContext {
    /// Context with default settings and no containers
    pub fn new() -> Self {
        Self::from_builder(ConfigBuilder::new())
    }

    pub fn from_builder(builder: ConfigBuilder) -> Self {
        let (config, temp_dir) = builder.build();
        Self {
            temp_dir,
            config,
            runtime: MockRuntime::new(),
            stack_api: None,
            observer: RecordingObserver::new(),
        }
    }

    pub fn with_container(mut self, container: ContainerInfo) -> Self {
        self.runtime = self.runtime.with_container(container);
        self
    }

    pub fn with_containers(self, containers: Vec<ContainerInfo>) -> Self {
        containers.into_iter().fold(self, |ctx, c| ctx.with_container(c))
    }

    /// Output of `program` exec'd in `container`
    pub fn with_exec(mut self, container: &str, program: &str, stdout: &str) -> Self {
        self.runtime = self
            .runtime
            .with_exec_response(container, program, MockResponse::stdout(stdout));
        self
    }

    pub fn with_exec_response(mut self, container: &str, program: &str, response: MockResponse) -> Self {
        self.runtime = self.runtime.with_exec_response(container, program, response);
        self
    }

    /// Serve `env` as the stack environment of `stack`
    pub fn with_stack(mut self, stack: &str, env: &[(&str, &str)]) -> Self {
        let api = self.stack_api.take().unwrap_or_default();
        self.stack_api = Some(api.with_stack(stack, env));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    /// Data directory of a service
    pub fn data_dir(&self, service: &str) -> PathBuf {
        self.config.data_root.join(service)
    }

    /// Create a file beneath a service's data directory
    pub fn create_data_file(&self, service: &str, relative: &str, contents: &str) -> PathBuf {
        let path = self.data_dir(service).join(relative);
        fixtures::write_file(&path, contents);
        path
    }

    /// Archives written so far
    pub fn archives(&self) -> Vec<PathBuf> {
        fixtures::list_archives(self.backup_dir())
    }

    pub fn resolver(&self) -> Arc<ConfigResolver> {
        Arc::new(ConfigResolver::from_engine(&self.config))
    }

    /// Backup manager wired to the mocks
    pub fn manager(&self) -> BackupManager {
        let api = self
            .stack_api
            .clone()
            .map(|api| Arc::new(api) as Arc<dyn StackApi>);
        BackupManager::new(
            self.config.clone(),
            Arc::new(self.runtime.clone()),
            self.resolver(),
            CredentialClient::new(api),
        )
        .with_observer(Arc::new(self.observer.clone()))
    }

    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.config.backup_dir.clone(), self.resolver())
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension trait for assertion helpers
pub trait ResultAssertions<T> {
    /// Assert that the result is Ok and return the value
    fn assert_ok(self) -> T;

    /// Assert that the result is Err and its message contains `needle`
    fn assert_err_contains(self, needle: &str);
}

impl<T: std::fmt::Debug, E: std::fmt::Display> ResultAssertions<T> for Result<T, E> {
    fn assert_ok(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("Expected Ok, got Err: {}", e),
        }
    }

    fn assert_err_contains(self, needle: &str) {
        match self {
            Ok(v) => panic!("Expected Err containing '{}', got Ok: {:?}", needle, v),
            Err(e) => {
                let message = e.to_string();
                assert!(message.contains(needle), "Error '{}' does not contain '{}'", message, needle);
            }
        }
    }
}
