//! Container runtime abstraction for testability
//!
//! This module provides a trait-based abstraction over the container
//! runtime, enabling dependency injection and mocking for tests. The real
//! implementation drives the `docker` CLI, which honours `DOCKER_HOST` and so
//! works equally against the local socket or a socket proxy.

use super::command::CommandError;
use super::executor::{CommandExecutor, RealExecutor};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A container as observed from the runtime at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    #[serde(skip)]
    pub env: HashMap<String, String>,
    pub mounts: Vec<Mount>,
}

/// A mount of a container, `source` being the host side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub kind: String,
    pub source: PathBuf,
    pub destination: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Failed to parse runtime output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Container not found: {0}")]
    NotFound(String),
}

impl RuntimeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Command(e) if e.is_timeout())
    }
}

/// Abstraction for container runtime operations, enabling mocking in tests
pub trait ContainerRuntime: Send + Sync {
    /// All running containers, fully inspected
    fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Fresh view of a single container
    fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    fn start_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Run a command in the container, streaming stdout into `sink`
    fn exec(
        &self,
        id: &str,
        command: &[&str],
        env: &[(String, String)],
        timeout: Duration,
        sink: &mut dyn Write,
    ) -> Result<u64, RuntimeError>;
}

/// Default implementation using the docker CLI
#[derive(Clone)]
pub struct DockerCli {
    executor: Arc<dyn CommandExecutor>,
    binary: String,
    query_timeout: Duration,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_executor(Arc::new(RealExecutor::new()))
    }

    pub fn with_executor(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            binary: "docker".to_string(),
            query_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerCli {
    fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let ids = super::docker::list_running_ids(self.executor.as_ref(), &self.binary, self.query_timeout)?;
        super::docker::inspect(self.executor.as_ref(), &self.binary, &ids, self.query_timeout)
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        super::docker::inspect(
            self.executor.as_ref(),
            &self.binary,
            &[id.to_string()],
            self.query_timeout,
        )?
        .into_iter()
        .next()
        .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        super::docker::stop(self.executor.as_ref(), &self.binary, id, timeout)
    }

    fn start_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        super::docker::start(self.executor.as_ref(), &self.binary, id, timeout)
    }

    fn exec(
        &self,
        id: &str,
        command: &[&str],
        env: &[(String, String)],
        timeout: Duration,
        sink: &mut dyn Write,
    ) -> Result<u64, RuntimeError> {
        super::docker::exec(self.executor.as_ref(), &self.binary, id, command, env, timeout, sink)
    }
}

/// Mock implementation for testing
/// Available for use in external test crates
#[allow(dead_code)]
pub mod mock {
    use super::*;
    use crate::utils::executor::mock::MockResponse;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Recorded runtime call
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum RuntimeCall {
        List,
        Inspect { id: String },
        Stop { id: String },
        Start { id: String },
        Exec { id: String, command: Vec<String>, env_keys: Vec<String> },
    }

    /// In-memory container runtime
    ///
    /// Containers can be referenced by id or name. Stopping and starting flip
    /// the `running` flag so later inspections observe the change.
    #[derive(Clone, Default)]
    pub struct MockRuntime {
        /// Recorded operation calls
        pub calls: Arc<Mutex<Vec<RuntimeCall>>>,
        containers: Arc<Mutex<Vec<ContainerInfo>>>,
        exec_responses: Arc<Mutex<HashMap<(String, String), MockResponse>>>,
        failing_stops: Arc<Mutex<HashSet<String>>>,
        failing_starts: Arc<Mutex<HashSet<String>>>,
        fail_list: Arc<Mutex<bool>>,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a container to the runtime
        pub fn with_container(self, container: ContainerInfo) -> Self {
            self.containers.lock().unwrap().push(container);
            self
        }

        /// Configure the output of `program` when exec'd in `container`
        pub fn with_exec_response(self, container: &str, program: &str, response: MockResponse) -> Self {
            self.exec_responses
                .lock()
                .unwrap()
                .insert((container.to_string(), program.to_string()), response);
            self
        }

        /// Make stopping `container` fail
        pub fn with_failing_stop(self, container: &str) -> Self {
            self.failing_stops.lock().unwrap().insert(container.to_string());
            self
        }

        /// Make starting `container` fail
        pub fn with_failing_start(self, container: &str) -> Self {
            self.failing_starts.lock().unwrap().insert(container.to_string());
            self
        }

        /// Make listing fail
        pub fn with_failing_list(self) -> Self {
            *self.fail_list.lock().unwrap() = true;
            self
        }

        /// Get all recorded calls
        pub fn get_calls(&self) -> Vec<RuntimeCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn stopped(&self) -> Vec<String> {
            self.get_calls()
                .into_iter()
                .filter_map(|c| match c {
                    RuntimeCall::Stop { id } => Some(id),
                    _ => None,
                })
                .collect()
        }

        pub fn started(&self) -> Vec<String> {
            self.get_calls()
                .into_iter()
                .filter_map(|c| match c {
                    RuntimeCall::Start { id } => Some(id),
                    _ => None,
                })
                .collect()
        }

        pub fn exec_count(&self) -> usize {
            self.get_calls()
                .iter()
                .filter(|c| matches!(c, RuntimeCall::Exec { .. }))
                .count()
        }

        /// Current running flag of a container
        pub fn is_running(&self, key: &str) -> bool {
            self.containers
                .lock()
                .unwrap()
                .iter()
                .any(|c| (c.id == key || c.name == key) && c.running)
        }

        fn record_call(&self, call: RuntimeCall) {
            self.calls.lock().unwrap().push(call);
        }

        fn find(&self, key: &str) -> Option<ContainerInfo> {
            self.containers
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.id == key || c.name == key)
                .cloned()
        }

        fn set_running(&self, key: &str, running: bool) {
            for c in self.containers.lock().unwrap().iter_mut() {
                if c.id == key || c.name == key {
                    c.running = running;
                }
            }
        }

        fn matches_any(set: &Mutex<HashSet<String>>, container: &ContainerInfo) -> bool {
            let set = set.lock().unwrap();
            set.contains(&container.id) || set.contains(&container.name)
        }
    }

    fn mock_failure(program: &str, message: String) -> RuntimeError {
        RuntimeError::Command(CommandError::Failed {
            program: program.to_string(),
            code: Some(1),
            stderr: message,
        })
    }

    impl ContainerRuntime for MockRuntime {
        fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
            self.record_call(RuntimeCall::List);
            if *self.fail_list.lock().unwrap() {
                return Err(mock_failure("docker", "Mock list failure".to_string()));
            }
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.running)
                .cloned()
                .collect())
        }

        fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
            self.record_call(RuntimeCall::Inspect { id: id.to_string() });
            self.find(id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))
        }

        fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
            self.record_call(RuntimeCall::Stop { id: id.to_string() });
            let container = self.find(id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            if Self::matches_any(&self.failing_stops, &container) {
                return Err(mock_failure("docker", format!("Mock stop failure for {}", id)));
            }
            self.set_running(id, false);
            Ok(())
        }

        fn start_container(&self, id: &str, _timeout: Duration) -> Result<(), RuntimeError> {
            self.record_call(RuntimeCall::Start { id: id.to_string() });
            let container = self.find(id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            if Self::matches_any(&self.failing_starts, &container) {
                return Err(mock_failure("docker", format!("Mock start failure for {}", id)));
            }
            self.set_running(id, true);
            Ok(())
        }

        fn exec(
            &self,
            id: &str,
            command: &[&str],
            env: &[(String, String)],
            _timeout: Duration,
            sink: &mut dyn Write,
        ) -> Result<u64, RuntimeError> {
            self.record_call(RuntimeCall::Exec {
                id: id.to_string(),
                command: command.iter().map(|s| s.to_string()).collect(),
                env_keys: env.iter().map(|(k, _)| k.clone()).collect(),
            });

            let container = self.find(id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            if !container.running {
                return Err(mock_failure("docker", format!("container {} is not running", id)));
            }

            let program = command.first().copied().unwrap_or_default();
            let response = {
                let responses = self.exec_responses.lock().unwrap();
                responses
                    .get(&(container.id.clone(), program.to_string()))
                    .or_else(|| responses.get(&(container.name.clone(), program.to_string())))
                    .cloned()
                    .unwrap_or_else(|| MockResponse::failure(format!("{}: not found", program)))
            };

            let stdout = response.into_result(program)?;
            sink.write_all(&stdout).map_err(|source| {
                RuntimeError::Command(CommandError::Stream {
                    program: program.to_string(),
                    source,
                })
            })?;
            Ok(stdout.len() as u64)
        }
    }
}
