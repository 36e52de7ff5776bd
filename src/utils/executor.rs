//! Subprocess seam between the docker CLI wrapper and the OS
//!
//! `DockerCli` talks to Docker only through `CommandExecutor`, so tests can
//! script `docker` output without a daemon.

use super::command::Result;
use std::io::Write;
use std::process::Output;
use std::time::Duration;

/// Runs host programs on behalf of the container runtime
pub trait CommandExecutor: Send + Sync {
    /// Run to completion, killing the process after `timeout`
    fn run_command(&self, program: &str, args: &[&str], timeout: Option<Duration>) -> Result<Output>;

    /// Run a command and return stdout as string
    fn run_command_stdout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String>;

    /// Run a command, streaming stdout into `sink`
    fn stream_command(
        &self,
        program: &str,
        args: &[&str],
        envs: &[(String, String)],
        timeout: Duration,
        sink: &mut dyn Write,
    ) -> Result<u64>;
}

/// Spawns real processes
#[derive(Debug, Clone, Default)]
pub struct RealExecutor;

impl RealExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealExecutor {
    fn run_command(&self, program: &str, args: &[&str], timeout: Option<Duration>) -> Result<Output> {
        super::command::run_command(program, args, timeout)
    }

    fn run_command_stdout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String> {
        super::command::run_command_stdout(program, args, timeout)
    }

    fn stream_command(
        &self,
        program: &str,
        args: &[&str],
        envs: &[(String, String)],
        timeout: Duration,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        super::command::stream_command(program, args, envs, timeout, sink)
    }
}

/// Scripted executor for tests, also used by the test crate
#[allow(dead_code)]
pub mod mock {
    use super::*;
    use crate::utils::command::CommandError;
    use std::sync::{Arc, Mutex};

    /// Recorded command invocation
    #[derive(Clone, Debug)]
    pub struct CommandCall {
        pub program: String,
        pub args: Vec<String>,
        /// Names of environment variables passed (values are never recorded)
        pub env_keys: Vec<String>,
    }

    impl CommandCall {
        /// The full command line, program first
        pub fn command_line(&self) -> String {
            std::iter::once(self.program.as_str())
                .chain(self.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    /// Response configuration for mock
    #[derive(Clone, Debug)]
    pub enum MockResponse {
        Success { stdout: String, stderr: String },
        Failure { stderr: String, exit_code: i32 },
        Timeout,
    }

    impl MockResponse {
        pub fn stdout(stdout: impl Into<String>) -> Self {
            MockResponse::Success {
                stdout: stdout.into(),
                stderr: String::new(),
            }
        }

        pub fn failure(stderr: impl Into<String>) -> Self {
            MockResponse::Failure {
                stderr: stderr.into(),
                exit_code: 1,
            }
        }

        /// Turn the configured response into the result a real command would give
        pub fn into_result(self, program: &str) -> Result<Vec<u8>> {
            match self {
                MockResponse::Success { stdout, .. } => Ok(stdout.into_bytes()),
                MockResponse::Failure { stderr, exit_code } => Err(CommandError::Failed {
                    program: program.to_string(),
                    code: Some(exit_code),
                    stderr,
                }),
                MockResponse::Timeout => Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout: Duration::from_secs(0),
                }),
            }
        }
    }

    impl Default for MockResponse {
        fn default() -> Self {
            MockResponse::Success {
                stdout: String::new(),
                stderr: String::new(),
            }
        }
    }

    /// Mock executor for testing
    ///
    /// Responses are keyed by command-line prefix (`"docker inspect"`); the
    /// longest matching prefix wins.
    #[derive(Clone, Default)]
    pub struct MockExecutor {
        /// Recorded command invocations
        pub calls: Arc<Mutex<Vec<CommandCall>>>,
        responses: Arc<Mutex<Vec<(String, MockResponse)>>>,
        default_response: Arc<Mutex<MockResponse>>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Configure a response for commands starting with `prefix`
        pub fn expect(self, prefix: &str, response: MockResponse) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push((prefix.to_string(), response));
            self
        }

        /// Set the default response for unconfigured programs
        pub fn with_default_response(self, response: MockResponse) -> Self {
            *self.default_response.lock().unwrap() = response;
            self
        }

        /// Get all recorded calls
        pub fn get_calls(&self) -> Vec<CommandCall> {
            self.calls.lock().unwrap().clone()
        }

        /// Check if a command line starting with `prefix` was run
        pub fn was_called(&self, prefix: &str) -> bool {
            self.call_count(prefix) > 0
        }

        /// Number of calls whose command line starts with `prefix`
        pub fn call_count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.command_line().starts_with(prefix))
                .count()
        }

        fn record_call(&self, program: &str, args: &[&str], envs: &[(String, String)]) -> String {
            let call = CommandCall {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env_keys: envs.iter().map(|(k, _)| k.clone()).collect(),
            };
            let line = call.command_line();
            self.calls.lock().unwrap().push(call);
            line
        }

        fn get_response(&self, command_line: &str) -> MockResponse {
            self.responses
                .lock()
                .unwrap()
                .iter()
                .filter(|(prefix, _)| command_line.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, response)| response.clone())
                .unwrap_or_else(|| self.default_response.lock().unwrap().clone())
        }
    }

    impl CommandExecutor for MockExecutor {
        fn run_command(
            &self,
            program: &str,
            args: &[&str],
            _timeout: Option<Duration>,
        ) -> Result<Output> {
            let line = self.record_call(program, args, &[]);
            let stdout = self.get_response(&line).into_result(program)?;
            Ok(Output {
                status: std::process::ExitStatus::default(),
                stdout,
                stderr: Vec::new(),
            })
        }

        fn run_command_stdout(
            &self,
            program: &str,
            args: &[&str],
            timeout: Option<Duration>,
        ) -> Result<String> {
            let output = self.run_command(program, args, timeout)?;
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        }

        fn stream_command(
            &self,
            program: &str,
            args: &[&str],
            envs: &[(String, String)],
            _timeout: Duration,
            sink: &mut dyn Write,
        ) -> Result<u64> {
            let line = self.record_call(program, args, envs);
            let stdout = self.get_response(&line).into_result(program)?;
            sink.write_all(&stdout).map_err(|source| CommandError::Stream {
                program: program.to_string(),
                source,
            })?;
            Ok(stdout.len() as u64)
        }
    }
}
