//! Utilities for running commands with proper error handling and timeouts

use std::future::Future;
use std::io::Write;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, error};

/// Errors raised while running an external program
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} failed with exit code {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to stream output of {program}: {source}")]
    Stream {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Drive a future to completion from synchronous code.
///
/// Uses the ambient runtime when the caller sits on one of its blocking
/// threads, otherwise a private current-thread runtime is built for the call.
/// Must not be called from inside an async task.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(CommandError::Runtime)?;
            Ok(runtime.block_on(future))
        }
    }
}

/// Run a command with optional timeout
pub fn run_command(program: &str, args: &[&str], timeout: Option<Duration>) -> Result<Output> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running command: {} {}", program, args.join(" "));

    let output = block_on(async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(result) => result.map_err(|source| CommandError::Spawn {
                    program: program.to_string(),
                    source,
                }),
                Err(_) => Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout: limit,
                }),
            },
            None => cmd.output().await.map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            }),
        }
    })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!("Command failed: {} {}", program, args.join(" "));
        error!("Stderr: {}", stderr);
        return Err(CommandError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            stderr,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.is_empty() {
        debug!("Command output: {} bytes", stdout.len());
    }

    Ok(output)
}

/// Run a command and return stdout as string
pub fn run_command_stdout(program: &str, args: &[&str], timeout: Option<Duration>) -> Result<String> {
    let output = run_command(program, args, timeout)?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run a command and copy its stdout into `sink` as it is produced.
///
/// `envs` are set on the child process only. Stderr is collected for the
/// error message. The child is killed when the timeout expires. Returns the
/// number of bytes written to the sink.
pub fn stream_command(
    program: &str,
    args: &[&str],
    envs: &[(String, String)],
    timeout: Duration,
    sink: &mut dyn Write,
) -> Result<u64> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Streaming command: {} {}", program, args.join(" "));

    block_on(async {
        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let stream_error = |source| CommandError::Stream {
            program: program.to_string(),
            source,
        };
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| stream_error(std::io::Error::other("stdout not captured")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| stream_error(std::io::Error::other("stderr not captured")))?;

        let work = async {
            let copy = async {
                let copied = async {
                    let mut buf = vec![0u8; 64 * 1024];
                    let mut total = 0u64;
                    loop {
                        let n = stdout.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        sink.write_all(&buf[..n])?;
                        total += n as u64;
                    }
                    sink.flush()?;
                    Ok::<u64, std::io::Error>(total)
                }
                .await;
                // Nobody drains stdout any more, so the child would block on it
                if copied.is_err() {
                    let _ = child.start_kill();
                }
                copied
            };
            let collect_stderr = async {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            };
            let (copied, stderr_bytes) = tokio::join!(copy, collect_stderr);
            let status = child.wait().await;
            (copied, stderr_bytes, status)
        };

        let outcome = tokio::time::timeout(timeout, work).await;
        let (copied, stderr_bytes, status) = match outcome {
            Ok(done) => done,
            Err(_) => {
                let _ = child.kill().await;
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                });
            }
        };

        let copied = copied.map_err(stream_error)?;
        let status = status.map_err(stream_error)?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_bytes).trim().to_string();
            error!("Command failed: {} {}", program, args.join(" "));
            error!("Stderr: {}", stderr);
            return Err(CommandError::Failed {
                program: program.to_string(),
                code: status.code(),
                stderr,
            });
        }
        Ok(copied)
    })?
}
