//! Docker CLI plumbing: listing, inspection and lifecycle calls

use super::command::CommandError;
use super::docker_ops::{ContainerInfo, Mount, RuntimeError};
use super::executor::CommandExecutor;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

/// Subset of `docker inspect` output the engine relies on
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    name: String,
    config: InspectConfig,
    state: InspectState,
    #[serde(default)]
    mounts: Option<Vec<InspectMount>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
}

impl From<InspectRecord> for ContainerInfo {
    fn from(record: InspectRecord) -> Self {
        let env = record
            .config
            .env
            .unwrap_or_default()
            .into_iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        ContainerInfo {
            id: record.id,
            name: record.name.trim_start_matches('/').to_string(),
            image: record.config.image,
            hostname: record.config.hostname,
            running: record.state.running,
            labels: record.config.labels.unwrap_or_default(),
            env,
            mounts: record
                .mounts
                .unwrap_or_default()
                .into_iter()
                .map(|m| Mount {
                    kind: m.kind,
                    source: m.source.into(),
                    destination: m.destination,
                })
                .collect(),
        }
    }
}

/// Parse the JSON array printed by `docker inspect`
pub fn parse_inspect(json: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
    let records: Vec<InspectRecord> = serde_json::from_str(json)?;
    Ok(records.into_iter().map(ContainerInfo::from).collect())
}

/// Ids of all running containers
pub fn list_running_ids(
    executor: &dyn CommandExecutor,
    binary: &str,
    timeout: Duration,
) -> Result<Vec<String>, RuntimeError> {
    let output = executor.run_command_stdout(binary, &["ps", "-q", "--no-trunc"], Some(timeout))?;

    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Inspect one or more containers
pub fn inspect(
    executor: &dyn CommandExecutor,
    binary: &str,
    ids: &[String],
    timeout: Duration,
) -> Result<Vec<ContainerInfo>, RuntimeError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = vec!["inspect"];
    args.extend(ids.iter().map(String::as_str));

    let output = match executor.run_command_stdout(binary, &args, Some(timeout)) {
        Ok(output) => output,
        Err(CommandError::Failed { stderr, .. }) if stderr.contains("No such") => {
            return Err(RuntimeError::NotFound(ids.join(", ")));
        }
        Err(e) => return Err(e.into()),
    };

    parse_inspect(&output)
}

/// Stop a container, giving it `timeout` to shut down gracefully
pub fn stop(
    executor: &dyn CommandExecutor,
    binary: &str,
    id: &str,
    timeout: Duration,
) -> Result<(), RuntimeError> {
    info!("Stopping container: {}", id);
    let grace = timeout.as_secs().to_string();
    // The CLI waits for the grace period before killing, so allow extra headroom.
    let limit = timeout + Duration::from_secs(30);
    executor.run_command(binary, &["stop", "-t", &grace, id], Some(limit))?;
    Ok(())
}

/// Start a stopped container
pub fn start(
    executor: &dyn CommandExecutor,
    binary: &str,
    id: &str,
    timeout: Duration,
) -> Result<(), RuntimeError> {
    info!("Starting container: {}", id);
    executor.run_command(binary, &["start", id], Some(timeout))?;
    Ok(())
}

/// Run `command` inside a container and stream its stdout into `sink`.
///
/// Environment values travel in the CLI's own environment and are referenced
/// by name only (`-e NAME`), so they never appear on a command line.
pub fn exec(
    executor: &dyn CommandExecutor,
    binary: &str,
    id: &str,
    command: &[&str],
    env: &[(String, String)],
    timeout: Duration,
    sink: &mut dyn Write,
) -> Result<u64, RuntimeError> {
    let mut args: Vec<&str> = vec!["exec"];
    for (key, _) in env {
        args.push("-e");
        args.push(key.as_str());
    }
    args.push(id);
    args.extend_from_slice(command);

    debug!("Exec in {}: {}", id, command.join(" "));
    Ok(executor.stream_command(binary, &args, env, timeout, sink)?)
}
