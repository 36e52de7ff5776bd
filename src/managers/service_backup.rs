//! Per-service backup state machine
//!
//! ```text
//! Pending -> Preparing -> (Stopping) -> DatabaseBackup -> FileBackup
//!         -> Consolidating -> (Starting) -> Cleanup -> Done | PartialFailure | Failed
//! ```
//!
//! Containers stopped for a cold backup are held by a [`RestartGuard`], which
//! starts them again in reverse order on every exit path, unwinding included.

use crate::config::{get_effective_excludes, Credentials, DatabaseType};
use crate::managers::credentials::StackEnvironments;
use crate::managers::discovery::{Component, ComponentRole, SelfIdentity, Service};
use crate::strategies::{strategy_for, DatabaseDumper, FileArchiver};
use crate::utils::archive::{backup_stem, tar_directory, TIMESTAMP_FORMAT};
use crate::utils::docker_ops::ContainerRuntime;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Pending,
    Preparing,
    Stopping,
    DatabaseBackup,
    FileBackup,
    Consolidating,
    Starting,
    Cleanup,
    Done,
    PartialFailure,
    Failed,
    Skipped,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupState::Pending => "pending",
            BackupState::Preparing => "preparing",
            BackupState::Stopping => "stopping",
            BackupState::DatabaseBackup => "database-backup",
            BackupState::FileBackup => "file-backup",
            BackupState::Consolidating => "consolidating",
            BackupState::Starting => "starting",
            BackupState::Cleanup => "cleanup",
            BackupState::Done => "done",
            BackupState::PartialFailure => "partial-failure",
            BackupState::Failed => "failed",
            BackupState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Receives every state transition of every service
pub trait StateObserver: Send + Sync {
    fn transition(&self, service: &str, state: BackupState);
}

/// Final result of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ServiceOutcome {
    Done,
    PartialFailure(Vec<String>),
    Failed(String),
    Skipped(String),
}

impl ServiceOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ServiceOutcome::Failed(_))
    }

    pub fn state(&self) -> BackupState {
        match self {
            ServiceOutcome::Done => BackupState::Done,
            ServiceOutcome::PartialFailure(_) => BackupState::PartialFailure,
            ServiceOutcome::Failed(_) => BackupState::Failed,
            ServiceOutcome::Skipped(_) => BackupState::Skipped,
        }
    }
}

impl fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceOutcome::Done => f.write_str("done"),
            ServiceOutcome::PartialFailure(errors) => write!(f, "partial failure ({})", errors.join("; ")),
            ServiceOutcome::Failed(reason) => write!(f, "failed ({})", reason),
            ServiceOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMethod {
    Hot,
    Cold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Done,
    Failed,
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentStatus::Done => f.write_str("done"),
            ComponentStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Result of backing up one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentReport {
    pub name: String,
    pub role: String,
    pub status: ComponentStatus,
    /// Path inside the service archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentReport {
    fn done(name: &str, role: &str, artifact: String) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            status: ComponentStatus::Done,
            artifact: Some(artifact),
            error: None,
        }
    }

    fn failed(name: &str, role: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            status: ComponentStatus::Failed,
            artifact: None,
            error: Some(error),
        }
    }
}

impl fmt::Display for ComponentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.role, self.status)?;
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}

/// Report of one service run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub service: String,
    pub outcome: ServiceOutcome,
    pub method: BackupMethod,
    #[serde(default)]
    pub archive: Option<PathBuf>,
    #[serde(default)]
    pub components: Vec<ComponentReport>,
    pub duration_secs: f64,
}

impl ServiceReport {
    /// A report for a service that never ran
    pub fn not_run(service: &str, outcome: ServiceOutcome) -> Self {
        Self {
            service: service.to_string(),
            outcome,
            method: BackupMethod::Hot,
            archive: None,
            components: Vec::new(),
            duration_secs: 0.0,
        }
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    service: &'a str,
    timestamp: &'a str,
    method: BackupMethod,
    components: &'a [ComponentReport],
}

/// Restarts stopped containers when dropped
pub struct RestartGuard {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
    /// (id, name) in stop order
    stopped: Vec<(String, String)>,
}

impl RestartGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self {
            runtime,
            timeout,
            stopped: Vec::new(),
        }
    }

    pub fn push(&mut self, id: &str, name: &str) {
        self.stopped.push((id.to_string(), name.to_string()));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.stopped.iter().any(|(stopped, _)| stopped == id)
    }

    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty()
    }

    fn is_running(&self, id: &str) -> bool {
        self.runtime
            .inspect_container(id)
            .map(|info| info.running)
            .unwrap_or(false)
    }

    fn start_verified(&self, id: &str) -> Result<(), String> {
        let first = self.runtime.start_container(id, self.timeout);
        if first.is_ok() && self.is_running(id) {
            return Ok(());
        }
        if let Err(e) = &first {
            warn!("Start of {} failed, retrying: {}", id, e);
        } else {
            warn!("{} is not running after start, retrying", id);
        }

        match self.runtime.start_container(id, self.timeout) {
            Ok(()) if self.is_running(id) => Ok(()),
            Ok(()) => Err("not running after restart".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Start everything in reverse stop order. Returns one message per
    /// container that could not be brought back.
    pub fn restart_all(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some((id, name)) = self.stopped.pop() {
            match self.start_verified(&id) {
                Ok(()) => info!("Restarted container {}", name),
                Err(e) => {
                    error!("Failed to restart container {}: {}", name, e);
                    failures.push(format!("restart {}: {}", name, e));
                }
            }
        }
        failures
    }
}

impl Drop for RestartGuard {
    fn drop(&mut self) {
        if !self.stopped.is_empty() {
            warn!("Restarting {} containers left stopped", self.stopped.len());
            self.restart_all();
        }
    }
}

/// Shared dependencies of every service run
#[derive(Clone)]
pub struct BackupContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub dumper: DatabaseDumper,
    pub credentials: Arc<StackEnvironments>,
    pub identity: SelfIdentity,
    pub backup_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub data_root: PathBuf,
    pub stop_timeout: Duration,
    pub observer: Option<Arc<dyn StateObserver>>,
}

/// One backup run of one service
pub struct ServiceBackup<'a> {
    ctx: &'a BackupContext,
    service: &'a Service,
    state: BackupState,
    timestamp: String,
}

impl<'a> ServiceBackup<'a> {
    pub fn new(ctx: &'a BackupContext, service: &'a Service) -> Self {
        Self {
            ctx,
            service,
            state: BackupState::Pending,
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    fn transition(&mut self, next: BackupState) {
        info!("[{}] {} -> {}", self.service.name, self.state, next);
        self.state = next;
        if let Some(observer) = &self.ctx.observer {
            observer.transition(&self.service.name, next);
        }
    }

    fn needs_stopping(&self, component: &Component) -> bool {
        let required = match component.role {
            // Exec dumps need a live server and are consistent on their own
            ComponentRole::Database { db_type: Some(db_type) } if strategy_for(db_type).requires_running() => {
                if self.service.config.database.requires_stopping {
                    debug!("{} is dumped live and stays running", component.name);
                }
                false
            }
            ComponentRole::Database { .. } => self.service.config.database.requires_stopping,
            ComponentRole::FileSource => self.service.config.files.requires_stopping,
        };
        if !required || !component.running {
            return false;
        }
        if component.is_hot() {
            debug!("{} is labelled for hot backup", component.name);
            return false;
        }
        if self.ctx.identity.matches_component(component) {
            warn!("Refusing to stop {}: it belongs to the backup engine", component.name);
            return false;
        }
        true
    }

    /// Run the state machine to completion
    pub fn run(mut self) -> ServiceReport {
        let started = Instant::now();
        let service = self.service;

        self.transition(BackupState::Preparing);
        if service.components.is_empty() && service.config.files.data_paths.is_empty() {
            let outcome = ServiceOutcome::Skipped("nothing to back up".to_string());
            self.transition(outcome.state());
            return ServiceReport::not_run(&service.name, outcome);
        }

        let staging = match self.create_staging() {
            Ok(staging) => staging,
            Err(e) => {
                let outcome = ServiceOutcome::Failed(format!("staging: {:#}", e));
                self.transition(outcome.state());
                return ServiceReport::not_run(&service.name, outcome);
            }
        };
        let stem = backup_stem(&service.name, &self.timestamp);
        let work = staging.path().join(&stem);

        let mut guard = RestartGuard::new(self.ctx.runtime.clone(), self.ctx.stop_timeout);
        let mut components = Vec::new();
        let mut archive = None;

        let mut outcome = match self.stop_components(&mut guard) {
            Err(reason) => ServiceOutcome::Failed(reason),
            Ok(()) => {
                components = self.backup_components(&guard, &work);
                self.consolidate(&work, &stem, &guard, &components, &mut archive)
            }
        };
        let method = if guard.is_empty() {
            BackupMethod::Hot
        } else {
            BackupMethod::Cold
        };

        if !guard.is_empty() {
            self.transition(BackupState::Starting);
            let failures = guard.restart_all();
            if !failures.is_empty() {
                outcome = match outcome {
                    ServiceOutcome::Done => ServiceOutcome::PartialFailure(failures),
                    ServiceOutcome::PartialFailure(mut errors) => {
                        errors.extend(failures);
                        ServiceOutcome::PartialFailure(errors)
                    }
                    other => other,
                };
            }
        }

        self.transition(BackupState::Cleanup);
        if let Err(e) = staging.close() {
            warn!("Failed to remove staging directory: {}", e);
        }

        self.transition(outcome.state());
        let duration = started.elapsed();
        match &outcome {
            ServiceOutcome::Failed(reason) => error!("Backup of '{}' failed: {}", service.name, reason),
            other => info!(
                "Backup of '{}' finished in {:.2}s: {}",
                service.name,
                duration.as_secs_f64(),
                other
            ),
        }

        ServiceReport {
            service: service.name.clone(),
            outcome,
            method,
            archive,
            components,
            duration_secs: duration.as_secs_f64(),
        }
    }

    fn create_staging(&self) -> Result<tempfile::TempDir> {
        fs::create_dir_all(&self.ctx.staging_dir)
            .with_context(|| format!("Failed to create {}", self.ctx.staging_dir.display()))?;
        tempfile::Builder::new()
            .prefix(&format!("{}_{}-", self.service.name, self.timestamp))
            .tempdir_in(&self.ctx.staging_dir)
            .context("Failed to create staging directory")
    }

    fn stop_components(&mut self, guard: &mut RestartGuard) -> std::result::Result<(), String> {
        let to_stop: Vec<&Component> = self
            .service
            .components
            .iter()
            .filter(|c| self.needs_stopping(c))
            .collect();
        if to_stop.is_empty() {
            return Ok(());
        }
        if self.service.contains_backup_tool {
            warn!(
                "'{}' hosts the backup engine, backing it up without stopping {} containers",
                self.service.name,
                to_stop.len()
            );
            return Ok(());
        }

        self.transition(BackupState::Stopping);
        for component in to_stop {
            info!("Stopping container {}", component.name);
            if let Err(e) = self.ctx.runtime.stop_container(&component.id, self.ctx.stop_timeout) {
                error!("Failed to stop {}: {}", component.name, e);
                return Err(format!("stop-error: {}: {}", component.name, e));
            }
            guard.push(&component.id, &component.name);
        }
        Ok(())
    }

    fn backup_components(&mut self, guard: &RestartGuard, work: &Path) -> Vec<ComponentReport> {
        let mut reports = Vec::new();

        self.transition(BackupState::DatabaseBackup);
        let databases_dir = work.join("databases");
        for component in self.service.databases() {
            let report = self.backup_database(component, guard, &databases_dir, work);
            reports.push(report);
        }

        self.transition(BackupState::FileBackup);
        if let Some(report) = self.backup_files(work) {
            reports.push(report);
        }

        reports
    }

    fn backup_database(
        &self,
        component: &Component,
        guard: &RestartGuard,
        output_dir: &Path,
        work: &Path,
    ) -> ComponentReport {
        let role = component.role.as_str();
        let mut current = component.clone();
        current.running = component.running && !guard.contains(&component.id);

        let credentials = match component.role {
            ComponentRole::Database {
                db_type: Some(db_type),
            } if db_type != DatabaseType::Sqlite => self.lookup_credentials(component, db_type),
            _ => None,
        };

        match self.ctx.dumper.backup(&current, credentials.as_ref(), output_dir) {
            Ok(artifact) => ComponentReport::done(&component.name, role, relative(work, &artifact.path)),
            Err(e) => {
                warn!("Database backup of {} failed: {}", component.name, e);
                ComponentReport::failed(&component.name, role, format!("{}: {}", e.reason(), e))
            }
        }
    }

    fn lookup_credentials(&self, component: &Component, db_type: DatabaseType) -> Option<Credentials> {
        match self.ctx.credentials.resolve(
            &self.service.stack,
            db_type,
            self.service.config.database.credentials.as_ref(),
            &component.env,
        ) {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Configured data paths, or the service's bind mounts when none are
    /// configured
    fn file_paths(&self) -> Vec<String> {
        let configured = &self.service.config.files.data_paths;
        if !configured.is_empty() {
            return configured.clone();
        }

        self.service
            .mount_sources()
            .into_iter()
            .filter(|source| {
                let overlaps = source.starts_with(&self.ctx.backup_dir) || self.ctx.backup_dir.starts_with(source);
                if overlaps {
                    warn!("Skipping mount {}: it overlaps the backup root", source.display());
                }
                !overlaps
            })
            .map(|source| source.display().to_string())
            .collect()
    }

    fn backup_files(&self, work: &Path) -> Option<ComponentReport> {
        let paths = self.file_paths();
        if paths.is_empty() {
            return None;
        }
        if self.service.config.files.data_paths.is_empty() {
            info!("Backing up {} bind mounts of '{}'", paths.len(), self.service.name);
        }

        let exclusions = get_effective_excludes(&self.service.config);
        let data_root = self.ctx.data_root.join(&self.service.name);
        let output = work
            .join("files")
            .join(format!("{}_files.tar.gz", self.service.name));

        match FileArchiver::new(&exclusions).archive(&data_root, &paths, &output) {
            Ok(Some(artifact)) => Some(ComponentReport::done("files", "files", relative(work, &artifact.path))),
            Ok(None) => None,
            Err(e) => {
                warn!("File backup of '{}' failed: {}", self.service.name, e);
                Some(ComponentReport::failed("files", "files", e.to_string()))
            }
        }
    }

    fn consolidate(
        &mut self,
        work: &Path,
        stem: &str,
        guard: &RestartGuard,
        components: &[ComponentReport],
        archive: &mut Option<PathBuf>,
    ) -> ServiceOutcome {
        let errors: Vec<String> = components
            .iter()
            .filter(|c| c.status == ComponentStatus::Failed)
            .map(|c| format!("{}: {}", c.name, c.error.as_deref().unwrap_or("failed")))
            .collect();
        let succeeded = components.len() - errors.len();

        if succeeded == 0 {
            return if errors.is_empty() {
                ServiceOutcome::Skipped("no data produced".to_string())
            } else {
                ServiceOutcome::Failed(errors.join("; "))
            };
        }

        self.transition(BackupState::Consolidating);
        let method = if guard.is_empty() {
            BackupMethod::Hot
        } else {
            BackupMethod::Cold
        };
        match self.write_archive(work, stem, method, components) {
            Ok(path) => {
                info!("Created {}", path.display());
                *archive = Some(path);
                if errors.is_empty() {
                    ServiceOutcome::Done
                } else {
                    ServiceOutcome::PartialFailure(errors)
                }
            }
            Err(e) => ServiceOutcome::Failed(format!("consolidation: {:#}", e)),
        }
    }

    fn write_archive(
        &self,
        work: &Path,
        stem: &str,
        method: BackupMethod,
        components: &[ComponentReport],
    ) -> Result<PathBuf> {
        fs::create_dir_all(work).context("Failed to create work directory")?;
        let manifest = Manifest {
            service: &self.service.name,
            timestamp: &self.timestamp,
            method,
            components,
        };
        let json = serde_json::to_string_pretty(&manifest).context("Failed to serialize manifest")?;
        fs::write(work.join("metadata.json"), json).context("Failed to write manifest")?;

        fs::create_dir_all(&self.ctx.backup_dir)
            .with_context(|| format!("Failed to create {}", self.ctx.backup_dir.display()))?;
        let output = self.ctx.backup_dir.join(format!("{}.tar.gz", stem));
        tar_directory(work, stem, &output).with_context(|| format!("Failed to write {}", output.display()))
    }
}

fn relative(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Observers for tests
/// Available for use in external test crates
#[allow(dead_code)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records every transition in order
    #[derive(Clone, Default)]
    pub struct RecordingObserver {
        pub events: Arc<Mutex<Vec<(String, BackupState)>>>,
    }

    impl RecordingObserver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<(String, BackupState)> {
            self.events.lock().unwrap().clone()
        }

        /// States seen for one service
        pub fn states(&self, service: &str) -> Vec<BackupState> {
            self.events()
                .into_iter()
                .filter(|(s, _)| s == service)
                .map(|(_, state)| state)
                .collect()
        }

        /// Position of the first `state` event of `service`
        pub fn position(&self, service: &str, state: BackupState) -> Option<usize> {
            self.events()
                .iter()
                .position(|(s, st)| s == service && *st == state)
        }
    }

    impl StateObserver for RecordingObserver {
        fn transition(&self, service: &str, state: BackupState) {
            self.events.lock().unwrap().push((service.to_string(), state));
        }
    }
}
