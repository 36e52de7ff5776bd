//! Backup manager - orchestrates a backup run across all services

use crate::config::{ConfigResolver, EngineConfig};
use crate::managers::credentials::CredentialClient;
use crate::managers::discovery::{SelfIdentity, Service, ServiceDiscovery};
use crate::managers::service_backup::{BackupContext, ServiceBackup, ServiceOutcome, ServiceReport, StateObserver};
use crate::strategies::DatabaseDumper;
use crate::utils::archive::PartialFile;
use crate::utils::docker_ops::{ContainerRuntime, DockerCli, RuntimeError};
use crate::utils::locker::{LockError, LockRecord, RunLock};
use crate::utils::portainer::{PortainerClient, StackApi};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Another backup run is in progress (pid {} on {}, since {})", .0.pid, .0.hostname, .0.acquired_at)]
    AlreadyRunning(LockRecord),

    #[error(transparent)]
    Lock(LockError),

    #[error("Failed to list containers: {0}")]
    Discovery(#[from] RuntimeError),

    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start worker pool: {0}")]
    Runtime(#[source] io::Error),
}

impl RunError {
    /// Whether another run holds the lock
    pub fn is_lock_held(&self) -> bool {
        matches!(self, RunError::AlreadyRunning(_) | RunError::Lock(LockError::Contended))
    }
}

impl From<LockError> for RunError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyRunning(record) => RunError::AlreadyRunning(record),
            other => RunError::Lock(other),
        }
    }
}

/// Result of one backup run, persisted as `last_run.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceReport>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.services.values().any(|r| r.outcome.is_failed())
    }

    /// (done, partial, failed, skipped)
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for report in self.services.values() {
            match report.outcome {
                ServiceOutcome::Done => counts.0 += 1,
                ServiceOutcome::PartialFailure(_) => counts.1 += 1,
                ServiceOutcome::Failed(_) => counts.2 += 1,
                ServiceOutcome::Skipped(_) => counts.3 += 1,
            }
        }
        counts
    }

    /// Read a persisted report
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let report = serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(report))
    }

    fn save(&self, path: &Path) -> io::Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let mut file = PartialFile::create(path)?;
        file.write_all(&bytes)?;
        file.commit()
    }
}

pub struct BackupManager {
    config: EngineConfig,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<ConfigResolver>,
    credentials: CredentialClient,
    observer: Option<Arc<dyn StateObserver>>,
}

impl BackupManager {
    /// Create new backup manager
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<ConfigResolver>,
        credentials: CredentialClient,
    ) -> Self {
        Self {
            config,
            runtime,
            resolver,
            credentials,
            observer: None,
        }
    }

    /// Backup manager talking to the local docker CLI and, when configured,
    /// the Portainer API
    pub fn from_engine(config: EngineConfig) -> anyhow::Result<Self> {
        let api: Option<Arc<dyn StackApi>> = match &config.portainer {
            Some(settings) => Some(Arc::new(
                PortainerClient::new(settings.clone()).context("Failed to create Portainer client")?,
            )),
            None => None,
        };
        let resolver = Arc::new(ConfigResolver::from_engine(&config));
        Ok(Self::new(
            config,
            Arc::new(DockerCli::new()),
            resolver,
            CredentialClient::new(api),
        ))
    }

    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.resolver
    }

    /// Discover services without backing anything up
    pub fn discover(&self) -> Result<Vec<Service>, RuntimeError> {
        ServiceDiscovery::new(
            self.runtime.clone(),
            self.resolver.clone(),
            SelfIdentity::from_engine(&self.config),
            self.config.excluded_services.clone(),
        )
        .discover()
    }

    /// Back up every discovered service, or only those named in `filter`
    pub fn run_backup(&self, filter: Option<&[String]>) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        let backup_dir = &self.config.backup_dir;
        fs::create_dir_all(backup_dir).map_err(|source| RunError::Io {
            path: backup_dir.clone(),
            source,
        })?;

        let _lock = RunLock::acquire(&self.config.lock_dir(), self.config.lock_timeout)?;

        let services = schedule(self.discover()?, filter);
        if services.is_empty() {
            warn!("No services to back up");
        } else {
            let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
            info!("Backing up {} services: {}", services.len(), names.join(", "));
        }

        let environments = self.credentials.prefetch(services.iter().map(|s| s.stack.as_str()));
        let ctx = Arc::new(BackupContext {
            runtime: self.runtime.clone(),
            dumper: DatabaseDumper::new(self.runtime.clone(), self.config.command_timeout),
            credentials: Arc::new(environments),
            identity: SelfIdentity::from_engine(&self.config),
            backup_dir: backup_dir.clone(),
            staging_dir: self.config.staging_dir(),
            data_root: self.config.data_root.clone(),
            stop_timeout: self.config.stop_timeout,
            observer: self.observer.clone(),
        });

        let limit = self.config.max_concurrent_backups.max(1);
        let pool = run_pool(ctx, services, limit);
        let services = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(pool),
            Err(_) => tokio::runtime::Builder::new_multi_thread()
                .worker_threads(limit.min(4))
                .thread_name("backup-worker")
                .enable_all()
                .build()
                .map_err(RunError::Runtime)?
                .block_on(pool),
        };

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            services,
        };

        let (done, partial, failed, skipped) = report.counts();
        info!(
            "Backup run finished: {} done, {} partial, {} failed, {} skipped",
            done, partial, failed, skipped
        );

        let path = self.config.last_run_path();
        if let Err(e) = report.save(&path) {
            warn!("Failed to write {}: {}", path.display(), e);
        }

        Ok(report)
    }
}

/// Apply the filter and order by priority, then name
fn schedule(services: Vec<Service>, filter: Option<&[String]>) -> Vec<Service> {
    let mut services = match filter {
        Some(names) if !names.is_empty() => {
            let wanted: Vec<String> = names.iter().map(|n| n.trim().to_lowercase()).collect();
            for name in &wanted {
                if !services.iter().any(|s| s.name.to_lowercase() == *name) {
                    warn!("Requested service '{}' was not discovered", name);
                }
            }
            services
                .into_iter()
                .filter(|s| wanted.contains(&s.name.to_lowercase()))
                .collect()
        }
        _ => services,
    };
    services.sort_by(|a, b| a.priority().cmp(&b.priority()).then_with(|| a.name.cmp(&b.name)));
    services
}

/// Run every service on the blocking pool with at most `limit` at a time.
/// Permits are taken in order, so services start in priority order.
async fn run_pool(ctx: Arc<BackupContext>, services: Vec<Service>, limit: usize) -> BTreeMap<String, ServiceReport> {
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut tasks = Vec::with_capacity(services.len());

    for service in services {
        let name = service.name.clone();
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            error!("Worker pool closed before '{}' could start", name);
            tasks.push((name, None));
            continue;
        };
        let ctx = ctx.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            ServiceBackup::new(&ctx, &service).run()
        });
        tasks.push((name, Some(handle)));
    }

    let mut reports = BTreeMap::new();
    for (name, handle) in tasks {
        let report = match handle {
            Some(handle) => match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Backup of '{}' panicked: {}", name, e);
                    ServiceReport::not_run(&name, ServiceOutcome::Failed("panicked".to_string()))
                }
            },
            None => ServiceReport::not_run(&name, ServiceOutcome::Failed("not started".to_string())),
        };
        reports.insert(name, report);
    }
    reports
}
