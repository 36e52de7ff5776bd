//! Database dump strategies
//!
//! Dumps run inside the database container through the runtime's exec, with
//! secrets passed in the exec environment. Output is streamed into a gzip
//! file that only takes its final name once complete.

use super::{strategy_for, DumpContext, DumpStrategy};
use crate::config::{Credentials, DatabaseType};
use crate::managers::discovery::{Component, ComponentRole};
use crate::utils::archive::{finish_gzip, gzip_file, PartialFile};
use crate::utils::command::CommandError;
use crate::utils::docker_ops::{ContainerRuntime, Mount, RuntimeError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Where the official redis image keeps its snapshot
const REDIS_DUMP_PATH: &str = "/data/dump.rdb";

const SQLITE_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];
/// Write-ahead log and shared-memory files next to a live database
const SQLITE_SIDECARS: &[&str] = &["-wal", "-shm"];
const SQLITE_SCAN_DEPTH: usize = 6;

/// Characters refused in credential values that end up in argv
const UNSAFE_CHARS: &[char] = &[';', '|', '&', '`', '$', '<', '>', '\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpFailure {
    #[error("container is not running")]
    NotRunning,

    #[error("no credentials found")]
    NoCredentials,

    #[error("database type could not be determined")]
    UnknownType,

    #[error("dump timed out")]
    Timeout,

    #[error("dump tool failed: {0}")]
    ToolFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential field '{0}' contains shell metacharacters")]
    UnsafeCredentials(&'static str),

    #[error("no database files found in container mounts")]
    NoDatabaseFiles,
}

impl DumpFailure {
    /// Short machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            DumpFailure::NotRunning => "not-running",
            DumpFailure::NoCredentials => "no-credentials",
            DumpFailure::UnknownType => "unknown-type",
            DumpFailure::Timeout => "timeout",
            DumpFailure::ToolFailed(_) => "tool-failed",
            DumpFailure::Io(_) => "io",
            DumpFailure::UnsafeCredentials(_) => "unsafe-credentials",
            DumpFailure::NoDatabaseFiles => "no-database-files",
        }
    }
}

impl From<io::Error> for DumpFailure {
    fn from(e: io::Error) -> Self {
        DumpFailure::Io(e.to_string())
    }
}

impl From<RuntimeError> for DumpFailure {
    fn from(e: RuntimeError) -> Self {
        match e {
            e if e.is_timeout() => DumpFailure::Timeout,
            RuntimeError::Command(CommandError::Failed { stderr, code, .. }) => {
                if stderr.is_empty() {
                    DumpFailure::ToolFailed(format!("exit code {:?}", code))
                } else {
                    DumpFailure::ToolFailed(stderr)
                }
            }
            RuntimeError::Command(CommandError::Stream { source, .. }) => DumpFailure::Io(source.to_string()),
            other => DumpFailure::ToolFailed(other.to_string()),
        }
    }
}

/// A finished dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpArtifact {
    pub db_type: DatabaseType,
    pub path: PathBuf,
    pub size: u64,
}

fn check_safe(creds: &Credentials) -> Result<(), DumpFailure> {
    let fields = [
        ("user", creds.user.as_deref()),
        ("database", creds.database.as_deref()),
        ("host", creds.host.as_deref()),
    ];
    for (field, value) in fields {
        if value.is_some_and(|v| v.contains(UNSAFE_CHARS)) {
            return Err(DumpFailure::UnsafeCredentials(field));
        }
    }
    Ok(())
}

fn secret_env(key: &str, creds: Option<&Credentials>) -> Vec<(String, String)> {
    creds
        .and_then(|c| c.password.clone())
        .map(|password| vec![(key.to_string(), password)])
        .unwrap_or_default()
}

fn required_user<'a>(ctx: &DumpContext<'a>) -> Result<&'a str, DumpFailure> {
    ctx.credentials
        .and_then(|c| c.user.as_deref())
        .ok_or(DumpFailure::NoCredentials)
}

/// Run `command` in the container and gzip its stdout into `output`
fn exec_to_gzip(
    ctx: &DumpContext<'_>,
    command: &[&str],
    env: &[(String, String)],
    output: &Path,
) -> Result<PathBuf, DumpFailure> {
    debug!("exec in {}: {}", ctx.component.name, command.join(" "));
    let mut encoder = gzip_file(output)?;
    ctx.runtime
        .exec(&ctx.component.id, command, env, ctx.timeout, &mut encoder)?;
    Ok(finish_gzip(encoder)?)
}

pub struct Postgres;

impl DumpStrategy for Postgres {
    fn name(&self) -> &'static str {
        "pg_dump"
    }

    fn artifact_name(&self, container: &str) -> String {
        format!("{}.sql.gz", container)
    }

    fn requires_credentials(&self) -> bool {
        true
    }

    fn dump(&self, ctx: &DumpContext<'_>, output: &Path) -> Result<PathBuf, DumpFailure> {
        let user = required_user(ctx)?;
        let creds = ctx.credentials;
        let port = creds.and_then(|c| c.port).map(|p| p.to_string());

        let mut command = vec!["pg_dump", "-U", user];
        if let Some(host) = creds.and_then(|c| c.host.as_deref()) {
            command.extend(["-h", host]);
        }
        if let Some(port) = port.as_deref() {
            command.extend(["-p", port]);
        }
        if let Some(database) = creds.and_then(|c| c.database.as_deref()) {
            command.push(database);
        }

        exec_to_gzip(ctx, &command, &secret_env("PGPASSWORD", creds), output)
    }
}

pub struct Mysql;

impl DumpStrategy for Mysql {
    fn name(&self) -> &'static str {
        "mysqldump"
    }

    fn artifact_name(&self, container: &str) -> String {
        format!("{}.sql.gz", container)
    }

    fn requires_credentials(&self) -> bool {
        true
    }

    fn dump(&self, ctx: &DumpContext<'_>, output: &Path) -> Result<PathBuf, DumpFailure> {
        let user = required_user(ctx)?;
        let creds = ctx.credentials;
        let port = creds.and_then(|c| c.port).map(|p| p.to_string());

        let mut command = vec!["mysqldump", "-u", user];
        if let Some(host) = creds.and_then(|c| c.host.as_deref()) {
            command.extend(["-h", host]);
        }
        if let Some(port) = port.as_deref() {
            command.extend(["-P", port]);
        }
        command.extend(["--single-transaction", "--routines"]);
        match creds.and_then(|c| c.database.as_deref()) {
            Some(database) => command.extend(["--databases", database]),
            None => command.push("--all-databases"),
        }

        exec_to_gzip(ctx, &command, &secret_env("MYSQL_PWD", creds), output)
    }
}

pub struct Mongodb;

impl DumpStrategy for Mongodb {
    fn name(&self) -> &'static str {
        "mongodump"
    }

    fn artifact_name(&self, container: &str) -> String {
        format!("{}.archive.gz", container)
    }

    fn dump(&self, ctx: &DumpContext<'_>, output: &Path) -> Result<PathBuf, DumpFailure> {
        let creds = ctx.credentials;
        let user = creds.and_then(|c| c.user.as_deref());
        let has_password = creds.is_some_and(|c| c.password.is_some());

        // mongodump only takes the password as an argument, so let the
        // container's shell expand it from the environment.
        let script = "exec mongodump --archive --gzip --authenticationDatabase admin \
                      --username \"$1\" --password \"$MONGO_BACKUP_PASSWORD\"";
        let (command, env) = match user {
            Some(user) if has_password => (
                vec!["sh", "-c", script, "sh", user],
                secret_env("MONGO_BACKUP_PASSWORD", creds),
            ),
            _ => (vec!["mongodump", "--archive", "--gzip"], Vec::new()),
        };

        debug!("exec in {}: {}", ctx.component.name, command[0]);
        // Already compressed by mongodump
        let mut file = PartialFile::create(output)?;
        ctx.runtime
            .exec(&ctx.component.id, &command, &env, ctx.timeout, &mut file)?;
        Ok(file.commit()?)
    }
}

pub struct Redis;

impl DumpStrategy for Redis {
    fn name(&self) -> &'static str {
        "redis-cli"
    }

    fn artifact_name(&self, container: &str) -> String {
        format!("{}.rdb.gz", container)
    }

    fn dump(&self, ctx: &DumpContext<'_>, output: &Path) -> Result<PathBuf, DumpFailure> {
        let env = secret_env("REDISCLI_AUTH", ctx.credentials);

        match ctx
            .runtime
            .exec(&ctx.component.id, &["redis-cli", "SAVE"], &env, ctx.timeout, &mut io::sink())
        {
            Ok(_) => debug!("redis SAVE completed in {}", ctx.component.name),
            Err(e) if e.is_timeout() => return Err(DumpFailure::Timeout),
            Err(e) => warn!(
                "redis SAVE failed in {}, copying the existing snapshot: {}",
                ctx.component.name, e
            ),
        }

        exec_to_gzip(ctx, &["cat", REDIS_DUMP_PATH], &[], output)
    }
}

pub struct Sqlite;

impl Sqlite {
    fn is_database_file(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SQLITE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
    }

    /// Database files below the host side of each mount, paired with their
    /// name inside the archive
    fn find_files(mounts: &[Mount]) -> Vec<(PathBuf, String)> {
        let mut files = Vec::new();

        for mount in mounts {
            let prefix = mount.destination.trim_matches('/');
            for entry in WalkDir::new(&mount.source)
                .max_depth(SQLITE_SCAN_DEPTH)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        debug!("Skipping unreadable path: {}", e);
                        None
                    }
                })
            {
                if !entry.file_type().is_file() || !Self::is_database_file(entry.path()) {
                    continue;
                }
                let relative = entry.path().strip_prefix(&mount.source).unwrap_or(entry.path());
                let name = if relative.as_os_str().is_empty() {
                    prefix.to_string()
                } else if prefix.is_empty() {
                    relative.display().to_string()
                } else {
                    format!("{}/{}", prefix, relative.display())
                };
                files.push((entry.path().to_path_buf(), name));
            }
        }

        files
    }
}

impl Sqlite {
    /// Sidecar files of `files` that exist, named after their database
    fn sidecars(files: &[(PathBuf, String)]) -> Vec<(PathBuf, String)> {
        files
            .iter()
            .flat_map(|(path, name)| {
                SQLITE_SIDECARS.iter().filter_map(move |suffix| {
                    let mut sidecar = path.as_os_str().to_owned();
                    sidecar.push(suffix);
                    let sidecar = PathBuf::from(sidecar);
                    sidecar.is_file().then(|| (sidecar, format!("{}{}", name, suffix)))
                })
            })
            .collect()
    }
}

impl DumpStrategy for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite-copy"
    }

    fn artifact_name(&self, container: &str) -> String {
        format!("{}.sqlite.tar.gz", container)
    }

    fn requires_running(&self) -> bool {
        false
    }

    fn dump(&self, ctx: &DumpContext<'_>, output: &Path) -> Result<PathBuf, DumpFailure> {
        let mut files = Self::find_files(&ctx.component.mounts);
        if files.is_empty() {
            return Err(DumpFailure::NoDatabaseFiles);
        }
        // Committed transactions may still live only in the WAL
        if ctx.component.running {
            let sidecars = Self::sidecars(&files);
            debug!("Copying {} sidecar files of a running database", sidecars.len());
            files.extend(sidecars);
        }

        let mut builder = tar::Builder::new(gzip_file(output)?);
        for (path, name) in &files {
            debug!("Adding {} as {}", path.display(), name);
            builder.append_path_with_name(path, name)?;
        }
        Ok(finish_gzip(builder.into_inner()?)?)
    }
}

/// Dispatches a database component to the strategy for its type
#[derive(Clone)]
pub struct DatabaseDumper {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl DatabaseDumper {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Dump `component` into `output_dir`
    pub fn backup(
        &self,
        component: &Component,
        credentials: Option<&Credentials>,
        output_dir: &Path,
    ) -> Result<DumpArtifact, DumpFailure> {
        let db_type = match component.role {
            ComponentRole::Database { db_type: Some(db_type) } => db_type,
            _ => return Err(DumpFailure::UnknownType),
        };
        let strategy = strategy_for(db_type);

        if strategy.requires_running() && !component.running {
            return Err(DumpFailure::NotRunning);
        }
        if strategy.requires_credentials() && credentials.and_then(|c| c.user.as_ref()).is_none() {
            return Err(DumpFailure::NoCredentials);
        }
        if let Some(creds) = credentials {
            check_safe(creds)?;
        }

        fs::create_dir_all(output_dir)?;
        let output = output_dir.join(strategy.artifact_name(&component.name));

        info!("Dumping {} database '{}' with {}", db_type, component.name, strategy.name());
        let started = Instant::now();
        let ctx = DumpContext {
            runtime: self.runtime.as_ref(),
            component,
            credentials,
            timeout: self.timeout,
        };
        let path = strategy.dump(&ctx, &output)?;
        let size = fs::metadata(&path)?.len();

        info!(
            "Dumped '{}' ({} bytes) in {:.2}s",
            component.name,
            size,
            started.elapsed().as_secs_f64()
        );
        Ok(DumpArtifact { db_type, path, size })
    }
}
