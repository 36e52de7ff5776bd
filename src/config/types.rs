use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide settings, read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Where archives, locks and run reports live
    pub backup_dir: PathBuf,

    /// Base directory holding each service's data (`<data_root>/<service>`)
    pub data_root: PathBuf,

    pub max_concurrent_backups: usize,

    /// Days kept by the default time-based retention policy
    pub default_retention_days: u32,

    /// Services never backed up, lower-cased
    pub excluded_services: Vec<String>,

    /// Names identifying the backup engine's own containers, lower-cased
    pub self_service_names: Vec<String>,

    pub lock_timeout: Duration,
    pub command_timeout: Duration,
    pub stop_timeout: Duration,

    /// Optional per-service config file (JSON, or TOML by extension)
    pub config_file: Option<PathBuf>,

    /// Raw `SERVICE_CONFIG_<NAME>` JSON blocks keyed by normalized service name
    pub service_overrides: BTreeMap<String, String>,

    pub portainer: Option<PortainerSettings>,

    pub logging: LogSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from(default_backup_dir()),
            data_root: PathBuf::from(default_data_root()),
            max_concurrent_backups: default_max_concurrent(),
            default_retention_days: default_retention_days(),
            excluded_services: Vec::new(),
            self_service_names: split_list(default_self_names()),
            lock_timeout: Duration::from_secs(3 * 3600),
            command_timeout: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(30),
            config_file: None,
            service_overrides: BTreeMap::new(),
            portainer: None,
            logging: LogSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Directory holding the run lock
    pub fn lock_dir(&self) -> PathBuf {
        self.backup_dir.join("locks")
    }

    /// Directory holding per-run staging directories
    pub fn staging_dir(&self) -> PathBuf {
        self.backup_dir.join(".staging")
    }

    /// Location of the persisted report of the last run
    pub fn last_run_path(&self) -> PathBuf {
        self.backup_dir.join("last_run.json")
    }

    pub fn is_service_excluded(&self, service: &str) -> bool {
        let service = service.to_lowercase();
        self.excluded_services.iter().any(|s| *s == service)
    }
}

/// Connection settings for the Portainer stack API
#[derive(Clone, PartialEq, Eq)]
pub struct PortainerSettings {
    pub url: String,
    pub auth: PortainerAuth,
    pub insecure: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub enum PortainerAuth {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `X-API-Key: <key>`
    ApiKey(String),
}

impl PortainerAuth {
    pub fn scheme(&self) -> &'static str {
        match self {
            PortainerAuth::Bearer(_) => "bearer",
            PortainerAuth::ApiKey(_) => "api-key",
        }
    }
}

impl fmt::Debug for PortainerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(****)", self.scheme())
    }
}

impl fmt::Debug for PortainerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortainerSettings")
            .field("url", &self.url)
            .field("auth", &self.auth)
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub directory: Option<PathBuf>,
    pub json: bool,
    pub max_files: u32,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            json: false,
            max_files: 10,
        }
    }
}

/// Database engines the dispatcher knows how to dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[serde(alias = "postgresql", alias = "pgvecto")]
    Postgres,
    Mysql,
    Mariadb,
    #[serde(alias = "mongo")]
    Mongodb,
    Redis,
    Sqlite,
}

impl DatabaseType {
    /// Guess the database type from an image reference
    pub fn from_image(image: &str) -> Option<Self> {
        // Ignore the registry and tag: "ghcr.io/org/postgres:16" -> "postgres"
        let repo = image.rsplit('/').next().unwrap_or(image);
        let repo = repo.split([':', '@']).next().unwrap_or(repo).to_lowercase();

        if repo.contains("postgres") || repo.contains("pgvecto") || repo.contains("postgis") {
            Some(DatabaseType::Postgres)
        } else if repo.contains("mariadb") {
            Some(DatabaseType::Mariadb)
        } else if repo.contains("mysql") {
            Some(DatabaseType::Mysql)
        } else if repo.contains("mongo") {
            Some(DatabaseType::Mongodb)
        } else if repo.contains("redis") || repo.contains("valkey") {
            Some(DatabaseType::Redis)
        } else if repo.contains("sqlite") {
            Some(DatabaseType::Sqlite)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgres",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Mariadb => "mariadb",
            DatabaseType::Mongodb => "mongodb",
            DatabaseType::Redis => "redis",
            DatabaseType::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long archives of a service are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    TimeBased { days: u32 },
    CountBased { keep: u32 },
    Mixed { daily: u32, weekly: u32, monthly: u32 },
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            RetentionPolicy::TimeBased { days: 0 } => Err("time_based.days must be at least 1".into()),
            RetentionPolicy::CountBased { keep: 0 } => Err("count_based.keep must be at least 1".into()),
            RetentionPolicy::Mixed {
                daily: 0,
                weekly: 0,
                monthly: 0,
            } => Err("mixed retention must keep at least one bucket".into()),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::TimeBased { days } => write!(f, "time-based ({} days)", days),
            RetentionPolicy::CountBased { keep } => write!(f, "count-based (keep {})", keep),
            RetentionPolicy::Mixed { daily, weekly, monthly } => {
                write!(f, "mixed ({} daily, {} weekly, {} monthly)", daily, weekly, monthly)
            }
        }
    }
}

/// Database credentials. The password is never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_deref().map(mask_secret))
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Mask a secret for logging: `ab****yz`, or `****` when short
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Resolved configuration of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConfig {
    pub database: DatabaseSpec,
    pub files: FileSpec,
    pub global: GlobalSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseSpec {
    #[serde(rename = "type")]
    pub db_type: Option<DatabaseType>,
    pub requires_stopping: bool,
    pub container_patterns: Vec<String>,
    pub credentials: Option<Credentials>,
}

impl DatabaseSpec {
    pub fn is_empty(&self) -> bool {
        self.db_type.is_none() && self.container_patterns.is_empty() && self.credentials.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileSpec {
    pub data_paths: Vec<String>,
    pub requires_stopping: bool,
    pub exclusions: Vec<String>,
}

impl FileSpec {
    pub fn is_empty(&self) -> bool {
        self.data_paths.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalSpec {
    pub retention_policy: RetentionPolicy,
    pub excluded: bool,
    pub priority: u32,
}

/// Partial service configuration, as found in one configuration source.
/// Unset fields fall through to the next source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceOverlay {
    #[serde(default)]
    pub database: Option<DatabaseOverlay>,
    #[serde(default)]
    pub files: Option<FilesOverlay>,
    #[serde(default)]
    pub global: Option<GlobalOverlay>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DatabaseOverlay {
    #[serde(rename = "type", default)]
    pub db_type: Option<DatabaseType>,
    #[serde(default)]
    pub requires_stopping: Option<bool>,
    #[serde(default)]
    pub container_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilesOverlay {
    #[serde(default)]
    pub data_paths: Option<Vec<String>>,
    #[serde(default)]
    pub requires_stopping: Option<bool>,
    #[serde(default)]
    pub exclusions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GlobalOverlay {
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,

    /// Shorthand for `time_based { days }`
    #[serde(default)]
    pub backup_retention: Option<u32>,

    /// Shorthand for `mixed { .. }`
    #[serde(default)]
    pub mixed_retention: Option<MixedRetention>,

    #[serde(default, alias = "exclude_from_backup")]
    pub excluded: Option<bool>,

    #[serde(default)]
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MixedRetention {
    #[serde(default = "default_mixed_daily")]
    pub daily: u32,
    #[serde(default = "default_mixed_weekly")]
    pub weekly: u32,
    #[serde(default = "default_mixed_monthly")]
    pub monthly: u32,
}

impl GlobalOverlay {
    /// The retention policy this layer sets, most explicit form first
    pub fn retention(&self) -> Option<RetentionPolicy> {
        self.retention_policy
            .or_else(|| {
                self.mixed_retention.map(|m| RetentionPolicy::Mixed {
                    daily: m.daily,
                    weekly: m.weekly,
                    monthly: m.monthly,
                })
            })
            .or_else(|| self.backup_retention.map(|days| RetentionPolicy::TimeBased { days }))
    }
}

impl ServiceOverlay {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(policy) = self.global.as_ref().and_then(GlobalOverlay::retention) {
            policy.validate()?;
        }
        if let Some(patterns) = self.files.as_ref().and_then(|f| f.exclusions.as_ref()) {
            for pattern in patterns {
                glob::Pattern::new(pattern).map_err(|e| format!("invalid exclusion '{}': {}", pattern, e))?;
            }
        }
        Ok(())
    }
}

/// Normalized lookup key for a service name: lower case, `-` as `_`
pub fn service_key(name: &str) -> String {
    name.trim().to_lowercase().replace('-', "_")
}

/// Split a comma/whitespace separated list into lower-cased entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

// Default value functions
pub(crate) fn default_backup_dir() -> &'static str {
    "/backups"
}

pub(crate) fn default_data_root() -> &'static str {
    "/opt/docker"
}

pub(crate) fn default_max_concurrent() -> usize {
    3
}

pub(crate) fn default_retention_days() -> u32 {
    7
}

pub(crate) fn default_self_names() -> &'static str {
    "container-backup,backup"
}

pub(crate) fn default_priority() -> u32 {
    100
}

fn default_mixed_daily() -> u32 {
    7
}

fn default_mixed_weekly() -> u32 {
    4
}

fn default_mixed_monthly() -> u32 {
    3
}
