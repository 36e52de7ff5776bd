pub mod database;
pub mod files;

use crate::config::{Credentials, DatabaseType};
use crate::managers::discovery::Component;
use crate::utils::docker_ops::ContainerRuntime;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use database::{DatabaseDumper, DumpArtifact, DumpFailure};
pub use files::{ArchiveArtifact, ArchiveError, FileArchiver};

/// Everything a dump strategy may use
pub struct DumpContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub component: &'a Component,
    pub credentials: Option<&'a Credentials>,
    pub timeout: Duration,
}

/// Trait for database dump strategies
pub trait DumpStrategy: Send + Sync {
    /// Get strategy name (for logging)
    fn name(&self) -> &'static str;

    /// File name of the artifact for a container
    fn artifact_name(&self, container: &str) -> String;

    /// Whether the dump runs inside the container
    fn requires_running(&self) -> bool {
        true
    }

    /// Whether a user name is mandatory
    fn requires_credentials(&self) -> bool {
        false
    }

    /// Write the dump to `output` and return the committed path
    fn dump(&self, ctx: &DumpContext<'_>, output: &Path) -> Result<PathBuf, DumpFailure>;
}

/// The strategy for a database type
pub fn strategy_for(db_type: DatabaseType) -> &'static dyn DumpStrategy {
    match db_type {
        DatabaseType::Postgres => &database::Postgres,
        DatabaseType::Mysql | DatabaseType::Mariadb => &database::Mysql,
        DatabaseType::Mongodb => &database::Mongodb,
        DatabaseType::Redis => &database::Redis,
        DatabaseType::Sqlite => &database::Sqlite,
    }
}
