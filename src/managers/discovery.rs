//! Service discovery
//!
//! Running containers are grouped into services by their stack label and
//! each container is classified by an ordered list of rules. The result is
//! re-derived on every run.

use crate::config::{ConfigResolver, DatabaseType, EngineConfig, ServiceConfig};
use crate::utils::docker_ops::{ContainerInfo, ContainerRuntime, Mount, RuntimeError};
use crate::utils::locker::local_hostname;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Labels naming the stack a container belongs to, highest priority first
pub const STACK_LABELS: &[&str] = &[
    "com.docker.compose.project",
    "com.docker.stack.namespace",
    "io.portainer.stackname",
];

/// Marks a container as part of the backup engine itself
pub const SELF_LABEL: &str = "container-backup.self";

/// Marks a container as safe to back up while running
pub const HOT_LABEL: &str = "container-backup.hot";

/// Host paths never archived from a bind mount
const SYSTEM_PATHS: &[&str] = &[
    "/proc",
    "/sys",
    "/dev",
    "/run",
    "/var/run",
    "/var/lock",
    "/tmp",
    "/var/tmp",
    "/var/cache",
    "/etc/hostname",
    "/etc/hosts",
    "/etc/resolv.conf",
    "/mnt/media",
    "/media",
    "/backups",
    "/mnt/backups",
];

fn is_system_path(path: &Path) -> bool {
    SYSTEM_PATHS.iter().any(|dir| path.starts_with(dir))
}

/// Bind mounts whose host side holds application data
pub fn data_mounts(mounts: &[Mount]) -> impl Iterator<Item = &Mount> {
    mounts.iter().filter(|m| {
        m.kind == "bind" && m.source.is_absolute() && !is_system_path(&m.source)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentRole {
    Database { db_type: Option<DatabaseType> },
    FileSource,
}

impl ComponentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentRole::Database { .. } => "database",
            ComponentRole::FileSource => "files",
        }
    }
}

/// One container of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Component {
    pub id: String,
    pub name: String,
    pub image: String,
    pub role: ComponentRole,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    #[serde(skip)]
    pub env: HashMap<String, String>,
}

impl Component {
    pub fn new(container: ContainerInfo, role: ComponentRole) -> Self {
        Self {
            id: container.id,
            name: container.name,
            image: container.image,
            role,
            running: container.running,
            labels: container.labels,
            mounts: container.mounts,
            env: container.env,
        }
    }

    /// Labelled as safe to back up while running
    pub fn is_hot(&self) -> bool {
        label_is_true(&self.labels, HOT_LABEL)
    }

    pub fn is_database(&self) -> bool {
        matches!(self.role, ComponentRole::Database { .. })
    }
}

/// A logical application made of one or more containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub name: String,
    pub stack: String,
    pub components: Vec<Component>,
    pub config: ServiceConfig,
    /// The engine's own container was found in this service
    pub contains_backup_tool: bool,
}

impl Service {
    pub fn databases(&self) -> impl Iterator<Item = &Component> {
        self.components.iter().filter(|c| c.is_database())
    }

    pub fn file_sources(&self) -> impl Iterator<Item = &Component> {
        self.components.iter().filter(|c| !c.is_database())
    }

    pub fn priority(&self) -> u32 {
        self.config.global.priority
    }

    /// Host sources of the file sources' data mounts, first seen first
    pub fn mount_sources(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.file_sources()
            .flat_map(|c| data_mounts(&c.mounts))
            .filter(|m| seen.insert(m.source.clone()))
            .map(|m| m.source.clone())
            .collect()
    }
}

/// Outcome of classifying one container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    BackupTool,
    Component(ComponentRole),
    Ignored,
}

/// How the engine recognises its own containers
#[derive(Debug, Clone, Default)]
pub struct SelfIdentity {
    names: Vec<String>,
    hostname: Option<String>,
}

impl SelfIdentity {
    pub fn new(names: Vec<String>, hostname: Option<String>) -> Self {
        Self {
            names: names.into_iter().map(|n| n.to_lowercase()).collect(),
            hostname: hostname.filter(|h| !h.is_empty()).map(|h| h.to_lowercase()),
        }
    }

    /// Identity of the running process: configured names plus own hostname,
    /// which inside a container is its short id
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self::new(config.self_service_names.clone(), Some(local_hostname()))
    }

    fn name_matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.names.iter().any(|n| {
            name == *n || name.starts_with(&format!("{}_", n)) || name.starts_with(&format!("{}-", n))
        })
    }

    /// Whether a service of this name is the engine itself
    pub fn is_self_service(&self, service: &str) -> bool {
        let service = service.to_lowercase();
        self.names.iter().any(|n| service == *n)
    }

    pub fn matches(&self, container: &ContainerInfo) -> bool {
        self.matches_parts(&container.id, &container.name, &container.hostname, &container.labels)
    }

    pub fn matches_component(&self, component: &Component) -> bool {
        self.matches_parts(&component.id, &component.name, "", &component.labels)
    }

    fn matches_parts(&self, id: &str, name: &str, hostname: &str, labels: &HashMap<String, String>) -> bool {
        if label_is_true(labels, SELF_LABEL) {
            return true;
        }
        if let Some(own) = &self.hostname {
            let id = id.to_lowercase();
            if name.to_lowercase() == *own
                || hostname.to_lowercase() == *own
                || (own.len() >= 12 && id.starts_with(own.as_str()))
            {
                return true;
            }
        }
        self.name_matches(name)
    }
}

fn label_is_true(labels: &HashMap<String, String>, key: &str) -> bool {
    labels
        .get(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Stack of a container: first stack label present, else its name
pub fn stack_name(container: &ContainerInfo) -> String {
    STACK_LABELS
        .iter()
        .find_map(|label| container.labels.get(*label).filter(|v| !v.is_empty()))
        .cloned()
        .unwrap_or_else(|| container.name.clone())
}

/// Glob match when the pattern has wildcards, substring match otherwise.
/// Case-insensitive.
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let candidate = candidate.to_lowercase();

    if pattern.contains(['*', '?', '[']) {
        match glob::Pattern::new(&pattern) {
            Ok(glob) => glob.matches(&candidate),
            Err(e) => {
                debug!("Invalid container pattern '{}': {}", pattern, e);
                false
            }
        }
    } else {
        candidate.contains(&pattern)
    }
}

/// Classify one container of a service. Rules are tried in order and the
/// first match wins.
pub fn classify(container: &ContainerInfo, config: &ServiceConfig, identity: &SelfIdentity) -> Classification {
    if identity.matches(container) {
        return Classification::BackupTool;
    }

    let detected = DatabaseType::from_image(&container.image);
    let patterns = &config.database.container_patterns;

    if patterns
        .iter()
        .any(|p| pattern_matches(p, &container.image) || pattern_matches(p, &container.name))
    {
        return Classification::Component(ComponentRole::Database {
            db_type: config.database.db_type.or(detected),
        });
    }

    if patterns.is_empty() {
        if let Some(db_type) = detected {
            return Classification::Component(ComponentRole::Database { db_type: Some(db_type) });
        }
    }

    if !config.files.data_paths.is_empty() || data_mounts(&container.mounts).next().is_some() {
        return Classification::Component(ComponentRole::FileSource);
    }

    Classification::Ignored
}

pub struct ServiceDiscovery {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<ConfigResolver>,
    identity: SelfIdentity,
    excluded: Vec<String>,
}

impl ServiceDiscovery {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<ConfigResolver>,
        identity: SelfIdentity,
        excluded: Vec<String>,
    ) -> Self {
        Self {
            runtime,
            resolver,
            identity,
            excluded: excluded.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    fn is_excluded(&self, name: &str, config: &ServiceConfig) -> bool {
        let lower = name.to_lowercase();
        self.excluded.iter().any(|s| *s == lower) || config.global.excluded
    }

    /// Enumerate running containers and build the list of services to back up
    pub fn discover(&self) -> Result<Vec<Service>, RuntimeError> {
        let containers = self.runtime.list_containers()?;
        if containers.is_empty() {
            warn!("No running containers found");
            return Ok(Vec::new());
        }
        info!("Found {} running containers", containers.len());

        let mut grouped: BTreeMap<String, Vec<ContainerInfo>> = BTreeMap::new();
        for container in containers {
            grouped.entry(stack_name(&container)).or_default().push(container);
        }

        let mut services = Vec::new();
        for (stack, mut members) in grouped {
            if self.identity.is_self_service(&stack) {
                debug!("Skipping own service '{}'", stack);
                continue;
            }

            let config = self.resolver.resolve(&stack);
            if self.is_excluded(&stack, &config) {
                info!("Service '{}' is excluded from backup", stack);
                continue;
            }

            members.sort_by(|a, b| a.name.cmp(&b.name));
            let mut components = Vec::new();
            let mut contains_backup_tool = false;

            for container in members {
                match classify(&container, &config, &self.identity) {
                    Classification::BackupTool => {
                        warn!(
                            "Container '{}' in service '{}' belongs to the backup engine",
                            container.name, stack
                        );
                        contains_backup_tool = true;
                    }
                    Classification::Component(role) => {
                        debug!("{} / {}: {}", stack, container.name, role.as_str());
                        components.push(Component::new(container, role));
                    }
                    Classification::Ignored => {
                        debug!("{} / {}: ignored", stack, container.name);
                    }
                }
            }

            if components.is_empty() && config.database.is_empty() && config.files.is_empty() {
                debug!("Service '{}' has nothing to back up", stack);
                continue;
            }

            services.push(Service {
                name: stack.clone(),
                stack,
                components,
                config,
                contains_backup_tool,
            });
        }

        info!("Discovered {} services for backup", services.len());
        Ok(services)
    }
}
