use super::loader::{env_overlays, file_overlays};
use super::types::*;
use std::collections::BTreeMap;

/// Resolves the effective configuration of any service name.
///
/// Layers, lowest precedence first: built-in defaults, built-in presets for
/// well-known applications, the config file, `SERVICE_CONFIG_<NAME>`
/// environment blocks. Merging happens per field.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    default_retention_days: u32,
    file: BTreeMap<String, ServiceOverlay>,
    env: BTreeMap<String, ServiceOverlay>,
}

impl ConfigResolver {
    pub fn new(
        default_retention_days: u32,
        file: BTreeMap<String, ServiceOverlay>,
        env: BTreeMap<String, ServiceOverlay>,
    ) -> Self {
        let normalize = |layer: BTreeMap<String, ServiceOverlay>| -> BTreeMap<String, ServiceOverlay> {
            layer
                .into_iter()
                .map(|(name, overlay)| (service_key(&name), overlay))
                .collect()
        };
        Self {
            default_retention_days,
            file: normalize(file),
            env: normalize(env),
        }
    }

    /// Build a resolver from the engine settings, reading the config file and
    /// the environment override blocks once.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self::new(config.default_retention_days, file_overlays(config), env_overlays(config))
    }

    /// Effective configuration of `service`. Never fails.
    pub fn resolve(&self, service: &str) -> ServiceConfig {
        let key = service_key(service);
        let mut resolved = ServiceConfig {
            database: DatabaseSpec::default(),
            files: FileSpec::default(),
            global: GlobalSpec {
                retention_policy: RetentionPolicy::TimeBased {
                    days: self.default_retention_days,
                },
                excluded: false,
                priority: default_priority(),
            },
        };

        let preset = builtin_preset(&key);
        let layers = [preset.as_ref(), self.file.get(&key), self.env.get(&key)];
        for overlay in layers.into_iter().flatten() {
            apply(&mut resolved, overlay);
        }

        resolved
    }

    /// Names with explicit configuration in the file or environment
    pub fn configured_services(&self) -> impl Iterator<Item = &str> {
        self.file.keys().chain(self.env.keys()).map(String::as_str)
    }
}

fn apply(target: &mut ServiceConfig, overlay: &ServiceOverlay) {
    if let Some(db) = &overlay.database {
        if db.db_type.is_some() {
            target.database.db_type = db.db_type;
        }
        if let Some(v) = db.requires_stopping {
            target.database.requires_stopping = v;
        }
        if let Some(v) = &db.container_patterns {
            target.database.container_patterns = v.clone();
        }
        if db.credentials.is_some() {
            target.database.credentials = db.credentials.clone();
        }
    }

    if let Some(files) = &overlay.files {
        if let Some(v) = &files.data_paths {
            target.files.data_paths = v.clone();
        }
        if let Some(v) = files.requires_stopping {
            target.files.requires_stopping = v;
        }
        if let Some(v) = &files.exclusions {
            target.files.exclusions = v.clone();
        }
    }

    if let Some(global) = &overlay.global {
        if let Some(policy) = global.retention() {
            target.global.retention_policy = policy;
        }
        if let Some(v) = global.excluded {
            target.global.excluded = v;
        }
        if let Some(v) = global.priority {
            target.global.priority = v;
        }
    }
}

fn strings(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|s| s.to_string()).collect())
}

/// Known layout of a popular self-hosted application
struct Preset {
    name: &'static str,
    db_type: DatabaseType,
    patterns: &'static [&'static str],
    stop_database: bool,
    data_paths: &'static [&'static str],
    exclusions: &'static [&'static str],
}

const PRESETS: &[Preset] = &[
    Preset {
        name: "wordpress",
        db_type: DatabaseType::Mysql,
        patterns: &["*mysql*", "*mariadb*"],
        stop_database: false,
        data_paths: &["wp-content"],
        exclusions: &["wp-content/cache/*", "wp-content/debug.log"],
    },
    Preset {
        name: "nextcloud",
        db_type: DatabaseType::Postgres,
        patterns: &["*postgres*"],
        stop_database: false,
        data_paths: &["data", "config"],
        exclusions: &["data/*/cache/*", "data/updater-*"],
    },
    Preset {
        name: "homeassistant",
        db_type: DatabaseType::Sqlite,
        patterns: &["*homeassistant*", "*home-assistant*"],
        stop_database: true,
        data_paths: &["config"],
        exclusions: &["config/home-assistant_v2.db-shm", "config/home-assistant_v2.db-wal"],
    },
];

fn builtin_preset(key: &str) -> Option<ServiceOverlay> {
    let preset = PRESETS.iter().find(|p| p.name == key)?;

    Some(ServiceOverlay {
        database: Some(DatabaseOverlay {
            db_type: Some(preset.db_type),
            requires_stopping: Some(preset.stop_database),
            container_patterns: strings(preset.patterns),
            credentials: None,
        }),
        files: Some(FilesOverlay {
            data_paths: strings(preset.data_paths),
            requires_stopping: None,
            exclusions: strings(preset.exclusions),
        }),
        global: None,
    })
}
