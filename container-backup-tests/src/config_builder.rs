//! Fluent API for building test configurations
//!
//! `ServiceConfigBuilder` produces the JSON of a `SERVICE_CONFIG_<NAME>`
//! block; `ConfigBuilder` produces an `EngineConfig` rooted in a temp dir.

use container_backup::config::{service_key, EngineConfig};
use serde_json::{json, Map, Value};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Builder for one service's override block
#[derive(Debug, Clone, Default)]
pub struct ServiceConfigBuilder {
    database: Map<String, Value>,
    files: Map<String, Value>,
    global: Map<String, Value>,
}

impl ServiceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_type(mut self, db_type: &str) -> Self {
        self.database.insert("type".into(), json!(db_type));
        self
    }

    pub fn stop_database(mut self) -> Self {
        self.database.insert("requires_stopping".into(), json!(true));
        self
    }

    pub fn container_patterns(mut self, patterns: &[&str]) -> Self {
        self.database.insert("container_patterns".into(), json!(patterns));
        self
    }

    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.database
            .insert("credentials".into(), json!({ "user": user, "password": password }));
        self
    }

    pub fn data_paths(mut self, paths: &[&str]) -> Self {
        self.files.insert("data_paths".into(), json!(paths));
        self
    }

    pub fn stop_files(mut self) -> Self {
        self.files.insert("requires_stopping".into(), json!(true));
        self
    }

    pub fn exclusions(mut self, patterns: &[&str]) -> Self {
        self.files.insert("exclusions".into(), json!(patterns));
        self
    }

    pub fn keep_last(mut self, keep: u32) -> Self {
        self.global
            .insert("retention_policy".into(), json!({ "count_based": { "keep": keep } }));
        self
    }

    pub fn mixed_retention(mut self, daily: u32, weekly: u32, monthly: u32) -> Self {
        self.global.insert(
            "mixed_retention".into(),
            json!({ "daily": daily, "weekly": weekly, "monthly": monthly }),
        );
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.global.insert("priority".into(), json!(priority));
        self
    }

    pub fn excluded(mut self) -> Self {
        self.global.insert("excluded".into(), json!(true));
        self
    }

    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        for (key, section) in [("database", &self.database), ("files", &self.files), ("global", &self.global)] {
            if !section.is_empty() {
                root.insert(key.into(), Value::Object(section.clone()));
            }
        }
        Value::Object(root)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Builder for an engine configuration living in a temp dir
pub struct ConfigBuilder {
    temp_dir: TempDir,
    config: EngineConfig,
}

impl ConfigBuilder {
    /// Backup root `<tmp>/backups`, data root `<tmp>/data`, short timeouts,
    /// one backup at a time
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let data_root = temp_dir.path().join("data");
        fs::create_dir_all(&data_root).expect("Failed to create data root");

        let config = EngineConfig {
            backup_dir: temp_dir.path().join("backups"),
            data_root,
            max_concurrent_backups: 1,
            stop_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(3600),
            ..Default::default()
        };

        Self { temp_dir, config }
    }

    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.config.max_concurrent_backups = limit;
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.config.default_retention_days = days;
        self
    }

    pub fn service(mut self, name: &str, service: ServiceConfigBuilder) -> Self {
        self.config.service_overrides.insert(service_key(name), service.to_json());
        self
    }

    pub fn exclude_service(mut self, name: &str) -> Self {
        self.config.excluded_services.push(name.to_lowercase());
        self
    }

    pub fn self_names(mut self, names: &[&str]) -> Self {
        self.config.self_service_names = names.iter().map(|n| n.to_lowercase()).collect();
        self
    }

    /// Write a config file into the temp dir and point the engine at it
    pub fn config_file(mut self, name: &str, contents: &str) -> Self {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, contents).expect("Failed to write config file");
        self.config.config_file = Some(path);
        self
    }

    pub fn build(self) -> (EngineConfig, TempDir) {
        (self.config, self.temp_dir)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
