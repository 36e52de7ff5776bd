use super::types::*;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Prefix of per-service JSON override variables
pub const SERVICE_CONFIG_PREFIX: &str = "SERVICE_CONFIG_";

impl EngineConfig {
    /// Load engine settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load engine settings from an explicit set of variables
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let defaults = EngineConfig::default();

        let max_concurrent_backups = match get("MAX_CONCURRENT_BACKUPS") {
            Some(v) => parse_number::<usize>("MAX_CONCURRENT_BACKUPS", v)?,
            None => defaults.max_concurrent_backups,
        };
        if max_concurrent_backups == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_BACKUPS".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let default_retention_days = match get("BACKUP_RETENTION_DAYS") {
            Some(v) => parse_number::<u32>("BACKUP_RETENTION_DAYS", v)?,
            None => defaults.default_retention_days,
        };
        RetentionPolicy::TimeBased {
            days: default_retention_days,
        }
        .validate()
        .map_err(|reason| ConfigError::InvalidValue {
            key: "BACKUP_RETENTION_DAYS".into(),
            value: default_retention_days.to_string(),
            reason,
        })?;

        let service_overrides = vars
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(SERVICE_CONFIG_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (service_key(name), value.clone()))
            })
            .collect::<BTreeMap<_, _>>();

        let portainer = match get("PORTAINER_URL") {
            Some(url) => {
                let auth = get("PORTAINER_TOKEN")
                    .map(|t| PortainerAuth::Bearer(t.to_string()))
                    .or_else(|| get("PORTAINER_API_KEY").map(|k| PortainerAuth::ApiKey(k.to_string())));
                match auth {
                    Some(auth) => Some(PortainerSettings {
                        url: url.trim_end_matches('/').to_string(),
                        auth,
                        insecure: get("PORTAINER_INSECURE").map(parse_bool).unwrap_or(false),
                    }),
                    None => {
                        warn!("PORTAINER_URL is set but neither PORTAINER_TOKEN nor PORTAINER_API_KEY is; stack credentials disabled");
                        None
                    }
                }
            }
            None => None,
        };

        let logging = LogSettings {
            level: get("LOG_LEVEL").unwrap_or("info").to_lowercase(),
            directory: get("LOG_DIR").map(|d| expand_tilde(Path::new(d))),
            json: get("LOG_FORMAT").map(|f| f.eq_ignore_ascii_case("json")).unwrap_or(false),
            max_files: match get("LOG_MAX_FILES") {
                Some(v) => parse_number("LOG_MAX_FILES", v)?,
                None => defaults.logging.max_files,
            },
        };

        Ok(Self {
            backup_dir: get("BACKUP_DIR")
                .map(|d| expand_tilde(Path::new(d)))
                .unwrap_or(defaults.backup_dir),
            data_root: get("DATA_ROOT")
                .map(|d| expand_tilde(Path::new(d)))
                .unwrap_or(defaults.data_root),
            max_concurrent_backups,
            default_retention_days,
            excluded_services: get("EXCLUDE_FROM_BACKUP").map(split_list).unwrap_or_default(),
            self_service_names: get("BACKUP_SERVICE_NAMES")
                .map(split_list)
                .unwrap_or(defaults.self_service_names),
            lock_timeout: duration_var(&get, "LOCK_TIMEOUT", defaults.lock_timeout)?,
            command_timeout: duration_var(&get, "COMMAND_TIMEOUT", defaults.command_timeout)?,
            stop_timeout: duration_var(&get, "STOP_TIMEOUT", defaults.stop_timeout)?,
            config_file: get("CONFIG_FILE").map(|p| expand_tilde(Path::new(p))),
            service_overrides,
            portainer,
            logging,
        })
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Durations accept humantime syntax (`3h`, `90s`) or bare seconds
fn duration_var<'a, F>(get: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<&'a str>,
{
    match get(key) {
        None => Ok(default),
        Some(v) => parse_duration(v).map_err(|reason| ConfigError::InvalidValue {
            key: key.to_string(),
            value: v.to_string(),
            reason,
        }),
    }
}

/// Parse `24h`, `30m`, `1h 30m` or a plain number of seconds
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

/// Expand tilde (~) in path
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Load the per-service config file as raw values keyed by service.
///
/// The top level is a map of service name to service block. A top-level
/// `services` table is also accepted. TOML is used for `.toml` files, JSON
/// otherwise.
pub fn load_service_file<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, serde_json::Value>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let value: serde_json::Value = if path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
    {
        let table: toml::Table = toml::from_str(&contents)?;
        serde_json::to_value(table)?
    } else {
        serde_json::from_str(&contents)?
    };

    let value = match value {
        serde_json::Value::Object(mut map) if map.get("services").map_or(false, |s| s.is_object()) => {
            map.remove("services").unwrap_or_default()
        }
        other => other,
    };

    match value {
        serde_json::Value::Object(map) => {
            debug!("Loaded {} service blocks from {:?}", map.len(), path);
            Ok(map.into_iter().collect())
        }
        _ => Err(ConfigError::ValidationError(format!(
            "{:?}: expected a map of service name to configuration",
            path
        ))),
    }
}

/// Parse one service block, dropping it with a warning if it is invalid
pub fn parse_overlay(source: &str, service: &str, value: serde_json::Value) -> Option<ServiceOverlay> {
    let overlay = match serde_json::from_value::<ServiceOverlay>(value) {
        Ok(overlay) => overlay,
        Err(e) => {
            warn!("Ignoring invalid {} config for service '{}': {}", source, service, e);
            return None;
        }
    };

    if let Err(reason) = overlay.validate() {
        warn!("Ignoring invalid {} config for service '{}': {}", source, service, reason);
        return None;
    }

    Some(overlay)
}

/// Parse the `SERVICE_CONFIG_<NAME>` blocks of `config`
pub fn env_overlays(config: &EngineConfig) -> BTreeMap<String, ServiceOverlay> {
    config
        .service_overrides
        .iter()
        .filter_map(|(name, raw)| {
            let value = match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Ignoring malformed {}{}: {}", SERVICE_CONFIG_PREFIX, name.to_uppercase(), e);
                    return None;
                }
            };
            parse_overlay("environment", name, value).map(|overlay| (name.clone(), overlay))
        })
        .collect()
}

/// Parse the config file named by `config`, if any. A broken file is
/// reported and treated as empty.
pub fn file_overlays(config: &EngineConfig) -> BTreeMap<String, ServiceOverlay> {
    let Some(path) = config.config_file.as_ref() else {
        return BTreeMap::new();
    };

    match load_service_file(path) {
        Ok(blocks) => blocks
            .into_iter()
            .filter_map(|(name, value)| {
                parse_overlay("file", &name, value).map(|overlay| (service_key(&name), overlay))
            })
            .collect(),
        Err(e) => {
            warn!("Ignoring config file {:?}: {}", path, e);
            BTreeMap::new()
        }
    }
}
