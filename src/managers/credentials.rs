//! Database credential lookup
//!
//! Credentials come from three places, in order: the service configuration,
//! the environment of the service's stack as recorded by Portainer, and the
//! environment of the database container itself. Stack environments are
//! fetched once per run, before any worker starts, and only read afterwards.

use crate::config::{mask_secret, Credentials, DatabaseType};
use crate::utils::portainer::{StackApi, StackEnv};
use percent_encoding::percent_decode_str;
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("No {db_type} credentials found for stack '{stack}'")]
    NotFound { stack: String, db_type: DatabaseType },
}

/// Key conventions for one database type. `{STACK}` and `{TYPE}` are
/// substituted before lookup.
struct Conventions {
    urls: &'static [&'static str],
    /// Superuser name and the keys that may hold its password
    root: Option<(&'static str, &'static [&'static str])>,
    users: &'static [&'static str],
    passwords: &'static [&'static str],
    databases: &'static [&'static str],
}

const HOST_KEYS: &[&str] = &["DB_HOST", "{TYPE}_HOST", "DATABASE_HOST", "{STACK}_DB_HOST"];
const PORT_KEYS: &[&str] = &["DB_PORT", "{TYPE}_PORT", "DATABASE_PORT"];

const POSTGRES: Conventions = Conventions {
    urls: &[
        "DATABASE_URL",
        "DB_URI",
        "POSTGRES_URI",
        "{STACK}_DATABASE_URL",
        "{STACK}_DB_URI",
    ],
    root: None,
    users: &[
        "DB_USER",
        "POSTGRES_USER",
        "PGUSER",
        "DATABASE_USER",
        "POSTGRESQL_USER",
        "{STACK}_DB_USER",
        "DB_USERNAME",
        "POSTGRES_NON_ROOT_USER",
    ],
    passwords: &[
        "DB_PASSWORD",
        "POSTGRES_PASSWORD",
        "PGPASSWORD",
        "DATABASE_PASSWORD",
        "POSTGRESQL_PASSWORD",
        "{STACK}_DB_PASSWORD",
        "POSTGRES_NON_ROOT_PASSWORD",
    ],
    databases: &[
        "DB_NAME",
        "POSTGRES_DB",
        "DB_DATABASE",
        "DATABASE_NAME",
        "POSTGRESQL_DATABASE",
        "{STACK}_DB_NAME",
    ],
};

const MYSQL: Conventions = Conventions {
    urls: &[
        "DATABASE_URL",
        "DB_URI",
        "MYSQL_URI",
        "{STACK}_DATABASE_URL",
        "{STACK}_DB_URI",
    ],
    root: Some((
        "root",
        &[
            "MYSQL_ROOT_PASSWORD",
            "MARIADB_ROOT_PASSWORD",
            "DB_ROOT_PASSWD",
            "INIT_{STACK}_MYSQL_ROOT_PASSWORD",
        ],
    )),
    users: &["DB_USER", "MYSQL_USER", "MARIADB_USER", "DATABASE_USER", "{STACK}_DB_USER"],
    passwords: &[
        "DB_PASSWORD",
        "MYSQL_PASSWORD",
        "MARIADB_PASSWORD",
        "DATABASE_PASSWORD",
        "{STACK}_DB_PASSWORD",
    ],
    databases: &[
        "DB_NAME",
        "MYSQL_DATABASE",
        "MARIADB_DATABASE",
        "DB_DATABASE",
        "DATABASE_NAME",
        "{STACK}_DB_NAME",
    ],
};

const MONGODB: Conventions = Conventions {
    urls: &["MONGO_URI", "MONGODB_URI", "DATABASE_URL", "{STACK}_DATABASE_URL"],
    root: None,
    users: &["MONGO_INITDB_ROOT_USERNAME", "MONGO_USER", "DB_USER"],
    passwords: &["MONGO_INITDB_ROOT_PASSWORD", "MONGO_PASSWORD", "DB_PASSWORD"],
    databases: &["MONGO_INITDB_DATABASE", "DB_NAME"],
};

const REDIS: Conventions = Conventions {
    urls: &["REDIS_URL"],
    root: None,
    users: &[],
    passwords: &["REDIS_PASSWORD", "REDIS_PASS", "DB_PASSWORD"],
    databases: &[],
};

const SQLITE: Conventions = Conventions {
    urls: &[],
    root: None,
    users: &[],
    passwords: &[],
    databases: &[],
};

fn conventions(db_type: DatabaseType) -> &'static Conventions {
    match db_type {
        DatabaseType::Postgres => &POSTGRES,
        DatabaseType::Mysql | DatabaseType::Mariadb => &MYSQL,
        DatabaseType::Mongodb => &MONGODB,
        DatabaseType::Redis => &REDIS,
        DatabaseType::Sqlite => &SQLITE,
    }
}

/// `{STACK}` placeholder value: upper case, `-` as `_`
fn stack_token(stack: &str) -> String {
    stack.to_uppercase().replace('-', "_")
}

struct KeyLookup<'a> {
    env: &'a HashMap<String, String>,
    stack: String,
    db_type: String,
}

impl<'a> KeyLookup<'a> {
    fn new(env: &'a HashMap<String, String>, stack: &str, db_type: DatabaseType) -> Self {
        Self {
            env,
            stack: stack_token(stack),
            db_type: db_type.as_str().to_uppercase(),
        }
    }

    /// First non-empty value among `keys`
    fn first(&self, keys: &[&str]) -> Option<(String, &'a str)> {
        keys.iter().find_map(|template| {
            let key = template.replace("{STACK}", &self.stack).replace("{TYPE}", &self.db_type);
            self.env
                .get(&key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        })
    }
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value.filter(|v| !v.is_empty());
    }
}

fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Seed credentials from a connection URL such as
/// `postgres://user:pass@db:5432/app`
fn from_url(value: &str) -> Option<Credentials> {
    let url = Url::parse(value).ok()?;
    let database = url.path().trim_start_matches('/');

    Some(Credentials {
        user: Some(percent_decode(url.username())).filter(|u| !u.is_empty()),
        password: url.password().map(percent_decode),
        database: Some(percent_decode(database)).filter(|d| !d.is_empty()),
        host: url.host_str().map(str::to_string),
        port: url.port(),
    })
}

/// Apply the conventions of `db_type` to one environment.
///
/// Returns `None` unless a user or a password was found.
pub fn extract_credentials(env: &HashMap<String, String>, stack: &str, db_type: DatabaseType) -> Option<Credentials> {
    let rules = conventions(db_type);
    let lookup = KeyLookup::new(env, stack, db_type);
    let mut creds = Credentials::default();

    if let Some((key, value)) = lookup.first(rules.urls) {
        match from_url(value) {
            Some(parsed) => {
                debug!("Using connection URL from {}", key);
                creds = parsed;
            }
            None => debug!("Ignoring unparsable connection URL in {}", key),
        }
    }

    if let Some((root_user, keys)) = rules.root {
        if creds.password.is_none() {
            if let Some((key, password)) = lookup.first(keys) {
                debug!("Using {} password from {}", root_user, key);
                creds.user = Some(root_user.to_string());
                creds.password = Some(password.to_string());
            }
        }
    }

    fill(&mut creds.user, lookup.first(rules.users).map(|(_, v)| v.to_string()));
    fill(&mut creds.password, lookup.first(rules.passwords).map(|(_, v)| v.to_string()));
    fill(&mut creds.database, lookup.first(rules.databases).map(|(_, v)| v.to_string()));
    fill(&mut creds.host, lookup.first(HOST_KEYS).map(|(_, v)| v.to_string()));
    if creds.port.is_none() {
        creds.port = lookup.first(PORT_KEYS).and_then(|(_, v)| v.trim().parse().ok());
    }

    if creds.user.is_none() && creds.password.is_none() {
        return None;
    }
    Some(creds)
}

/// Explicitly configured fields win over discovered ones
fn overlay(base: Credentials, explicit: &Credentials) -> Credentials {
    Credentials {
        user: explicit.user.clone().or(base.user),
        password: explicit.password.clone().or(base.password),
        database: explicit.database.clone().or(base.database),
        host: explicit.host.clone().or(base.host),
        port: explicit.port.or(base.port),
    }
}

#[derive(Debug, Clone)]
enum StackLookup {
    Found(StackEnv),
    Unknown,
    Unavailable(String),
}

/// Stack environments fetched for one run
#[derive(Debug, Clone, Default)]
pub struct StackEnvironments {
    stacks: HashMap<String, StackLookup>,
}

impl StackEnvironments {
    /// No stack environments at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Record the environment of `stack`
    pub fn with_stack(mut self, stack: &str, env: StackEnv) -> Self {
        self.stacks.insert(stack.to_string(), StackLookup::Found(env));
        self
    }

    pub fn environment(&self, stack: &str) -> Option<&StackEnv> {
        match self.stacks.get(stack) {
            Some(StackLookup::Found(env)) => Some(env),
            _ => None,
        }
    }

    /// Whether the stack API failed for `stack` during the prefetch
    pub fn is_unavailable(&self, stack: &str) -> bool {
        matches!(self.stacks.get(stack), Some(StackLookup::Unavailable(_)))
    }

    /// Credentials from the stack environment alone
    pub fn credentials_for(&self, stack: &str, db_type: DatabaseType) -> Result<Credentials, CredentialError> {
        self.environment(stack)
            .and_then(|env| extract_credentials(env, stack, db_type))
            .ok_or_else(|| CredentialError::NotFound {
                stack: stack.to_string(),
                db_type,
            })
    }

    /// Full lookup: explicit configuration, then the stack environment, then
    /// the container's own environment.
    pub fn resolve(
        &self,
        stack: &str,
        db_type: DatabaseType,
        explicit: Option<&Credentials>,
        container_env: &HashMap<String, String>,
    ) -> Result<Credentials, CredentialError> {
        let discovered = match self.credentials_for(stack, db_type) {
            Ok(creds) => Some(creds),
            Err(_) => {
                if let Some(StackLookup::Unavailable(reason)) = self.stacks.get(stack) {
                    debug!("Stack '{}' environment unavailable ({}), trying container", stack, reason);
                }
                extract_credentials(container_env, stack, db_type)
            }
        };

        let resolved = match (explicit, discovered) {
            (Some(explicit), Some(found)) => overlay(found, explicit),
            (Some(explicit), None) => explicit.clone(),
            (None, Some(found)) => found,
            (None, None) => Credentials::default(),
        };

        if resolved.user.is_none() && resolved.password.is_none() {
            return Err(CredentialError::NotFound {
                stack: stack.to_string(),
                db_type,
            });
        }

        info!(
            "Using {} credentials for '{}' (user: {}, password: {})",
            db_type,
            stack,
            resolved.user.as_deref().unwrap_or("-"),
            resolved.password.as_deref().map(mask_secret).unwrap_or_else(|| "-".to_string()),
        );
        Ok(resolved)
    }
}

/// Fetches stack environments from the stack API
#[derive(Clone, Default)]
pub struct CredentialClient {
    api: Option<Arc<dyn StackApi>>,
}

impl CredentialClient {
    pub fn new(api: Option<Arc<dyn StackApi>>) -> Self {
        Self { api }
    }

    pub fn is_configured(&self) -> bool {
        self.api.is_some()
    }

    /// Query every distinct stack once. Failures are logged and leave that
    /// stack without environment for this run.
    pub fn prefetch<'a, I>(&self, stacks: I) -> StackEnvironments
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut environments = StackEnvironments::empty();
        let Some(api) = &self.api else {
            debug!("No stack API configured, skipping credential prefetch");
            return environments;
        };

        let mut seen = HashSet::new();
        for stack in stacks {
            if !seen.insert(stack) {
                continue;
            }
            let lookup = match api.stack_environment(stack) {
                Ok(Some(env)) => {
                    debug!("Fetched {} variables for stack '{}'", env.len(), stack);
                    StackLookup::Found(env)
                }
                Ok(None) => StackLookup::Unknown,
                Err(e) => {
                    warn!("Could not fetch environment of stack '{}': {}", stack, e);
                    StackLookup::Unavailable(e.to_string())
                }
            };
            environments.stacks.insert(stack.to_string(), lookup);
        }

        environments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::portainer::mock::MockStackApi;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_postgres_field_conventions() {
        let env = env(&[
            ("POSTGRES_USER", "immich"),
            ("DB_PASSWORD", "hunter22"),
            ("POSTGRES_DB", "immich"),
            ("DB_PORT", "5433"),
        ]);
        let creds = extract_credentials(&env, "immich", DatabaseType::Postgres).unwrap();
        assert_eq!(creds.user.as_deref(), Some("immich"));
        assert_eq!(creds.password.as_deref(), Some("hunter22"));
        assert_eq!(creds.database.as_deref(), Some("immich"));
        assert_eq!(creds.port, Some(5433));
    }

    #[test]
    fn test_earlier_convention_wins() {
        let env = env(&[("DB_USER", "first"), ("POSTGRES_USER", "second"), ("PGPASSWORD", "x")]);
        let creds = extract_credentials(&env, "s", DatabaseType::Postgres).unwrap();
        assert_eq!(creds.user.as_deref(), Some("first"));
    }

    #[test]
    fn test_connection_url_is_parsed() {
        let env = env(&[("DATABASE_URL", "postgres://app:p%40ss@db:5432/appdb")]);
        let creds = extract_credentials(&env, "s", DatabaseType::Postgres).unwrap();
        assert_eq!(creds.user.as_deref(), Some("app"));
        assert_eq!(creds.password.as_deref(), Some("p@ss"));
        assert_eq!(creds.host.as_deref(), Some("db"));
        assert_eq!(creds.port, Some(5432));
        assert_eq!(creds.database.as_deref(), Some("appdb"));
    }

    #[test]
    fn test_connection_url_escapes_at_the_end() {
        let env = env(&[("DATABASE_URL", "mysql://wp%2Dadmin:secret%21@db/wordpress")]);
        let creds = extract_credentials(&env, "s", DatabaseType::Mysql).unwrap();
        assert_eq!(creds.user.as_deref(), Some("wp-admin"));
        assert_eq!(creds.password.as_deref(), Some("secret!"));
    }

    #[test]
    fn test_stack_placeholder() {
        let env = env(&[("MY_APP_DB_USER", "u"), ("MY_APP_DB_PASSWORD", "p")]);
        let creds = extract_credentials(&env, "my-app", DatabaseType::Postgres).unwrap();
        assert_eq!(creds.user.as_deref(), Some("u"));
    }

    #[test]
    fn test_mysql_prefers_root() {
        let env = env(&[
            ("MYSQL_USER", "wp"),
            ("MYSQL_PASSWORD", "wp-pass"),
            ("MYSQL_ROOT_PASSWORD", "root-pass"),
            ("MYSQL_DATABASE", "wordpress"),
        ]);
        let creds = extract_credentials(&env, "wordpress", DatabaseType::Mariadb).unwrap();
        assert_eq!(creds.user.as_deref(), Some("root"));
        assert_eq!(creds.password.as_deref(), Some("root-pass"));
        assert_eq!(creds.database.as_deref(), Some("wordpress"));
    }

    #[test]
    fn test_mysql_user_without_root() {
        let env = env(&[("MYSQL_USER", "wp"), ("MYSQL_PASSWORD", "wp-pass")]);
        let creds = extract_credentials(&env, "wordpress", DatabaseType::Mysql).unwrap();
        assert_eq!(creds.user.as_deref(), Some("wp"));
        assert_eq!(creds.password.as_deref(), Some("wp-pass"));
    }

    #[test]
    fn test_type_specific_host_key() {
        let env = env(&[("REDIS_PASSWORD", "r"), ("REDIS_HOST", "cache")]);
        let creds = extract_credentials(&env, "s", DatabaseType::Redis).unwrap();
        assert_eq!(creds.host.as_deref(), Some("cache"));
        assert!(creds.user.is_none());
    }

    #[test]
    fn test_nothing_matched() {
        let env = env(&[("DB_NAME", "app"), ("TZ", "UTC")]);
        assert!(extract_credentials(&env, "s", DatabaseType::Postgres).is_none());
        assert!(extract_credentials(&env, "s", DatabaseType::Sqlite).is_none());
    }

    #[test]
    fn test_prefetch_queries_each_stack_once() {
        let api = MockStackApi::new().with_stack("blog", &[("DB_USER", "a"), ("DB_PASSWORD", "b")]);
        let client = CredentialClient::new(Some(Arc::new(api.clone())));

        let envs = client.prefetch(["blog", "blog", "missing"]);

        assert_eq!(api.call_count("blog"), 1);
        assert_eq!(api.call_count("missing"), 1);
        assert!(envs.credentials_for("blog", DatabaseType::Postgres).is_ok());
        assert_eq!(
            envs.credentials_for("missing", DatabaseType::Postgres),
            Err(CredentialError::NotFound {
                stack: "missing".into(),
                db_type: DatabaseType::Postgres
            })
        );
    }

    #[test]
    fn test_unreachable_api_falls_back_to_container_env() {
        let client = CredentialClient::new(Some(Arc::new(MockStackApi::new().failing())));
        let envs = client.prefetch(["blog"]);
        assert!(envs.is_unavailable("blog"));

        let container_env = env(&[("POSTGRES_USER", "pg"), ("POSTGRES_PASSWORD", "pw")]);
        let creds = envs
            .resolve("blog", DatabaseType::Postgres, None, &container_env)
            .unwrap();
        assert_eq!(creds.user.as_deref(), Some("pg"));
    }

    #[test]
    fn test_explicit_fields_override_discovered() {
        let envs = StackEnvironments::empty().with_stack("shop", env(&[("DB_USER", "a"), ("DB_PASSWORD", "b")]));
        let explicit = Credentials {
            database: Some("orders".into()),
            user: Some("admin".into()),
            ..Default::default()
        };

        let creds = envs
            .resolve("shop", DatabaseType::Postgres, Some(&explicit), &HashMap::new())
            .unwrap();
        assert_eq!(creds.user.as_deref(), Some("admin"));
        assert_eq!(creds.password.as_deref(), Some("b"));
        assert_eq!(creds.database.as_deref(), Some("orders"));
    }

    #[test]
    fn test_resolve_not_found() {
        let envs = StackEnvironments::empty();
        let err = envs
            .resolve("app", DatabaseType::Postgres, None, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, CredentialError::NotFound { .. }));
    }

    #[test]
    fn test_no_api_prefetch_is_empty() {
        let client = CredentialClient::new(None);
        assert!(!client.is_configured());
        let envs = client.prefetch(["a"]);
        assert!(envs.environment("a").is_none());
        assert!(!envs.is_unavailable("a"));
    }
}
