//! Portainer stack API client
//!
//! Only the read side is used: the list of stacks and the environment
//! variables recorded for each of them.

use crate::config::{PortainerAuth, PortainerSettings};
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variables of one stack
pub type StackEnv = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum PortainerError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Portainer rejected the credentials ({status})")]
    Unauthorized { status: StatusCode },

    #[error("Portainer returned {status} for {url}")]
    Status { url: String, status: StatusCode },
}

impl PortainerError {
    fn is_retryable(&self) -> bool {
        match self {
            PortainerError::Request { .. } => true,
            PortainerError::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// Source of per-stack environment variables
pub trait StackApi: Send + Sync {
    /// Environment of the stack named `stack`, `None` if there is no such stack
    fn stack_environment(&self, stack: &str) -> Result<Option<StackEnv>, PortainerError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackSummary {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackDetail {
    #[serde(default)]
    env: Option<Vec<EnvEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvEntry {
    Pair {
        name: String,
        #[serde(default)]
        value: Option<String>,
    },
    Line(String),
}

/// Retry behaviour for transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

pub struct PortainerClient {
    settings: PortainerSettings,
    client: Client,
    retry: RetryPolicy,
    /// Lower-cased stack name -> id, fetched once
    stack_ids: Mutex<Option<HashMap<String, u64>>>,
}

impl PortainerClient {
    pub fn new(settings: PortainerSettings) -> Result<Self, PortainerError> {
        if settings.insecure {
            warn!("TLS certificate verification disabled for {}", settings.url);
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(settings.insecure)
            .build()
            .map_err(PortainerError::Client)?;

        Ok(Self {
            settings,
            client,
            retry: RetryPolicy::default(),
            stack_ids: Mutex::new(None),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.settings.auth {
            PortainerAuth::Bearer(token) => request.bearer_auth(token),
            PortainerAuth::ApiKey(key) => request.header("X-API-Key", key),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PortainerError> {
        let url = format!("{}{}", self.settings.url, path);
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;

        loop {
            debug!("GET {} (attempt {})", url, attempt);
            let result = self
                .authorized(self.client.get(&url))
                .send()
                .map_err(|source| PortainerError::Request {
                    url: url.clone(),
                    source,
                })
                .and_then(|response| match response.status() {
                    status if status.is_success() => response.json::<T>().map_err(|source| PortainerError::Request {
                        url: url.clone(),
                        source,
                    }),
                    status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                        Err(PortainerError::Unauthorized { status })
                    }
                    status => Err(PortainerError::Status {
                        url: url.clone(),
                        status,
                    }),
                });

            match result {
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    warn!("{} (retrying in {:?})", e, backoff);
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn stack_id(&self, stack: &str) -> Result<Option<u64>, PortainerError> {
        let mut cache = self.stack_ids.lock().unwrap_or_else(|e| e.into_inner());
        if cache.is_none() {
            let stacks: Vec<StackSummary> = self.get_json("/api/stacks")?;
            info!("Portainer reports {} stacks", stacks.len());
            *cache = Some(stacks.into_iter().map(|s| (s.name.to_lowercase(), s.id)).collect());
        }
        Ok(cache
            .as_ref()
            .and_then(|ids| ids.get(&stack.to_lowercase()).copied()))
    }
}

impl StackApi for PortainerClient {
    fn stack_environment(&self, stack: &str) -> Result<Option<StackEnv>, PortainerError> {
        let Some(id) = self.stack_id(stack)? else {
            debug!("Stack '{}' not known to Portainer", stack);
            return Ok(None);
        };

        let detail: StackDetail = self.get_json(&format!("/api/stacks/{}", id))?;
        let mut env: StackEnv = detail
            .env
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| match entry {
                EnvEntry::Pair { name, value } => Some((name, value.unwrap_or_default())),
                EnvEntry::Line(line) => line.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())),
            })
            .collect();
        resolve_references(&mut env);

        debug!("Stack '{}' has {} environment variables", stack, env.len());
        Ok(Some(env))
    }
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").expect("reference pattern is valid")
    })
}

/// Replace `${VAR}` and `$VAR` with values from the same environment.
/// Unknown references are left untouched.
pub fn resolve_references(env: &mut StackEnv) {
    let snapshot = env.clone();
    let pattern = reference_pattern();

    for value in env.values_mut() {
        if !value.contains('$') {
            continue;
        }
        let replaced = pattern
            .replace_all(value.as_str(), |caps: &regex::Captures| {
                let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or_default();
                snapshot
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();
        *value = replaced;
    }
}

/// Mock implementation for testing
/// Available for use in external test crates
#[allow(dead_code)]
pub mod mock {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    pub struct MockStackApi {
        stacks: Arc<Mutex<HashMap<String, StackEnv>>>,
        fail: Arc<Mutex<bool>>,
        /// Stacks queried, in order
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockStackApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_stack(self, name: &str, env: &[(&str, &str)]) -> Self {
            self.stacks.lock().unwrap().insert(
                name.to_string(),
                env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            );
            self
        }

        /// Make every query fail as if the API were unreachable
        pub fn failing(self) -> Self {
            *self.fail.lock().unwrap() = true;
            self
        }

        pub fn call_count(&self, stack: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|s| *s == stack).count()
        }
    }

    impl StackApi for MockStackApi {
        fn stack_environment(&self, stack: &str) -> Result<Option<StackEnv>, PortainerError> {
            self.calls.lock().unwrap().push(stack.to_string());
            if *self.fail.lock().unwrap() {
                return Err(PortainerError::Unauthorized {
                    status: StatusCode::UNAUTHORIZED,
                });
            }
            let mut env = self.stacks.lock().unwrap().get(stack).cloned();
            if let Some(env) = env.as_mut() {
                resolve_references(env);
            }
            Ok(env)
        }
    }
}
