//! Configuration structures.
//!
//! Configuration is loaded from a YAML or JSON file and then overridden by
//! environment variables. Source and action definitions are plain data here;
//! they are validated and turned into live objects by the source registry and
//! the action layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{Error, Result};
use crate::actions::Action;

/// Environment variable that overrides the operator identity.
pub const ENV_OPERATOR: &str = "LIVEDOC_OPERATOR";
/// Environment variable that enables exec actions (`1`, `true`, `yes`).
pub const ENV_ALLOW_EXEC: &str = "LIVEDOC_ALLOW_EXEC";

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Operator identity and exec permission.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Per-session limits.
    #[serde(default)]
    pub session: SessionConfig,

    /// Default retry policy for sources.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Default circuit breaker policy for sources.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Named data sources.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,

    /// Named side-effecting actions.
    #[serde(default)]
    pub actions: BTreeMap<String, ActionConfig>,
}

impl Config {
    /// Load from a file. `.yaml`/`.yml` are parsed as YAML, anything else as JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config = if is_yaml {
            Self::from_yaml_str(&text)?
        } else {
            Self::from_json_str(&text)?
        };
        tracing::debug!(path = %path.display(), sources = config.sources.len(), actions = config.actions.len(), "config loaded");
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::config(format!("invalid JSON config: {}", e)))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::config(format!("invalid YAML config: {}", e)))
    }

    /// Apply `LIVEDOC_OPERATOR` / `LIVEDOC_ALLOW_EXEC` on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(operator) = std::env::var(ENV_OPERATOR) {
            if !operator.is_empty() {
                self.runtime.operator = Some(operator);
            }
        }
        if let Ok(flag) = std::env::var(ENV_ALLOW_EXEC) {
            self.runtime.allow_exec = matches!(
                flag.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    /// Check every action definition and its source references.
    pub fn validate(&self) -> Result<()> {
        for (name, action) in &self.actions {
            let action = Action::from_config(name, action)?;
            if let Some(source) = action.source_name() {
                if !self.sources.contains_key(source) {
                    return Err(Error::config(format!(
                        "action {:?} references unknown source {:?}",
                        name, source
                    )));
                }
            }
        }
        self.retry.validate("retry")?;
        self.circuit_breaker.validate("circuit_breaker")?;
        for (name, source) in &self.sources {
            if let Some(retry) = &source.retry {
                retry.validate(&format!("sources.{name}.retry"))?;
            }
            if let Some(breaker) = &source.circuit_breaker {
                breaker.validate(&format!("sources.{name}.circuit_breaker"))?;
            }
        }
        Ok(())
    }

    /// Retry policy for a source: per-source override or the global default.
    pub fn retry_for(&self, source: &SourceConfig) -> RetryConfig {
        source.retry.clone().unwrap_or_else(|| self.retry.clone())
    }

    /// Breaker policy for a source: per-source override or the global default.
    pub fn breaker_for(&self, source: &SourceConfig) -> CircuitBreakerConfig {
        source
            .circuit_breaker
            .clone()
            .unwrap_or_else(|| self.circuit_breaker.clone())
    }
}

/// Operator-scoped settings. Passed explicitly into the action executor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Identity attributed to actions. Defaults to `$USER` when unset.
    #[serde(default)]
    pub operator: Option<String>,

    /// Whether exec actions and exec sources may run.
    #[serde(default)]
    pub allow_exec: bool,
}

impl RuntimeConfig {
    /// Resolved operator identity (`$USER` fallback, then empty).
    pub fn operator(&self) -> String {
        match &self.operator {
            Some(op) if !op.is_empty() => op.clone(),
            _ => std::env::var("USER").unwrap_or_default(),
        }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline applied to each routed action.
    #[serde(with = "humantime_serde")]
    pub action_timeout: Duration,

    /// Inbound queue capacity (raw messages awaiting processing).
    pub inbound_capacity: usize,

    /// Outbound queue capacity (encoded responses awaiting delivery).
    pub outbound_capacity: usize,

    /// Messages larger than this are rejected without decoding.
    pub max_message_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(30),
            inbound_capacity: 64,
            outbound_capacity: 64,
            max_message_bytes: 1024 * 1024,
        }
    }
}

/// Retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier (>= 1).
    pub multiplier: f64,

    /// Log each failed attempt.
    pub enable_log: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            enable_log: true,
        }
    }
}

impl RetryConfig {
    /// `at` names the config key in errors.
    pub fn validate(&self, at: &str) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config(format!("{at}.multiplier must be >= 1")));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::config(format!("{at}.base_delay must not exceed max_delay")));
        }
        Ok(())
    }
}

/// Circuit breaker policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time spent open before a trial request is allowed.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self, at: &str) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::config(format!("{at}.failure_threshold must be >= 1")));
        }
        Ok(())
    }
}

/// Source variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Rest,
    Graphql,
    Exec,
    Sql,
}

/// Source definition. Which fields are required depends on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// Endpoint URL (rest, graphql).
    #[serde(default, alias = "url")]
    pub from: Option<String>,

    /// HTTP method (rest). Defaults to GET.
    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub query_params: BTreeMap<String, String>,

    /// Legacy string options (`method`, `headers`, `auth_header`, `api_key`, `dsn`).
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Dot-separated path to the result array.
    #[serde(default)]
    pub result_path: Option<String>,

    /// Query text (graphql, sql).
    #[serde(default)]
    pub query: Option<String>,

    /// GraphQL query loaded from a file.
    #[serde(default)]
    pub query_file: Option<PathBuf>,

    /// GraphQL variables.
    #[serde(default)]
    pub variables: Option<Value>,

    /// Shell command (exec).
    #[serde(default)]
    pub cmd: Option<String>,

    /// Working directory (exec).
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Connection descriptor (sql).
    #[serde(default)]
    pub dsn: Option<String>,

    /// Per-call timeout.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl SourceConfig {
    /// Empty definition of the given type.
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            from: None,
            method: None,
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            options: BTreeMap::new(),
            result_path: None,
            query: None,
            query_file: None,
            variables: None,
            cmd: None,
            cwd: None,
            dsn: None,
            timeout: None,
            retry: None,
            circuit_breaker: None,
        }
    }

    /// Look up a legacy option, treating empty strings as absent.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Parameter declaration for an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    #[serde(default)]
    pub required: bool,

    /// Value used when the client omits the parameter. May contain `{{ }}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Action definition as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionConfig {
    /// `sql`, `exec` or `http` (alias `rest`).
    pub kind: String,

    /// Registered source (sql).
    #[serde(default)]
    pub source: Option<String>,

    /// Statement with `:name` placeholders (sql).
    #[serde(default)]
    pub statement: Option<String>,

    /// Command template (exec).
    #[serde(default)]
    pub cmd: Option<String>,

    /// URL template (http).
    #[serde(default)]
    pub url: Option<String>,

    /// HTTP method (http). Defaults to POST.
    #[serde(default)]
    pub method: Option<String>,

    /// Body template (http).
    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub params: BTreeMap<String, ParamDef>,
}
