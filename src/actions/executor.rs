//! Executes configured actions against client-supplied data.
//!
//! ```text
//! data ─► fill defaults ─► validate ─► resolve templates ─► dispatch(kind)
//!                                                            ├─ sql  → registry → WritableSource::execute
//!                                                            ├─ exec → sh -c (gated by allow_exec)
//!                                                            └─ http → reqwest
//! ```

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::params::{fill_defaults, shell_quote, substitute_params, validate_params, value_text};
use super::{Action, ActionTarget};
use crate::context::Context;
use crate::source::env::expand_env;
use crate::source::exec::{run_shell, DEFAULT_EXEC_TIMEOUT};
use crate::source::rest::{read_capped, ERROR_EXCERPT_BYTES};
use crate::source::{Record, SourceLookup};
use crate::template::DefaultResolver;
use crate::types::{ActionConfig, Error, Result, RuntimeConfig};

/// Response bodies kept in an http outcome.
pub const MAX_ACTION_RESPONSE_BYTES: usize = 1024 * 1024;

/// Result of a successful action, reported to the client in `meta.result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutcome {
    Sql { rows_affected: u64 },
    Exec { stdout: String },
    Http { status: u16, body: String },
}

/// Operator-scoped settings, passed in rather than read from globals.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub operator: String,
    pub allow_exec: bool,
    pub exec_timeout: Duration,
    pub work_dir: PathBuf,
}

impl ExecutorSettings {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            operator: runtime.operator(),
            allow_exec: runtime.allow_exec,
            ..Self::default()
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            operator: String::new(),
            allow_exec: false,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            work_dir: PathBuf::from("."),
        }
    }
}

pub struct ActionExecutor {
    settings: ExecutorSettings,
    registry: Option<SourceLookup>,
    resolver: DefaultResolver,
    http: reqwest::Client,
}

impl ActionExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            resolver: DefaultResolver::new(settings.operator.clone()),
            settings,
            registry: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_registry(mut self, lookup: SourceLookup) -> Self {
        self.registry = Some(lookup);
        self
    }

    pub fn with_resolver(mut self, resolver: DefaultResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &DefaultResolver {
        &self.resolver
    }

    /// Parse `config` and execute it. Unknown kinds fail here.
    pub async fn execute_config(
        &self,
        ctx: &Context,
        name: &str,
        config: &ActionConfig,
        data: Record,
    ) -> Result<ActionOutcome> {
        let action = Action::from_config(name, config)?;
        self.execute(ctx, &action, data).await
    }

    pub async fn execute(&self, ctx: &Context, action: &Action, data: Record) -> Result<ActionOutcome> {
        let data = self.prepare(action, data)?;
        ctx.check(&action.name)?;

        let outcome = match &action.target {
            ActionTarget::Sql { source, statement } => {
                self.execute_sql(ctx, action, source, statement, &data).await
            }
            ActionTarget::Exec { cmd } => self.execute_exec(ctx, action, cmd, &data).await,
            ActionTarget::Http {
                url,
                method,
                body,
                headers,
            } => {
                self.execute_http(ctx, action, url, method, body.as_deref(), headers, &data)
                    .await
            }
        };

        match &outcome {
            Ok(_) => tracing::info!(action = %action.name, kind = %action.kind(), operator = %self.settings.operator, "action executed"),
            Err(err) => tracing::warn!(action = %action.name, kind = %action.kind(), error = %err, "action failed"),
        }
        outcome
    }

    /// Defaults, then validation, then template resolution.
    ///
    /// Resolution covers every string value, client-supplied ones included:
    /// a client may send `{{today}}`, and a malformed template fails the
    /// action before any side effect.
    fn prepare(&self, action: &Action, mut data: Record) -> Result<Record> {
        fill_defaults(&action.params, &mut data);
        validate_params(&action.params, &data)?;
        self.resolver.resolve_map(&data)
    }

    async fn execute_sql(
        &self,
        ctx: &Context,
        action: &Action,
        source_name: &str,
        statement: &str,
        data: &Record,
    ) -> Result<ActionOutcome> {
        let lookup = self.registry.as_ref().ok_or(Error::RegistryMissing)?;
        let source =
            lookup(source_name).ok_or_else(|| Error::SourceNotFound(source_name.to_string()))?;
        let writer = source.writable().ok_or_else(|| {
            Error::config(format!("source {source_name:?} does not accept statements"))
        })?;

        let (statement, args) = substitute_params(statement, data);
        tracing::debug!(action = %action.name, source = source_name, %statement, "running sql action");
        let rows_affected = writer.execute(ctx, &statement, &args).await?;
        Ok(ActionOutcome::Sql { rows_affected })
    }

    async fn execute_exec(
        &self,
        ctx: &Context,
        action: &Action,
        cmd: &str,
        data: &Record,
    ) -> Result<ActionOutcome> {
        if !self.settings.allow_exec {
            return Err(Error::ExecDisabled);
        }

        let mut quoted: Record = data
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(shell_quote(&value_text(v)))))
            .collect();
        quoted
            .entry("operator")
            .or_insert_with(|| serde_json::Value::String(shell_quote(&self.settings.operator)));
        let command = self.resolver.expand(cmd, &quoted)?;

        let timeout = ctx
            .remaining()
            .map_or(self.settings.exec_timeout, |left| left.min(self.settings.exec_timeout));
        tracing::info!(action = %action.name, operator = %self.settings.operator, "running exec action");
        let stdout = ctx
            .run(
                &action.name,
                run_shell(&action.name, &command, &self.settings.work_dir, timeout),
            )
            .await?;
        Ok(ActionOutcome::Exec { stdout })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_http(
        &self,
        ctx: &Context,
        action: &Action,
        url: &str,
        method: &str,
        body: Option<&str>,
        headers: &std::collections::BTreeMap<String, String>,
        data: &Record,
    ) -> Result<ActionOutcome> {
        let url = self.resolver.expand(url, data)?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::config(format!("action {:?}: invalid method {method:?}", action.name)))?;

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| Error::config(format!("action {:?}: invalid header name {key:?}", action.name)))?;
            let value = HeaderValue::from_str(&expand_env(value))
                .map_err(|_| Error::config(format!("action {:?}: invalid value for header {key:?}", action.name)))?;
            header_map.insert(name, value);
        }

        let mut request = self.http.request(method, &url);
        if let Some(template) = body {
            let rendered = self.resolver.expand(template, data)?;
            if !header_map.contains_key(CONTENT_TYPE) {
                header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            request = request.body(rendered);
        }
        let request = request.headers(header_map);

        let label = action.name.as_str();
        ctx.run(label, async move {
            let mut response = request
                .send()
                .await
                .map_err(|e| Error::transient(label, "request", e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let (excerpt, _) = read_capped(&mut response, ERROR_EXCERPT_BYTES)
                    .await
                    .unwrap_or_default();
                return Err(Error::Http {
                    source_name: label.to_string(),
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&excerpt).trim().to_string(),
                });
            }
            let (body, _) = read_capped(&mut response, MAX_ACTION_RESPONSE_BYTES)
                .await
                .map_err(|e| Error::transient(label, "read response", e.to_string()))?;
            Ok(ActionOutcome::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        })
        .await
    }
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("settings", &self.settings)
            .field("registry", &self.registry.is_some())
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}
