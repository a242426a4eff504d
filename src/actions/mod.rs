//! Configuration-declared side effects.
//!
//! An [`Action`] is parsed once from its [`ActionConfig`]; the kind becomes a
//! closed [`ActionTarget`] so every dispatch site is an exhaustive match.

pub mod executor;
pub mod params;

pub use executor::{ActionExecutor, ActionOutcome, ExecutorSettings};
pub use params::{fill_defaults, shell_quote, substitute_params, validate_params};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::types::{ActionConfig, Error, ParamDef, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Sql,
    Exec,
    Http,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Sql => "sql",
            ActionKind::Exec => "exec",
            ActionKind::Http => "http",
        }
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sql" => Ok(ActionKind::Sql),
            "exec" => Ok(ActionKind::Exec),
            "http" | "rest" => Ok(ActionKind::Http),
            other => Err(Error::UnknownActionKind(other.to_string())),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action does, per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionTarget {
    Sql {
        source: String,
        statement: String,
    },
    Exec {
        cmd: String,
    },
    Http {
        url: String,
        method: String,
        body: Option<String>,
        headers: BTreeMap<String, String>,
    },
}

/// A validated, immutable action definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    pub target: ActionTarget,
    pub params: BTreeMap<String, ParamDef>,
}

impl Action {
    pub fn from_config(name: &str, config: &ActionConfig) -> Result<Self> {
        let kind: ActionKind = config.kind.parse()?;
        let require = |value: &Option<String>, field: &str| -> Result<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
                .ok_or_else(|| {
                    Error::config(format!("action {name:?}: {kind} actions require {field}"))
                })
        };

        let target = match kind {
            ActionKind::Sql => ActionTarget::Sql {
                source: require(&config.source, "source")?,
                statement: require(&config.statement, "statement")?,
            },
            ActionKind::Exec => ActionTarget::Exec {
                cmd: require(&config.cmd, "cmd")?,
            },
            ActionKind::Http => {
                let method = config
                    .method
                    .as_deref()
                    .unwrap_or("POST")
                    .to_ascii_uppercase();
                reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| {
                    Error::config(format!("action {name:?}: invalid method {method:?}"))
                })?;
                ActionTarget::Http {
                    url: require(&config.url, "url")?,
                    method,
                    body: config.body.clone(),
                    headers: config.headers.clone(),
                }
            }
        };

        Ok(Self {
            name: name.to_string(),
            target,
            params: config.params.clone(),
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self.target {
            ActionTarget::Sql { .. } => ActionKind::Sql,
            ActionTarget::Exec { .. } => ActionKind::Exec,
            ActionTarget::Http { .. } => ActionKind::Http,
        }
    }

    /// Registered source this action writes through, if any.
    pub fn source_name(&self) -> Option<&str> {
        match &self.target {
            ActionTarget::Sql { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Parse every configured action.
pub fn load_actions(configs: &BTreeMap<String, ActionConfig>) -> Result<BTreeMap<String, Action>> {
    configs
        .iter()
        .map(|(name, config)| Ok((name.clone(), Action::from_config(name, config)?)))
        .collect()
}
