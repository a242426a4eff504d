//! Pluggable external data sources.
//!
//! Every variant implements [`Source`]; the [`SourceRegistry`] maps logical
//! names to instances once, at configuration load, and is shared read-only by
//! every session afterwards.
//!
//! ```text
//!   Config.sources ──► SourceRegistry::from_config
//!                         │
//!                         ├─ rest    ─┐
//!                         ├─ graphql ─┤  fetch = breaker(retry(op))
//!                         ├─ exec    ─┤
//!                         └─ sql     ─┘  (+ WritableSource::execute)
//! ```

pub mod env;
pub mod exec;
pub mod graphql;
pub mod json;
pub mod rest;
pub mod sql;

pub use exec::ExecSource;
pub use graphql::GraphqlSource;
pub use rest::RestSource;
pub use sql::SqlSource;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::resilience::{BreakerSnapshot, Resilience};
use crate::types::{Config, Error, Result, SourceConfig, SourceType};

/// One fetched row.
pub type Record = serde_json::Map<String, Value>;

/// Name resolution consumed by the action executor.
pub type SourceLookup = Arc<dyn Fn(&str) -> Option<Arc<dyn Source>> + Send + Sync>;

// =============================================================================
// Traits
// =============================================================================

/// External data provider. Each `fetch` is independent; nothing is cached.
#[async_trait]
pub trait Source: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn fetch(&self, ctx: &Context) -> Result<Vec<Record>>;

    /// Release held connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Statement execution, for sources that accept writes.
    fn writable(&self) -> Option<&dyn WritableSource> {
        None
    }

    fn health(&self) -> Option<BreakerSnapshot> {
        None
    }
}

/// A source that also runs parameterized statements.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WritableSource: Send + Sync {
    /// Run `statement` with positional `args`; returns rows affected.
    async fn execute(&self, ctx: &Context, statement: &str, args: &[Value]) -> Result<u64>;
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Arc<BTreeMap<String, Arc<dyn Source>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured source. Exec sources are refused unless
    /// `runtime.allow_exec` is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut sources: BTreeMap<String, Arc<dyn Source>> = BTreeMap::new();
        for (name, source_config) in &config.sources {
            if source_config.source_type == SourceType::Exec && !config.runtime.allow_exec {
                return Err(Error::config(format!(
                    "source {name:?}: exec sources disabled (use --allow-exec flag)"
                )));
            }
            let policy = Resilience::new(
                name.clone(),
                config.retry_for(source_config),
                config.breaker_for(source_config),
            );
            let source = build_source(name, source_config, policy)?;
            tracing::info!(source = %name, kind = ?source_config.source_type, "source registered");
            sources.insert(name.clone(), source);
        }
        Ok(Self {
            sources: Arc::new(sources),
        })
    }

    /// Copy of this registry with `source` added (or replaced).
    pub fn with_source(&self, source: Arc<dyn Source>) -> Self {
        let mut sources = (*self.sources).clone();
        sources.insert(source.name().to_string(), source);
        Self {
            sources: Arc::new(sources),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.sources.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn lookup_fn(&self) -> SourceLookup {
        let sources = self.sources.clone();
        Arc::new(move |name: &str| sources.get(name).cloned())
    }

    /// Breaker state of every source that has one.
    pub fn health(&self) -> Vec<BreakerSnapshot> {
        self.sources.values().filter_map(|s| s.health()).collect()
    }

    /// Close every source concurrently. All are attempted; the first error
    /// (in name order) is returned.
    pub async fn close_all(&self) -> Result<()> {
        let results = join_all(self.sources.iter().map(|(name, source)| async move {
            let result = source.close().await;
            if let Err(err) = &result {
                tracing::warn!(source = %name, error = %err, "source close failed");
            }
            result
        }))
        .await;
        results.into_iter().collect()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Construct one source from its definition.
pub fn build_source(name: &str, config: &SourceConfig, policy: Resilience) -> Result<Arc<dyn Source>> {
    let source: Arc<dyn Source> = match config.source_type {
        SourceType::Rest => Arc::new(RestSource::new(name, config, policy)?),
        SourceType::Graphql => Arc::new(GraphqlSource::new(name, config, policy)?),
        SourceType::Exec => Arc::new(ExecSource::new(name, config, policy)?),
        SourceType::Sql => Arc::new(SqlSource::new(name, config, policy)?),
    };
    Ok(source)
}
