//! Process-wide assembly: sources, executor and block factory built once from
//! configuration and shared by every session.

use std::sync::Arc;

use crate::actions::{load_actions, ActionExecutor, ExecutorSettings};
use crate::session::Session;
use crate::source::SourceRegistry;
use crate::state::{BlockFactory, Page, PageState};
use crate::types::{Config, Result, SessionConfig};

#[derive(Debug, Clone)]
pub struct Runtime {
    registry: SourceRegistry,
    executor: Arc<ActionExecutor>,
    factory: BlockFactory,
    session: SessionConfig,
}

impl Runtime {
    /// Validate `config` and build every source and action. Any bad
    /// definition fails here, before a session starts.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let registry = SourceRegistry::from_config(config)?;
        let executor = Arc::new(
            ActionExecutor::new(ExecutorSettings::from_runtime(&config.runtime))
                .with_registry(registry.lookup_fn()),
        );
        let factory = BlockFactory::new(
            registry.clone(),
            Arc::clone(&executor),
            load_actions(&config.actions)?,
        );
        tracing::info!(
            sources = registry.len(),
            actions = config.actions.len(),
            allow_exec = config.runtime.allow_exec,
            "runtime ready"
        );
        Ok(Self {
            registry,
            executor,
            factory,
            session: config.session.clone(),
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    /// Fresh state for one client of `page`.
    pub fn page_state(&self, page: &Page) -> Result<PageState> {
        PageState::from_page(page, &self.factory)
    }

    pub fn session(&self, page: &Page) -> Result<Session> {
        Ok(Session::new(self.page_state(page)?, self.session.clone()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.registry.close_all().await
    }
}
