//! Per-block state machines.
//!
//! A block owns its domain state and interprets its own action names; the
//! router only forwards `(name, data)` and renders the result.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::page::{BlockDescriptor, BlockRole};
use crate::actions::{Action, ActionExecutor};
use crate::context::Context;
use crate::source::{Record, Source, SourceRegistry};
use crate::types::{Error, Result};

/// Server-side state of one interactive block.
#[async_trait]
pub trait BlockState: Send + fmt::Debug {
    /// Load initial state. Failures are kept in the block's render, not raised.
    async fn init(&mut self, _ctx: &Context) {}

    /// Apply one action. `Ok(Some(v))` is reported to the client as `meta.result`.
    async fn handle_action(&mut self, ctx: &Context, name: &str, data: &Value) -> Result<Option<Value>>;

    /// Current structural representation, diffed by the router.
    fn render(&self) -> Value;
}

fn unknown_action(block_id: &str, name: &str) -> Error {
    Error::validation(format!("block {block_id:?}: unknown action {name:?}"))
}

/// Client payloads for block actions must be objects (or absent).
fn action_record(data: &Value) -> Result<Record> {
    match data {
        Value::Null => Ok(Record::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(Error::validation(format!(
            "action data must be an object, got {}",
            crate::source::json::type_name(other)
        ))),
    }
}

// =============================================================================
// Counter
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterBlock {
    id: String,
    initial: i64,
    count: i64,
}

impl CounterBlock {
    pub fn new(id: impl Into<String>, initial: i64) -> Self {
        Self {
            id: id.into(),
            initial,
            count: initial,
        }
    }

    pub fn count(&self) -> i64 {
        self.count
    }
}

#[async_trait]
impl BlockState for CounterBlock {
    async fn handle_action(&mut self, _ctx: &Context, name: &str, _data: &Value) -> Result<Option<Value>> {
        match name {
            "increment" => self.count = self.count.saturating_add(1),
            "decrement" => self.count = self.count.saturating_sub(1),
            "reset" => self.count = self.initial,
            other => return Err(unknown_action(&self.id, other)),
        }
        Ok(None)
    }

    fn render(&self) -> Value {
        json!({ "count": self.count })
    }
}

// =============================================================================
// Source-backed table
// =============================================================================

pub struct SourceBlock {
    id: String,
    source: Arc<dyn Source>,
    executor: Arc<ActionExecutor>,
    actions: BTreeMap<String, Action>,
    rows: Vec<Record>,
    error: Option<String>,
}

impl SourceBlock {
    pub fn new(
        id: impl Into<String>,
        source: Arc<dyn Source>,
        executor: Arc<ActionExecutor>,
        actions: BTreeMap<String, Action>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            executor,
            actions,
            rows: Vec::new(),
            error: None,
        }
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    async fn refresh(&mut self, ctx: &Context) -> Result<()> {
        match self.source.fetch(ctx).await {
            Ok(rows) => {
                self.rows = rows;
                self.error = None;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(block = %self.id, source = self.source.name(), error = %err, "source fetch failed");
                self.error = Some(err.to_string());
                Err(err)
            }
        }
    }
}

#[async_trait]
impl BlockState for SourceBlock {
    async fn init(&mut self, ctx: &Context) {
        let _ = self.refresh(ctx).await;
    }

    async fn handle_action(&mut self, ctx: &Context, name: &str, data: &Value) -> Result<Option<Value>> {
        if name == "refresh" {
            self.refresh(ctx).await?;
            return Ok(None);
        }

        let action = self
            .actions
            .get(name)
            .ok_or_else(|| unknown_action(&self.id, name))?;
        let outcome = self
            .executor
            .execute(ctx, action, action_record(data)?)
            .await?;
        // The side effect already happened; a failed reload shows up in the render.
        let _ = self.refresh(ctx).await;
        Ok(Some(serde_json::to_value(outcome)?))
    }

    fn render(&self) -> Value {
        let mut tree = json!({
            "source": self.source.name(),
            "rows": self.rows,
        });
        if let (Some(error), Value::Object(map)) = (&self.error, &mut tree) {
            map.insert("error".to_string(), Value::String(error.clone()));
        }
        tree
    }
}

impl fmt::Debug for SourceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceBlock")
            .field("id", &self.id)
            .field("source", &self.source.name())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("rows", &self.rows.len())
            .field("error", &self.error)
            .finish()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Builds block states from descriptors using the process-wide registry and
/// executor.
#[derive(Debug, Clone)]
pub struct BlockFactory {
    registry: SourceRegistry,
    executor: Arc<ActionExecutor>,
    actions: Arc<BTreeMap<String, Action>>,
}

impl BlockFactory {
    pub fn new(
        registry: SourceRegistry,
        executor: Arc<ActionExecutor>,
        actions: BTreeMap<String, Action>,
    ) -> Self {
        Self {
            registry,
            executor,
            actions: Arc::new(actions),
        }
    }

    /// Factory that only knows stateless kinds (counters).
    pub fn empty() -> Self {
        Self::new(
            SourceRegistry::new(),
            Arc::new(ActionExecutor::new(Default::default())),
            BTreeMap::new(),
        )
    }

    /// `Ok(None)` for blocks without server state.
    pub fn build(&self, block: &BlockDescriptor) -> Result<Option<Box<dyn BlockState>>> {
        if block.role == BlockRole::ClientModule {
            return Ok(None);
        }
        let Some(kind) = block.attr("kind") else {
            return Ok(None);
        };

        match kind {
            "counter" => {
                let initial = match block.attr("start") {
                    Some(start) => start.parse().map_err(|_| {
                        Error::config(format!("block {:?}: invalid start {start:?}", block.id))
                    })?,
                    None => 0,
                };
                Ok(Some(Box::new(CounterBlock::new(&block.id, initial))))
            }
            "source" => {
                let name = block.attr("source").ok_or_else(|| {
                    Error::config(format!("block {:?}: source blocks require source", block.id))
                })?;
                let source = self
                    .registry
                    .get(name)
                    .ok_or_else(|| Error::SourceNotFound(name.to_string()))?;
                let actions = self.block_actions(block)?;
                Ok(Some(Box::new(SourceBlock::new(
                    &block.id,
                    source,
                    Arc::clone(&self.executor),
                    actions,
                ))))
            }
            other => Err(Error::config(format!(
                "block {:?}: unknown block kind {other:?}",
                block.id
            ))),
        }
    }

    fn block_actions(&self, block: &BlockDescriptor) -> Result<BTreeMap<String, Action>> {
        let Some(list) = block.attr("actions") else {
            return Ok(BTreeMap::new());
        };
        list.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                let action = self.actions.get(name).ok_or_else(|| {
                    Error::config(format!("block {:?}: action {name:?} not configured", block.id))
                })?;
                Ok((name.to_string(), action.clone()))
            })
            .collect()
    }
}
