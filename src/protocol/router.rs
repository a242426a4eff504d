//! Routes inbound envelopes to the page or a block and renders the result.

use serde_json::Value;
use std::collections::HashMap;

use super::diff::diff;
use super::envelope::{MessageEnvelope, ResponseEnvelope, PAGE_BLOCK_ID};
use crate::context::Context;
use crate::state::PageState;
use crate::types::{Error, Result};

/// Owns one session's [`PageState`] and the last tree sent per target.
///
/// `route` takes `&mut self`: one envelope is handled at a time, in the order
/// the caller delivers them.
#[derive(Debug)]
pub struct MessageRouter {
    state: PageState,
    rendered: HashMap<String, Value>,
}

impl MessageRouter {
    pub fn new(state: PageState) -> Self {
        Self {
            state,
            rendered: HashMap::new(),
        }
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut PageState {
        &mut self.state
    }

    /// Dispatch one envelope.
    ///
    /// Handler failures come back as `Ok` with `meta.success = false`. Only an
    /// unknown `blockID` is returned as `Err`, and it changes nothing.
    pub async fn route(&mut self, ctx: &Context, envelope: &MessageEnvelope) -> Result<ResponseEnvelope> {
        let target = envelope.block_id.as_str();
        let outcome = if target == PAGE_BLOCK_ID {
            self.state
                .handle_action(&envelope.action, &envelope.data)
                .map(|()| None)
        } else {
            let block = self
                .state
                .block_mut(target)
                .ok_or_else(|| Error::UnknownBlock(target.to_string()))?;
            block.handle_action(ctx, &envelope.action, &envelope.data).await
        };

        match outcome {
            Ok(result) => {
                let tree = self.render_target(target)?;
                let response = ResponseEnvelope::success(target, tree);
                Ok(match result {
                    Some(result) => response.with_meta("result", result),
                    None => response,
                })
            }
            Err(err) => {
                tracing::debug!(block = target, action = %envelope.action, error = %err, "action failed");
                // A failed action may still have changed what the block shows.
                let tree = self.render_target(target)?;
                Ok(ResponseEnvelope {
                    tree,
                    ..ResponseEnvelope::failure(target, &err)
                })
            }
        }
    }

    /// Full renders of the page and every block, resetting diff baselines.
    pub fn snapshot(&mut self) -> Vec<ResponseEnvelope> {
        self.rendered.clear();
        let targets: Vec<String> = std::iter::once(PAGE_BLOCK_ID.to_string())
            .chain(self.state.block_ids().map(String::from))
            .collect();
        targets
            .into_iter()
            .filter_map(|target| {
                let tree = self.render_full(&target)?;
                Some(ResponseEnvelope::success(target, tree))
            })
            .collect()
    }

    fn current_tree(&self, target: &str) -> Option<Value> {
        if target == PAGE_BLOCK_ID {
            Some(self.state.render())
        } else {
            self.state.block(target).map(|b| b.render())
        }
    }

    fn render_full(&mut self, target: &str) -> Option<Value> {
        let tree = self.current_tree(target)?;
        let encoded = diff(None, &tree);
        self.rendered.insert(target.to_string(), tree);
        Some(encoded)
    }

    fn render_target(&mut self, target: &str) -> Result<Value> {
        let tree = self
            .current_tree(target)
            .ok_or_else(|| Error::UnknownBlock(target.to_string()))?;
        let encoded = diff(self.rendered.get(target), &tree);
        self.rendered.insert(target.to_string(), tree);
        Ok(encoded)
    }
}
