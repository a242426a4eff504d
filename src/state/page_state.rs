//! Per-session page state: navigation, code edits and block states.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::block::{BlockFactory, BlockState};
use super::page::{Page, PageConfig};
use crate::context::Context;
use crate::types::{Error, Result};

#[derive(Debug, Deserialize)]
struct CodeEdit {
    #[serde(rename = "blockID")]
    block_id: String,
    code: String,
}

/// Authoritative state for one client session.
///
/// Owned by a single session worker; actions are applied one at a time, so
/// nothing in here is synchronized.
#[derive(Debug, Default)]
pub struct PageState {
    config: PageConfig,
    current_step: usize,
    completed_steps: Vec<usize>,
    code_edits: BTreeMap<String, String>,
    blocks: BTreeMap<String, Box<dyn BlockState>>,
}

impl PageState {
    pub fn new(config: PageConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Build state for `page`, creating every block state up front.
    pub fn from_page(page: &Page, factory: &BlockFactory) -> Result<Self> {
        let mut state = Self::new(page.config);
        for block in page.interactive_blocks() {
            if let Some(block_state) = factory.build(block)? {
                state.blocks.insert(block.id.clone(), block_state);
            }
        }
        Ok(state)
    }

    pub fn with_block(mut self, id: impl Into<String>, block: Box<dyn BlockState>) -> Self {
        self.blocks.insert(id.into(), block);
        self
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Completed steps in completion order.
    pub fn completed_steps(&self) -> &[usize] {
        &self.completed_steps
    }

    pub fn code_edit(&self, block_id: &str) -> Option<&str> {
        self.code_edits.get(block_id).map(String::as_str)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(String::as_str)
    }

    pub fn has_block(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn block(&self, id: &str) -> Option<&dyn BlockState> {
        self.blocks.get(id).map(|b| &**b)
    }

    pub fn block_mut(&mut self, id: &str) -> Option<&mut Box<dyn BlockState>> {
        self.blocks.get_mut(id)
    }

    /// Let every block load its initial data.
    pub async fn init_blocks(&mut self, ctx: &Context) {
        for block in self.blocks.values_mut() {
            block.init(ctx).await;
        }
    }

    /// Apply a page-level action.
    pub fn handle_action(&mut self, name: &str, data: &Value) -> Result<()> {
        match name {
            "nextStep" => self.next_step(),
            "prevStep" => self.prev_step(),
            "saveCodeEdit" => {
                let edit: CodeEdit = serde_json::from_value(data.clone()).map_err(|e| {
                    Error::validation(format!("saveCodeEdit requires blockID and code: {e}"))
                })?;
                if edit.block_id.is_empty() {
                    return Err(Error::validation("saveCodeEdit requires blockID and code"));
                }
                self.code_edits.insert(edit.block_id, edit.code);
            }
            other => return Err(Error::validation(format!("unknown page action: {other}"))),
        }
        Ok(())
    }

    fn next_step(&mut self) {
        if !self.config.multi_step || self.current_step + 1 >= self.config.step_count {
            return;
        }
        if !self.completed_steps.contains(&self.current_step) {
            self.completed_steps.push(self.current_step);
        }
        self.current_step += 1;
    }

    fn prev_step(&mut self) {
        self.current_step = self.current_step.saturating_sub(1);
    }

    pub fn render(&self) -> Value {
        json!({
            "currentStep": self.current_step,
            "stepCount": self.config.step_count,
            "multiStep": self.config.multi_step,
            "completedSteps": self.completed_steps,
            "codeEdits": self.code_edits,
        })
    }
}
