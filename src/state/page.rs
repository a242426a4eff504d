//! Parsed page handed to the runtime by the page loader.
//!
//! The runtime never mutates a [`Page`]; it only reads block descriptors to
//! build per-session state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role a block plays on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockRole {
    ServerState,
    Interactive,
    ClientModule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub id: String,
    pub role: BlockRole,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub source: String,
    /// Fence attributes, e.g. `kind=source source=tasks actions=done,delete`.
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl BlockDescriptor {
    pub fn new(id: impl Into<String>, role: BlockRole) -> Self {
        Self {
            id: id.into(),
            role,
            language: String::new(),
            source: String::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Navigation settings from the page front matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageConfig {
    #[serde(default)]
    pub multi_step: bool,
    #[serde(default)]
    pub step_count: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Page {
    pub title: String,
    #[serde(default)]
    pub static_html: String,
    #[serde(default)]
    pub blocks: Vec<BlockDescriptor>,
    #[serde(default)]
    pub config: PageConfig,
}

impl Page {
    pub fn block(&self, id: &str) -> Option<&BlockDescriptor> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Blocks that get server-side state.
    pub fn interactive_blocks(&self) -> impl Iterator<Item = &BlockDescriptor> {
        self.blocks
            .iter()
            .filter(|b| matches!(b.role, BlockRole::Interactive | BlockRole::ServerState))
    }
}
