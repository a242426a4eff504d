//! # Livedoc Core - Stateful Runtime for Live Documentation Pages
//!
//! Server side of pages that embed live blocks (counters, forms, tables fed
//! by APIs or databases):
//! - Per-session page and block state machines
//! - Envelope routing with render diffs back to the client
//! - Pluggable data sources (REST, GraphQL, shell command, SQLite)
//! - Retry with exponential backoff and per-source circuit breakers
//! - Configuration-declared actions (SQL statements, shell commands, HTTP calls)
//!
//! ## Architecture
//!
//! Each client session owns its state; only the source registry and its
//! circuit breakers are shared across sessions:
//! ```text
//!                  ┌──────────────── Session (one per client) ───────────────┐
//!   inbound  ───►  │  MessageRouter ──► PageState ──► BlockState ─┐          │  ───► outbound
//!                  └──────────────────────────────────────────────┼──────────┘
//!                                                                 ▼
//!                  ┌──────────── shared, built once from Config ──────────────┐
//!                  │  ActionExecutor ──► SourceRegistry ──► Source            │
//!                  │                                        └─ breaker(retry) │
//!                  └──────────────────────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod actions;
pub mod context;
pub mod protocol;
pub mod resilience;
pub mod runtime;
pub mod session;
pub mod source;
pub mod state;
pub mod template;
pub mod types;

// Internal utilities
pub mod observability;

pub use context::Context;
pub use runtime::Runtime;
pub use types::{Config, Error, Result};
