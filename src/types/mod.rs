//! Core types for the livedoc runtime.
//!
//! - **IDs**: Strongly-typed identifiers (SessionId)
//! - **Errors**: Error taxonomy with thiserror derives
//! - **Config**: Runtime, session, resilience, source and action configuration

mod config;
mod errors;
mod ids;

pub use config::{
    ActionConfig, CircuitBreakerConfig, Config, ParamDef, RetryConfig, RuntimeConfig,
    SessionConfig, SourceConfig, SourceType, ENV_ALLOW_EXEC, ENV_OPERATOR,
};
pub use errors::{Error, ErrorKind, Result};
pub use ids::SessionId;
