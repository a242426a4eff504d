//! `{{ }}` templates for configuration values.
//!
//! Used for action parameter defaults (`{{today}}`, `{{.operator}}`), exec
//! command lines and HTTP action targets. Text without `{{` is never parsed.

pub mod eval;
pub mod lexer;

use chrono::{DateTime, Local};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::source::Record;
use crate::types::{Error, Result};
use eval::{eval_pipeline, parse, Pipeline, Scope};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Whether `text` contains template markers.
pub fn has_markers(text: &str) -> bool {
    text.contains(OPEN)
}

// =============================================================================
// Template
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Action(Pipeline),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let fail = |reason: String| Error::template(text, reason);
        let mut segments = Vec::new();
        let mut rest = text;
        let mut trim_next = false;

        while let Some(start) = rest.find(OPEN) {
            let mut literal = &rest[..start];
            if trim_next {
                literal = literal.trim_start();
            }
            let after_open = &rest[start + OPEN.len()..];
            let end = after_open
                .find(CLOSE)
                .ok_or_else(|| fail("unclosed action".to_string()))?;
            let mut body = &after_open[..end];

            if let Some(stripped) = trim_marker_left(body) {
                literal = literal.trim_end();
                body = stripped;
            }
            trim_next = false;
            if let Some(stripped) = trim_marker_right(body) {
                trim_next = true;
                body = stripped;
            }

            if !literal.is_empty() {
                segments.push(Segment::Text(literal.to_string()));
            }
            let body = body.trim();
            if !(body.starts_with("/*") && body.ends_with("*/")) {
                let tokens = lexer::tokenize(body).map_err(&fail)?;
                segments.push(Segment::Action(parse(tokens).map_err(&fail)?));
            }
            rest = &after_open[end + CLOSE.len()..];
        }

        let tail = if trim_next { rest.trim_start() } else { rest };
        if !tail.is_empty() {
            segments.push(Segment::Text(tail.to_string()));
        }

        Ok(Self {
            source: text.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, data: &Value, now: DateTime<Local>) -> Result<String> {
        let scope = Scope { data, now };
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Action(pipeline) => {
                    let value = eval_pipeline(pipeline, &scope)
                        .map_err(|reason| Error::template(&self.source, reason))?;
                    out.push_str(&value.render());
                }
            }
        }
        Ok(out)
    }
}

fn trim_marker_left(body: &str) -> Option<&str> {
    let stripped = body.strip_prefix('-')?;
    stripped.starts_with(char::is_whitespace).then_some(stripped)
}

fn trim_marker_right(body: &str) -> Option<&str> {
    let stripped = body.strip_suffix('-')?;
    stripped.ends_with(char::is_whitespace).then_some(stripped)
}

/// Render `text` against an arbitrary record. Missing fields render empty.
pub fn expand_template(text: &str, data: &Record) -> Result<String> {
    if !has_markers(text) {
        return Ok(text.to_string());
    }
    Template::parse(text)?.render(&Value::Object(data.clone()), Local::now())
}

// =============================================================================
// Default resolver
// =============================================================================

pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Expands templated defaults against `{operator}` and the fixed function set.
#[derive(Clone)]
pub struct DefaultResolver {
    operator: String,
    clock: Clock,
}

impl DefaultResolver {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            clock: Arc::new(Local::now),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    fn context(&self) -> Value {
        serde_json::json!({ "operator": self.operator })
    }

    /// Expand one string. Text without markers is returned as-is.
    pub fn resolve(&self, text: &str) -> Result<Value> {
        if !has_markers(text) {
            return Ok(Value::String(text.to_string()));
        }
        let rendered = Template::parse(text)?.render(&self.context(), (self.clock)())?;
        Ok(Value::String(rendered))
    }

    /// Expand every string value of `data`; other values pass through.
    pub fn resolve_map(&self, data: &Record) -> Result<Record> {
        data.iter()
            .map(|(key, value)| {
                let resolved = match value {
                    Value::String(text) => self.resolve(text)?,
                    other => other.clone(),
                };
                Ok((key.clone(), resolved))
            })
            .collect()
    }

    /// Render `text` against `data`, with `.operator` available unless the
    /// record defines its own.
    pub fn expand(&self, text: &str, data: &Record) -> Result<String> {
        if !has_markers(text) {
            return Ok(text.to_string());
        }
        let mut scope = data.clone();
        scope
            .entry("operator")
            .or_insert_with(|| Value::String(self.operator.clone()));
        Template::parse(text)?.render(&Value::Object(scope), (self.clock)())
    }
}

impl fmt::Debug for DefaultResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultResolver")
            .field("operator", &self.operator)
            .finish_non_exhaustive()
    }
}
