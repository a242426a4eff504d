//! Shaping JSON payloads into record sets.

use serde_json::Value;
use thiserror::Error;

use super::Record;

/// Why a payload could not be turned into records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("result path is required")]
    EmptyPath,

    #[error("path '{path}' not found at '{segment}'")]
    PathNotFound { path: String, segment: String },

    #[error("path '{path}' cannot traverse non-object at '{segment}'")]
    NotAnObject { path: String, segment: String },

    #[error("path '{path}' does not resolve to an array")]
    NotAnArray { path: String },

    #[error("expected array of objects, but element {index} is {found}")]
    ElementNotObject { index: usize, found: &'static str },

    #[error("expected array or object, got {found}")]
    UnexpectedRoot { found: &'static str },

    #[error("invalid JSON output: {0}")]
    InvalidJson(String),
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Follow a dot-separated path through nested objects.
pub fn navigate<'a>(root: &'a Value, path: &str) -> Result<&'a Value, ShapeError> {
    if path.is_empty() {
        return Ok(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment).ok_or_else(|| ShapeError::PathNotFound {
                path: path.to_string(),
                segment: segment.to_string(),
            })?,
            _ => {
                return Err(ShapeError::NotAnObject {
                    path: path.to_string(),
                    segment: segment.to_string(),
                })
            }
        };
    }
    Ok(current)
}

/// Path extraction: the value at `path` must be an array. Elements that are
/// not objects are skipped.
pub fn extract_path(root: &Value, path: &str) -> Result<Vec<Record>, ShapeError> {
    if path.is_empty() {
        return Err(ShapeError::EmptyPath);
    }
    match navigate(root, path)? {
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect()),
        _ => Err(ShapeError::NotAnArray {
            path: path.to_string(),
        }),
    }
}

/// Array of objects as-is; a single object becomes a one-element set.
pub fn to_records(value: Value) -> Result<Vec<Record>, ShapeError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(map) => Ok(map),
                other => Err(ShapeError::ElementNotObject {
                    index,
                    found: type_name(&other),
                }),
            })
            .collect(),
        Value::Object(map) => Ok(vec![map]),
        other => Err(ShapeError::UnexpectedRoot {
            found: type_name(&other),
        }),
    }
}

/// Parse command output: a JSON array, a single object, or
/// newline-delimited objects. Blank output is an empty set.
pub fn parse_command_output(stdout: &str) -> Result<Vec<Record>, ShapeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let values = serde_json::Deserializer::from_str(trimmed)
        .into_iter::<Value>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ShapeError::InvalidJson(e.to_string()))?;

    match values.len() {
        1 => values
            .into_iter()
            .next()
            .map(to_records)
            .unwrap_or_else(|| Ok(Vec::new())),
        _ => values
            .into_iter()
            .enumerate()
            .map(|(index, value)| match value {
                Value::Object(map) => Ok(map),
                other => Err(ShapeError::ElementNotObject {
                    index,
                    found: type_name(&other),
                }),
            })
            .collect(),
    }
}
