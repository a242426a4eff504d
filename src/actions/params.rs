//! Parameter defaults, validation and statement substitution.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::source::Record;
use crate::types::{Error, ParamDef, Result};

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

#[allow(clippy::expect_used)]
fn placeholder() -> &'static Regex {
    // A quoted literal (with '' escapes) matches without a name and is kept verbatim.
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"'(?:[^']|'')*'|:([A-Za-z0-9_]+)").expect("valid placeholder regex")
    })
}

/// Insert declared defaults for parameters the client omitted.
pub fn fill_defaults(params: &BTreeMap<String, ParamDef>, data: &mut Record) {
    for (name, def) in params {
        if data.contains_key(name) {
            continue;
        }
        if let Some(default) = &def.default {
            data.insert(name.clone(), default.clone());
        }
    }
}

/// Every required parameter must be present, non-null and, if textual,
/// non-empty. Undeclared parameters pass through unchecked.
pub fn validate_params(params: &BTreeMap<String, ParamDef>, data: &Record) -> Result<()> {
    for (name, def) in params {
        if !def.required {
            continue;
        }
        let missing = match data.get(name) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing {
            return Err(Error::MissingParameter(name.clone()));
        }
    }
    Ok(())
}

/// Replace each `:name` with `?` and collect values in occurrence order.
/// Absent keys bind null. `::` casts and single-quoted literals are left
/// alone.
pub fn substitute_params(statement: &str, data: &Record) -> (String, Vec<Value>) {
    let mut out = String::with_capacity(statement.len());
    let mut args = Vec::new();
    let mut last = 0;

    for caps in placeholder().captures_iter(statement) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > 0 && statement.as_bytes()[whole.start() - 1] == b':' {
            continue;
        }
        out.push_str(&statement[last..whole.start()]);
        out.push('?');
        args.push(data.get(name.as_str()).cloned().unwrap_or(Value::Null));
        last = whole.end();
    }
    out.push_str(&statement[last..]);
    (out, args)
}

/// POSIX single-quote a value for interpolation into `sh -c`.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Textual form used for command substitution.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
