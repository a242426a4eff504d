//! Environment-variable expansion for configuration strings.

use regex::{Captures, Regex};
use std::sync::OnceLock;

static ENV_REF: OnceLock<Regex> = OnceLock::new();

#[allow(clippy::expect_used)]
fn env_ref() -> &'static Regex {
    ENV_REF.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("valid env reference regex")
    })
}

/// Replace `${NAME}` and `$NAME` with the variable's value. Unset variables
/// expand to the empty string.
pub fn expand_env(text: &str) -> String {
    expand_with(text, |name| std::env::var(name).ok())
}

/// Expansion against an arbitrary lookup.
pub fn expand_with<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if !text.contains('$') {
        return text.to_string();
    }
    env_ref()
        .replace_all(text, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_default()
        })
        .into_owned()
}
