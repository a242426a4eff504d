//! Render diffs.
//!
//! The first render of a target (or a render whose root changes kind) is sent
//! as `{"full": tree}`. Later renders are sent as `{"patch": [op, ...]}`, a
//! subset of RFC 6902 (`add`, `remove`, `replace`) addressed by JSON Pointer.
//! Applying the patch to the previous tree yields the new tree exactly.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

/// Encode `new` relative to the previously sent tree.
pub fn diff(old: Option<&Value>, new: &Value) -> Value {
    match old {
        Some(old) if same_container(old, new) => {
            let mut ops = Vec::new();
            diff_into(old, new, &mut String::new(), &mut ops);
            json!({ "patch": ops })
        }
        _ => json!({ "full": new }),
    }
}

/// Whether an encoded tree carries no changes.
pub fn is_empty_patch(tree: &Value) -> bool {
    tree.get("patch")
        .and_then(Value::as_array)
        .is_some_and(Vec::is_empty)
}

fn same_container(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_))
    )
}

fn push_token(path: &mut String, token: &str) {
    path.push('/');
    for c in token.chars() {
        match c {
            '~' => path.push_str("~0"),
            '/' => path.push_str("~1"),
            other => path.push(other),
        }
    }
}

fn diff_into(old: &Value, new: &Value, path: &mut String, ops: &mut Vec<PatchOp>) {
    let mark = path.len();
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys().filter(|k| !b.contains_key(*k)) {
                push_token(path, key);
                ops.push(PatchOp::Remove { path: path.clone() });
                path.truncate(mark);
            }
            for (key, value) in b {
                push_token(path, key);
                match a.get(key) {
                    Some(prev) => diff_into(prev, value, path, ops),
                    None => ops.push(PatchOp::Add {
                        path: path.clone(),
                        value: value.clone(),
                    }),
                }
                path.truncate(mark);
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                push_token(path, &i.to_string());
                diff_into(&a[i], &b[i], path, ops);
                path.truncate(mark);
            }
            // Remove from the tail so earlier indices stay valid.
            for i in (common..a.len()).rev() {
                push_token(path, &i.to_string());
                ops.push(PatchOp::Remove { path: path.clone() });
                path.truncate(mark);
            }
            for (i, value) in b.iter().enumerate().skip(common) {
                push_token(path, &i.to_string());
                ops.push(PatchOp::Add {
                    path: path.clone(),
                    value: value.clone(),
                });
                path.truncate(mark);
            }
        }
        _ if old != new => ops.push(PatchOp::Replace {
            path: path.clone(),
            value: new.clone(),
        }),
        _ => {}
    }
}

// =============================================================================
// Application
// =============================================================================

/// Apply an encoded tree (`full` or `patch`) to `base`.
pub fn apply_patch(base: &Value, tree: &Value) -> Result<Value> {
    if let Some(full) = tree.get("full") {
        return Ok(full.clone());
    }
    let ops: Vec<PatchOp> = match tree.get("patch") {
        Some(patch) => serde_json::from_value(patch.clone())?,
        None => return Err(Error::validation("tree has neither full nor patch")),
    };
    let mut doc = base.clone();
    for op in &ops {
        apply_op(&mut doc, op)?;
    }
    Ok(doc)
}

fn parse_pointer(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| Error::validation(format!("invalid pointer {path:?}")))?;
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn parse_index(token: &str, len: usize, allow_end: bool) -> Result<usize> {
    let index: usize = token
        .parse()
        .map_err(|_| Error::validation(format!("invalid array index {token:?}")))?;
    let limit = if allow_end { len } else { len.saturating_sub(1) };
    if index > limit || (!allow_end && len == 0) {
        return Err(Error::validation(format!("array index {index} out of range")));
    }
    Ok(index)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<()> {
    let path = match op {
        PatchOp::Add { path, .. } | PatchOp::Remove { path } | PatchOp::Replace { path, .. } => path,
    };
    let mut tokens = parse_pointer(path)?;
    let Some(last) = tokens.pop() else {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *doc = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(Error::validation("cannot remove the root")),
        };
    };

    let mut parent = doc;
    for token in &tokens {
        parent = match parent {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => {
                let index = parse_index(token, items.len(), false)?;
                items.get_mut(index)
            }
            _ => None,
        }
        .ok_or_else(|| Error::validation(format!("pointer {path:?} does not resolve")))?;
    }

    match (parent, op) {
        (Value::Object(map), PatchOp::Add { value, .. } | PatchOp::Replace { value, .. }) => {
            map.insert(last, value.clone());
        }
        (Value::Object(map), PatchOp::Remove { .. }) => {
            map.remove(&last)
                .ok_or_else(|| Error::validation(format!("pointer {path:?} does not resolve")))?;
        }
        (Value::Array(items), PatchOp::Add { value, .. }) => {
            let index = parse_index(&last, items.len(), true)?;
            items.insert(index, value.clone());
        }
        (Value::Array(items), PatchOp::Replace { value, .. }) => {
            let index = parse_index(&last, items.len(), false)?;
            items[index] = value.clone();
        }
        (Value::Array(items), PatchOp::Remove { .. }) => {
            let index = parse_index(&last, items.len(), false)?;
            items.remove(index);
        }
        _ => return Err(Error::validation(format!("pointer {path:?} does not resolve"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_first_render_is_full() {
        let tree = json!({"count": 1});
        assert_eq!(diff(None, &tree), json!({"full": {"count": 1}}));
    }

    #[test]
    fn test_root_kind_change_is_full() {
        assert_eq!(diff(Some(&json!([1])), &json!({"a": 1})), json!({"full": {"a": 1}}));
        assert_eq!(diff(Some(&json!(1)), &json!(2)), json!({"full": 2}));
    }

    #[test]
    fn test_object_patch() {
        let old = json!({"count": 1, "stale": true, "nested": {"a": 1}});
        let new = json!({"count": 2, "nested": {"a": 1, "b/c": "x"}});
        let tree = diff(Some(&old), &new);
        assert_eq!(
            tree,
            json!({"patch": [
                {"op": "remove", "path": "/stale"},
                {"op": "replace", "path": "/count", "value": 2},
                {"op": "add", "path": "/nested/b~1c", "value": "x"}
            ]})
        );
        assert_eq!(apply_patch(&old, &tree).unwrap(), new);
    }

    #[test]
    fn test_array_shrink_and_grow() {
        let old = json!({"rows": [{"id": 1}, {"id": 2}, {"id": 3}]});
        let shrunk = json!({"rows": [{"id": 1}]});
        let tree = diff(Some(&old), &shrunk);
        assert_eq!(
            tree["patch"],
            json!([
                {"op": "remove", "path": "/rows/2"},
                {"op": "remove", "path": "/rows/1"}
            ])
        );
        assert_eq!(apply_patch(&old, &tree).unwrap(), shrunk);

        let grown = json!({"rows": [{"id": 1}, {"id": 9}, {"id": 10}]});
        assert_eq!(apply_patch(&shrunk, &diff(Some(&shrunk), &grown)).unwrap(), grown);
    }

    #[test]
    fn test_unchanged_is_empty_patch() {
        let tree = json!({"count": 1});
        let encoded = diff(Some(&tree), &tree);
        assert!(is_empty_patch(&encoded));
        assert!(!is_empty_patch(&diff(None, &tree)));
    }

    #[test]
    fn test_apply_rejects_bad_pointer() {
        let tree = json!({"patch": [{"op": "remove", "path": "/missing/x"}]});
        assert!(apply_patch(&json!({}), &tree).is_err());
        assert!(apply_patch(&json!({}), &json!({"other": 1})).is_err());
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z~/]{0,4}".prop_map(Value::from),
        ];
        leaf.prop_recursive(4, 32, 5, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..5).prop_map(Value::from),
                prop::collection::btree_map("[a-c~/]{0,3}", inner, 0..5)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_patch_converges(old in arb_json(), new in arb_json()) {
            let tree = diff(Some(&old), &new);
            prop_assert_eq!(apply_patch(&old, &tree).unwrap(), new);
        }
    }
}
