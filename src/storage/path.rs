//! Dotted-path access into JSON values
//!
//! Paths are `.`-separated object keys (`attempts.<id>.st`). Array indexing
//! is not supported; transaction metadata only nests objects.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("path already exists: {0}")]
    Exists(String),
    #[error("invalid path: {0}")]
    Invalid(String),
}

fn segments(path: &str) -> Result<Vec<&str>, PathError> {
    let parts: Vec<&str> = path.split('.').collect();
    if path.is_empty() || parts.iter().any(|p| p.is_empty()) {
        return Err(PathError::Invalid(path.to_string()));
    }
    Ok(parts)
}

/// Look up `path` in `root`
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let parts = segments(path).ok()?;
    let mut current = root;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Walk to the parent object of `path`, optionally creating missing parents
fn parent_mut<'a>(
    root: &'a mut Value,
    path: &str,
    create_parents: bool,
) -> Result<(&'a mut Map<String, Value>, String), PathError> {
    let parts = segments(path)?;
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| PathError::Invalid(path.to_string()))?;

    if !root.is_object() {
        return Err(PathError::Invalid(path.to_string()));
    }
    let mut current = root;
    for part in parents {
        let map = current
            .as_object_mut()
            .ok_or_else(|| PathError::NotFound(path.to_string()))?;
        if !map.contains_key(*part) {
            if !create_parents {
                return Err(PathError::NotFound(path.to_string()));
            }
            map.insert((*part).to_string(), Value::Object(Map::new()));
        }
        current = map
            .get_mut(*part)
            .ok_or_else(|| PathError::NotFound(path.to_string()))?;
    }
    let map = current
        .as_object_mut()
        .ok_or_else(|| PathError::NotFound(path.to_string()))?;
    Ok((map, (*last).to_string()))
}

/// Create `path`, failing if it already exists
pub fn insert_path(
    root: &mut Value,
    path: &str,
    value: Value,
    create_parents: bool,
) -> Result<(), PathError> {
    let (map, last) = parent_mut(root, path, create_parents)?;
    if map.contains_key(&last) {
        return Err(PathError::Exists(path.to_string()));
    }
    map.insert(last, value);
    Ok(())
}

/// Create or overwrite `path`
pub fn upsert_path(
    root: &mut Value,
    path: &str,
    value: Value,
    create_parents: bool,
) -> Result<(), PathError> {
    let (map, last) = parent_mut(root, path, create_parents)?;
    map.insert(last, value);
    Ok(())
}

/// Overwrite an existing `path`
pub fn replace_path(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let (map, last) = parent_mut(root, path, false)?;
    match map.get_mut(&last) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(PathError::NotFound(path.to_string())),
    }
}

/// Remove an existing `path`, returning its value
pub fn remove_path(root: &mut Value, path: &str) -> Result<Value, PathError> {
    let (map, last) = parent_mut(root, path, false)?;
    map.remove(&last)
        .ok_or_else(|| PathError::NotFound(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested() {
        let doc = json!({"attempts": {"a1": {"st": "STAGED"}}});
        assert_eq!(get_path(&doc, "attempts.a1.st"), Some(&json!("STAGED")));
        assert_eq!(get_path(&doc, "attempts.a2"), None);
        assert_eq!(get_path(&doc, ""), None);
    }

    #[test]
    fn test_insert_creates_parents_only_when_asked() {
        let mut doc = json!({});
        assert_eq!(
            insert_path(&mut doc, "a.b", json!(1), false),
            Err(PathError::NotFound("a.b".into()))
        );
        insert_path(&mut doc, "a.b", json!(1), true).unwrap();
        assert_eq!(doc, json!({"a": {"b": 1}}));
        assert_eq!(
            insert_path(&mut doc, "a.b", json!(2), true),
            Err(PathError::Exists("a.b".into()))
        );
    }

    #[test]
    fn test_replace_and_remove_require_existing_path() {
        let mut doc = json!({"a": {"b": 1}});
        replace_path(&mut doc, "a.b", json!(2)).unwrap();
        assert_eq!(doc, json!({"a": {"b": 2}}));
        assert!(replace_path(&mut doc, "a.c", json!(3)).is_err());

        assert_eq!(remove_path(&mut doc, "a.b").unwrap(), json!(2));
        assert_eq!(
            remove_path(&mut doc, "a.b"),
            Err(PathError::NotFound("a.b".into()))
        );
    }

    #[test]
    fn test_invalid_paths() {
        let mut doc = json!({});
        assert!(matches!(
            upsert_path(&mut doc, "a..b", json!(1), true),
            Err(PathError::Invalid(_))
        ));
        let mut scalar = json!(5);
        assert!(upsert_path(&mut scalar, "a", json!(1), true).is_err());
    }
}
