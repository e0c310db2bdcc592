//! Field paths and in-place edits on JSON documents
//!
//! Both store backends apply field-level operations through these helpers so
//! that path semantics are the same everywhere: segments are object keys,
//! missing parents are created on write, and a non-object parent is an error.

use crate::error::{MantisError, Result};
use serde_json::{Map, Value};

/// Dotted path to a document field, e.g. `data.<user>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new(field: impl Into<String>) -> Self {
        Self(vec![field.into()])
    }

    /// Extend the path by one segment
    ///
    /// The segment is taken verbatim, so user ids containing dots stay a
    /// single key.
    pub fn child(mut self, segment: impl Into<String>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Value at `path`, if present
pub fn get_path<'a>(document: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(document, |current, segment| current.as_object()?.get(segment))
}

fn parent_object<'a>(document: &'a mut Value, path: &FieldPath) -> Result<&'a mut Map<String, Value>> {
    let (_, parents) = path
        .segments()
        .split_last()
        .ok_or_else(|| MantisError::Other("empty field path".to_string()))?;

    let mut current = document;
    for segment in parents {
        let object = current.as_object_mut().ok_or_else(|| {
            MantisError::InvalidDocument(format!("parent of {} is not an object", path))
        })?;
        current = object
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    current
        .as_object_mut()
        .ok_or_else(|| MantisError::InvalidDocument(format!("parent of {} is not an object", path)))
}

fn leaf(path: &FieldPath) -> Result<&String> {
    path.segments()
        .last()
        .ok_or_else(|| MantisError::Other("empty field path".to_string()))
}

/// Set `path` to `value`, creating missing parent objects
pub fn set_path(document: &mut Value, path: &FieldPath, value: Value) -> Result<()> {
    let key = leaf(path)?.clone();
    parent_object(document, path)?.insert(key, value);
    Ok(())
}

/// Append `value` to the array at `path`
pub fn push_path(document: &mut Value, path: &FieldPath, value: Value) -> Result<()> {
    let key = leaf(path)?.clone();
    let slot = parent_object(document, path)?
        .entry(key)
        .or_insert_with(|| Value::Array(Vec::new()));
    match slot {
        Value::Array(items) => {
            items.push(value);
            Ok(())
        }
        _ => Err(MantisError::InvalidDocument(format!("{} is not an array", path))),
    }
}

/// Remove the field at `path`; returns whether it existed
pub fn remove_path(document: &mut Value, path: &FieldPath) -> bool {
    let Some((key, parents)) = path.segments().split_last() else {
        return false;
    };
    let mut current = document;
    for segment in parents {
        match current.as_object_mut().and_then(|o| o.get_mut(segment)) {
            Some(next) => current = next,
            None => return false,
        }
    }
    current
        .as_object_mut()
        .map(|o| o.remove(key).is_some())
        .unwrap_or(false)
}

/// Copy of `document` reduced to `fields` (plus its `id`)
pub fn project(document: &Value, fields: &[FieldPath]) -> Result<Value> {
    let mut partial = Value::Object(Map::new());
    if let Some(id) = document.get("id") {
        set_path(&mut partial, &FieldPath::new("id"), id.clone())?;
    }
    for field in fields {
        if let Some(value) = get_path(document, field) {
            set_path(&mut partial, field, value.clone())?;
        }
    }
    Ok(partial)
}

/// Whether every `(field, value)` pair of the filter matches
pub fn matches(document: &Value, filter: &[(&str, Value)]) -> bool {
    filter
        .iter()
        .all(|(field, expected)| document.get(*field) == Some(expected))
}
