//! # Document Model
//!
//! Canonical record state as an unordered mapping from field path to text
//! value. Documents are immutable values; mutation is expressed only through
//! diff application.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered sequence of non-empty text segments addressing one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Create a path with validation.
    ///
    /// # Errors
    /// Returns an error if the path has no segments or any segment is empty.
    pub fn new(segments: Vec<String>) -> Result<Self> {
        if segments.is_empty() {
            bail!("field path must have at least one segment");
        }
        if segments.iter().any(|s| s.is_empty()) {
            bail!("field path segments must be non-empty");
        }
        Ok(Self(segments))
    }

    /// Parse a dotted path such as `address.city`.
    pub fn parse(dotted: &str) -> Result<Self> {
        Self::new(dotted.split('.').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// An unordered mapping from field path to text value.
///
/// Two documents are equal when they expose the same path -> value mapping.
/// Missing paths are distinct from empty-string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<FieldPath, String>,
}

impl Document {
    /// The document with no paths.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: impl IntoIterator<Item = (FieldPath, String)>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &FieldPath) -> Option<&str> {
        self.fields.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &FieldPath) -> bool {
        self.fields.contains_key(path)
    }

    /// All paths, in lexicographic order.
    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &str)> {
        self.fields.iter().map(|(p, v)| (p, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn set(&mut self, path: FieldPath, value: String) {
        self.fields.insert(path, value);
    }

    pub(crate) fn remove(&mut self, path: &FieldPath) -> Option<String> {
        self.fields.remove(path)
    }

    /// Parse the self-describing text format: nested JSON objects of
    /// string -> (string | object). Scalar leaves are coerced to text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let object = match value {
            Value::Object(object) => object,
            _ => bail!("document root must be a JSON object"),
        };
        let mut fields = BTreeMap::new();
        flatten_object(object, &mut Vec::new(), &mut fields)?;
        Ok(Self { fields })
    }

    /// Render as nested JSON. Fails if a path is both a leaf and a prefix of
    /// another path; such documents have no tree representation.
    pub fn to_json(&self) -> Result<Value> {
        let mut root = Map::new();
        for (path, value) in &self.fields {
            insert_nested(&mut root, path.segments(), value)?;
        }
        Ok(Value::Object(root))
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json()?)?)
    }
}

fn flatten_object(
    object: &Map<String, Value>,
    prefix: &mut Vec<String>,
    out: &mut BTreeMap<FieldPath, String>,
) -> Result<()> {
    for (key, value) in object {
        if key.is_empty() {
            bail!("document keys must be non-empty");
        }
        prefix.push(key.clone());
        match value {
            Value::Object(nested) => flatten_object(nested, prefix, out)?,
            Value::String(text) => {
                out.insert(FieldPath(prefix.clone()), text.clone());
            }
            Value::Number(n) => {
                out.insert(FieldPath(prefix.clone()), n.to_string());
            }
            Value::Bool(b) => {
                out.insert(FieldPath(prefix.clone()), b.to_string());
            }
            Value::Null | Value::Array(_) => {
                bail!("unsupported value at {}", prefix.join("."));
            }
        }
        prefix.pop();
    }
    Ok(())
}

fn insert_nested(root: &mut Map<String, Value>, segments: &[String], value: &str) -> Result<()> {
    let (head, rest) = segments.split_first().expect("paths are never empty");
    if rest.is_empty() {
        match root.get(head) {
            None => {
                root.insert(head.clone(), Value::String(value.to_string()));
                Ok(())
            }
            Some(_) => bail!("path collision at segment {head}"),
        }
    } else {
        let child = root
            .entry(head.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        match child {
            Value::Object(nested) => insert_nested(nested, rest, value),
            _ => bail!("path collision at segment {head}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(dotted: &str) -> FieldPath {
        FieldPath::parse(dotted).unwrap()
    }

    #[test]
    fn test_empty_document() {
        let doc = Document::empty();
        assert!(doc.is_empty());
        assert_eq!(doc.paths().count(), 0);
    }

    #[test]
    fn test_path_validation() {
        assert!(FieldPath::new(vec![]).is_err());
        assert!(FieldPath::new(vec!["a".into(), "".into()]).is_err());
        assert!(FieldPath::new(vec!["a".into()]).is_ok());
    }

    #[test]
    fn test_flatten_nested_objects() {
        let doc = Document::from_json_str(r#"{"name":"Alice","address":{"city":"Oslo"}}"#).unwrap();
        assert_eq!(doc.get(&path("name")), Some("Alice"));
        assert_eq!(doc.get(&path("address.city")), Some("Oslo"));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_scalars_coerced_to_text() {
        let doc = Document::from_json_str(r#"{"age":42,"active":true}"#).unwrap();
        assert_eq!(doc.get(&path("age")), Some("42"));
        assert_eq!(doc.get(&path("active")), Some("true"));
    }

    #[test]
    fn test_empty_string_distinct_from_missing() {
        let doc = Document::from_json_str(r#"{"note":""}"#).unwrap();
        assert_eq!(doc.get(&path("note")), Some(""));
        assert_eq!(doc.get(&path("missing")), None);
    }

    #[test]
    fn test_equality_is_map_equality() {
        let a = Document::from_json_str(r#"{"a":{"b":"1"},"c":"2"}"#).unwrap();
        let b = Document::from_json_str(r#"{"c":"2","a":{"b":"1"}}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_json_round_trip() {
        let doc = Document::from_json_str(r#"{"a":{"b":"1","c":"2"},"d":"3"}"#).unwrap();
        let back = Document::from_json_str(&doc.to_json_string().unwrap()).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn test_rejects_arrays_and_null() {
        assert!(Document::from_json_str(r#"{"tags":["a"]}"#).is_err());
        assert!(Document::from_json_str(r#"{"gone":null}"#).is_err());
    }

    #[test]
    fn test_leaf_prefix_collision_has_no_tree_form() {
        let doc = Document::from_fields([
            (path("a"), "1".to_string()),
            (path("a.b"), "2".to_string()),
        ]);
        assert!(doc.to_json().is_err());
    }
}
