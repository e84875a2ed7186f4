//! Execution context.
//!
//! `Context` is the attribute mapping threaded through a run. Step results
//! merge into it with last-writer-wins semantics; parallel groups hand each
//! substep the same pre-group snapshot. The whole context round-trips
//! through JSON for checkpointing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The evolving attribute mapping of a workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for initial contexts.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Merge a result object into the context, last writer wins.
    ///
    /// Returns the touched key names in deterministic (sorted) order; the
    /// runtime records them as the step's `added_keys`.
    pub fn merge(&mut self, fields: Map<String, Value>) -> Vec<String> {
        let mut touched: Vec<String> = fields.keys().cloned().collect();
        touched.sort();
        for (key, value) in fields {
            self.values.insert(key, value);
        }
        touched
    }

    /// A by-value snapshot; substeps of a parallel group all read the same
    /// one.
    pub fn snapshot(&self) -> Context {
        self.clone()
    }

    /// Keys present here but absent from `earlier`, sorted.
    pub fn added_since(&self, earlier: &Context) -> Vec<String> {
        let mut added: Vec<String> = self
            .values
            .keys()
            .filter(|k| !earlier.values.contains_key(*k))
            .cloned()
            .collect();
        added.sort();
        added
    }

    /// Entries that are new or whose value differs from `earlier`.
    ///
    /// Used to fold a nested run's result back into its parent: untouched
    /// parent keys merge as no-ops, overwrites and additions carry through.
    pub fn changes_since(&self, earlier: &Context) -> Map<String, Value> {
        let mut changed = Map::new();
        for (key, value) in &self.values {
            if earlier.values.get(key) != Some(value) {
                changed.insert(key.clone(), value.clone());
            }
        }
        changed
    }

    /// Serialize to a JSON object for checkpointing.
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }

    /// Restore from a JSON checkpoint.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

impl FromIterator<(String, Value)> for Context {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    // -----------------------------------------------------------------------
    // Basic operations
    // -----------------------------------------------------------------------

    #[test]
    fn test_insert_and_get() {
        let mut ctx = Context::new();
        ctx.insert("x", json!(5));
        assert_eq!(ctx.get("x"), Some(&json!(5)));
        assert_eq!(ctx.get("missing"), None);
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_with_builder() {
        let ctx = Context::new().with("a", json!(1)).with("b", json!("two"));
        assert_eq!(ctx.get("a"), Some(&json!(1)));
        assert_eq!(ctx.get("b"), Some(&json!("two")));
    }

    // -----------------------------------------------------------------------
    // Merge semantics
    // -----------------------------------------------------------------------

    #[test]
    fn test_merge_returns_touched_keys_sorted() {
        let mut ctx = Context::new().with("x", json!(1));
        let touched = ctx.merge(obj(json!({"b": 2, "a": 1})));
        assert_eq!(touched, vec!["a", "b"]);
        assert_eq!(ctx.len(), 3);
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut ctx = Context::new().with("x", json!(1));
        ctx.merge(obj(json!({"x": 99})));
        assert_eq!(ctx.get("x"), Some(&json!(99)));
    }

    // -----------------------------------------------------------------------
    // Snapshot and diff
    // -----------------------------------------------------------------------

    #[test]
    fn test_snapshot_is_isolated() {
        let mut ctx = Context::new().with("x", json!(1));
        let snap = ctx.snapshot();
        ctx.insert("y", json!(2));
        assert!(snap.get("y").is_none());
        assert_eq!(snap.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_added_since_excludes_overwrites() {
        let base = Context::new().with("x", json!(1));
        let later = Context::new().with("x", json!(99)).with("y", json!(2));
        assert_eq!(later.added_since(&base), vec!["y"]);
    }

    #[test]
    fn test_changes_since_includes_overwrites() {
        let base = Context::new().with("x", json!(1)).with("same", json!("s"));
        let later = Context::new()
            .with("x", json!(99))
            .with("same", json!("s"))
            .with("y", json!(2));
        let changed = later.changes_since(&base);
        assert_eq!(changed.len(), 2);
        assert_eq!(changed.get("x"), Some(&json!(99)));
        assert_eq!(changed.get("y"), Some(&json!(2)));
        assert!(!changed.contains_key("same"));
    }

    // -----------------------------------------------------------------------
    // JSON round-trip
    // -----------------------------------------------------------------------

    #[test]
    fn test_json_roundtrip() {
        let ctx = Context::new()
            .with("order_id", json!(42))
            .with("items", json!(["a", "b"]));
        let value = ctx.to_value();
        let restored = Context::from_value(value).unwrap();
        assert_eq!(restored, ctx);
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        assert!(Context::from_value(json!([1, 2])).is_err());
        assert!(Context::from_value(json!("nope")).is_err());
    }
}
