use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::query::{parse_all, Getter};

/// One secondary index: its expressions, the compiled getters, and the
/// entry table mapping tuple keys to the documents filed under them.
///
/// Entries live in BTree maps so queries come back sorted by tuple key,
/// tie-broken by doc id, without sorting at query time.
#[derive(Debug)]
pub struct IndexDefinition {
    expressions: Vec<String>,
    getters: Vec<Getter>,
    entries: BTreeMap<Vec<String>, BTreeSet<String>>,
    doc_keys: HashMap<String, Vec<Vec<String>>>,
}

impl IndexDefinition {
    fn new(expressions: Vec<String>) -> StoreResult<Self> {
        let getters = parse_all(&expressions)?;
        Ok(Self {
            expressions,
            getters,
            entries: BTreeMap::new(),
            doc_keys: HashMap::new(),
        })
    }

    fn arity(&self) -> usize {
        self.getters.len()
    }

    fn add_doc(&mut self, doc_id: &str, content: &Value) {
        let keys = expand_keys(&self.getters, content);
        for key in &keys {
            self.entries
                .entry(key.clone())
                .or_default()
                .insert(doc_id.to_string());
        }
        if !keys.is_empty() {
            self.doc_keys.insert(doc_id.to_string(), keys);
        }
    }

    fn remove_doc(&mut self, doc_id: &str) {
        if let Some(keys) = self.doc_keys.remove(doc_id) {
            for key in keys {
                if let Some(ids) = self.entries.get_mut(&key) {
                    ids.remove(doc_id);
                    if ids.is_empty() {
                        self.entries.remove(&key);
                    }
                }
            }
        }
    }
}

/// Evaluate every expression and build the cross-product of the per-column
/// key lists. Any empty column produces no keys at all.
fn expand_keys(getters: &[Getter], content: &Value) -> Vec<Vec<String>> {
    let mut keys: Vec<Vec<String>> = vec![Vec::new()];
    for getter in getters {
        let column: Vec<String> = getter
            .get(content)
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect();
        if column.is_empty() {
            return Vec::new();
        }
        keys = keys
            .into_iter()
            .flat_map(|prefix| {
                column.iter().map(move |value| {
                    let mut key = prefix.clone();
                    key.push(value.clone());
                    key
                })
            })
            .collect();
    }
    keys
}

/// One position of an index query: an exact value, a trailing glob
/// (`"prefix*"`), or the pure wildcard (`"*"`).
#[derive(Debug, Clone, PartialEq)]
enum KeyPattern {
    Exact(String),
    Prefix(String),
    Any,
}

impl KeyPattern {
    fn parse(value: &str) -> KeyPattern {
        if value == "*" {
            KeyPattern::Any
        } else if let Some(prefix) = value.strip_suffix('*') {
            KeyPattern::Prefix(prefix.to_string())
        } else {
            KeyPattern::Exact(value.to_string())
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(value) => key == value,
            // Matching is case-sensitive; '%' and '_' have no special meaning.
            KeyPattern::Prefix(prefix) => key.starts_with(prefix),
            KeyPattern::Any => true,
        }
    }
}

/// Parse query values, enforcing the globbing contract: after a glob or
/// wildcard position only pure wildcards may follow.
fn parse_patterns(values: &[&str]) -> StoreResult<Vec<KeyPattern>> {
    let patterns: Vec<KeyPattern> = values.iter().map(|v| KeyPattern::parse(v)).collect();
    let mut globbed = false;
    for pattern in &patterns {
        match pattern {
            KeyPattern::Any => globbed = true,
            KeyPattern::Prefix(_) if globbed => return Err(StoreError::InvalidGlobbing),
            KeyPattern::Prefix(_) => globbed = true,
            KeyPattern::Exact(_) if globbed => return Err(StoreError::InvalidGlobbing),
            KeyPattern::Exact(_) => {}
        }
    }
    Ok(patterns)
}

/// Inclusive lower-bound check against a (possibly globbed) start tuple.
/// A prefix glob lower bound is simply the prefix itself, since every key
/// carrying the prefix sorts at or above it.
fn key_ge_start(key: &[String], start: &[KeyPattern]) -> bool {
    for (value, pattern) in key.iter().zip(start) {
        match pattern {
            KeyPattern::Any => return true,
            KeyPattern::Exact(bound) | KeyPattern::Prefix(bound) => {
                if value > bound {
                    return true;
                }
                if value < bound {
                    return false;
                }
            }
        }
    }
    true
}

/// Inclusive upper-bound check against a (possibly globbed) end tuple.
fn key_le_end(key: &[String], end: &[KeyPattern]) -> bool {
    for (value, pattern) in key.iter().zip(end) {
        match pattern {
            KeyPattern::Any => return true,
            KeyPattern::Exact(bound) => {
                if value < bound {
                    return true;
                }
                if value > bound {
                    return false;
                }
            }
            KeyPattern::Prefix(prefix) => {
                return value <= prefix || value.starts_with(prefix.as_str());
            }
        }
    }
    true
}

/// The per-database registry of secondary indexes.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    indexes: BTreeMap<String, IndexDefinition>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index. Recreating with the same expressions is a no-op;
    /// a different expression list under the same name is an error.
    pub fn create<'a>(
        &mut self,
        name: &str,
        expressions: &[&str],
        live_docs: impl Iterator<Item = (&'a String, &'a Value)>,
    ) -> StoreResult<()> {
        let expressions: Vec<String> = expressions.iter().map(|e| e.to_string()).collect();
        if let Some(existing) = self.indexes.get(name) {
            if existing.expressions == expressions {
                return Ok(());
            }
            return Err(StoreError::IndexNameTaken(name.to_string()));
        }
        let mut index = IndexDefinition::new(expressions)?;
        for (doc_id, content) in live_docs {
            index.add_doc(doc_id, content);
        }
        self.indexes.insert(name.to_string(), index);
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> StoreResult<()> {
        self.indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::IndexDoesNotExist(name.to_string()))
    }

    pub fn list(&self) -> Vec<(String, Vec<String>)> {
        self.indexes
            .iter()
            .map(|(name, index)| (name.clone(), index.expressions.clone()))
            .collect()
    }

    /// Re-index a document under its current content, or remove it when the
    /// content is gone (tombstone). Rewrites rows for every index.
    pub fn update_doc(&mut self, doc_id: &str, content: Option<&Value>) {
        for index in self.indexes.values_mut() {
            index.remove_doc(doc_id);
            if let Some(content) = content {
                index.add_doc(doc_id, content);
            }
        }
    }

    pub fn keys(&self, name: &str) -> StoreResult<Vec<Vec<String>>> {
        let index = self.get(name)?;
        Ok(index.entries.keys().cloned().collect())
    }

    /// Exact/glob lookup: returns matching doc ids in (tuple key, doc id)
    /// order.
    pub fn query(&self, name: &str, values: &[&str]) -> StoreResult<Vec<String>> {
        let index = self.get(name)?;
        if values.len() != index.arity() {
            return Err(StoreError::InvalidValueForIndex(format!(
                "index {} requires {} values, got {}",
                name,
                index.arity(),
                values.len()
            )));
        }
        let patterns = parse_patterns(values)?;
        let mut doc_ids = Vec::new();
        let mut seen = BTreeSet::new();
        for (key, ids) in &index.entries {
            if key
                .iter()
                .zip(&patterns)
                .all(|(value, pattern)| pattern.matches(value))
            {
                // A document can sit under several matching keys; report it
                // once, at its first matching key.
                doc_ids.extend(ids.iter().filter(|id| seen.insert((*id).clone())).cloned());
            }
        }
        Ok(doc_ids)
    }

    /// Inclusive range lookup over the lexicographic order of tuple keys.
    pub fn range(
        &self,
        name: &str,
        start: Option<&[&str]>,
        end: Option<&[&str]>,
    ) -> StoreResult<Vec<String>> {
        let index = self.get(name)?;
        let parse_bound = |bound: Option<&[&str]>| -> StoreResult<Option<Vec<KeyPattern>>> {
            match bound {
                None => Ok(None),
                Some(values) => {
                    if values.len() != index.arity() {
                        return Err(StoreError::InvalidValueForIndex(format!(
                            "index {} requires {} values, got {}",
                            name,
                            index.arity(),
                            values.len()
                        )));
                    }
                    parse_patterns(values).map(Some)
                }
            }
        };
        let start = parse_bound(start)?;
        let end = parse_bound(end)?;
        let mut doc_ids = Vec::new();
        let mut seen = BTreeSet::new();
        for (key, ids) in &index.entries {
            if let Some(start) = &start {
                if !key_ge_start(key, start) {
                    continue;
                }
            }
            if let Some(end) = &end {
                if !key_le_end(key, end) {
                    continue;
                }
            }
            doc_ids.extend(ids.iter().filter(|id| seen.insert((*id).clone())).cloned());
        }
        Ok(doc_ids)
    }

    fn get(&self, name: &str) -> StoreResult<&IndexDefinition> {
        self.indexes
            .get(name)
            .ok_or_else(|| StoreError::IndexDoesNotExist(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with(docs: &[(&str, Value)], exprs: &[&str]) -> IndexRegistry {
        let mut registry = IndexRegistry::new();
        let owned: Vec<(String, Value)> = docs
            .iter()
            .map(|(id, content)| (id.to_string(), content.clone()))
            .collect();
        registry
            .create("idx", exprs, owned.iter().map(|(id, c)| (id, c)))
            .unwrap();
        registry
    }

    #[test]
    fn test_create_is_idempotent_for_same_expressions() {
        let mut registry = IndexRegistry::new();
        registry.create("idx", &["key"], std::iter::empty()).unwrap();
        registry.create("idx", &["key"], std::iter::empty()).unwrap();
        assert_eq!(
            vec![("idx".to_string(), vec!["key".to_string()])],
            registry.list()
        );
    }

    #[test]
    fn test_create_rejects_different_expressions() {
        let mut registry = IndexRegistry::new();
        registry.create("idx", &["key"], std::iter::empty()).unwrap();
        assert!(matches!(
            registry.create("idx", &["other"], std::iter::empty()),
            Err(StoreError::IndexNameTaken(_))
        ));
    }

    #[test]
    fn test_delete_missing_index() {
        let mut registry = IndexRegistry::new();
        assert!(matches!(
            registry.delete("idx"),
            Err(StoreError::IndexDoesNotExist(_))
        ));
    }

    #[test]
    fn test_query_exact() {
        let registry = registry_with(
            &[("d1", json!({"key": "value"})), ("d2", json!({"key": "other"}))],
            &["key"],
        );
        assert_eq!(vec!["d1".to_string()], registry.query("idx", &["value"]).unwrap());
        assert!(registry.query("idx", &["novalue"]).unwrap().is_empty());
    }

    #[test]
    fn test_query_orders_by_key_then_doc_id() {
        let registry = registry_with(
            &[
                ("z", json!({"key": "value a"})),
                ("a", json!({"key": "value a"})),
                ("m", json!({"key": "value b"})),
            ],
            &["key"],
        );
        assert_eq!(
            vec!["a".to_string(), "z".to_string(), "m".to_string()],
            registry.query("idx", &["*"]).unwrap()
        );
    }

    #[test]
    fn test_query_glob_prefix() {
        let registry = registry_with(
            &[
                ("d1", json!({"key": "v1"})),
                ("d2", json!({"key": "v23"})),
                ("d3", json!({"key": "v2"})),
            ],
            &["key"],
        );
        assert_eq!(
            vec!["d3".to_string(), "d2".to_string()],
            registry.query("idx", &["v2*"]).unwrap()
        );
    }

    #[test]
    fn test_query_glob_is_case_sensitive() {
        let registry = registry_with(&[("d1", json!({"key": "value"}))], &["key"]);
        assert!(registry.query("idx", &["V*"]).unwrap().is_empty());
        assert_eq!(vec!["d1".to_string()], registry.query("idx", &["v*"]).unwrap());
    }

    #[test]
    fn test_query_sql_wildcards_are_literal() {
        let registry = registry_with(
            &[
                ("d1", json!({"key": "va%lue"})),
                ("d2", json!({"key": "value"})),
                ("d3", json!({"key": "va_lue"})),
            ],
            &["key"],
        );
        assert_eq!(vec!["d1".to_string()], registry.query("idx", &["va%*"]).unwrap());
        assert_eq!(vec!["d3".to_string()], registry.query("idx", &["va_*"]).unwrap());
    }

    #[test]
    fn test_query_wildcard_matches_empty_string() {
        let registry = registry_with(
            &[("d1", json!({"key": ""})), ("d2", json!({"key": "x"}))],
            &["key"],
        );
        assert_eq!(vec!["d1".to_string()], registry.query("idx", &[""]).unwrap());
        assert_eq!(
            vec!["d1".to_string(), "d2".to_string()],
            registry.query("idx", &["*"]).unwrap()
        );
    }

    #[test]
    fn test_query_arity_mismatch() {
        let registry = registry_with(&[], &["k1", "k2"]);
        for values in [vec![], vec!["v1"], vec!["v1", "v2", "v3"]] {
            assert!(matches!(
                registry.query("idx", &values),
                Err(StoreError::InvalidValueForIndex(_))
            ));
        }
    }

    #[test]
    fn test_query_globbing_rules() {
        let registry = registry_with(&[], &["k1", "k2"]);
        for values in [["*", "v2"], ["*", "v*"], ["v*", "v2"], ["v*", "v*"]] {
            assert!(matches!(
                registry.query("idx", &values),
                Err(StoreError::InvalidGlobbing)
            ));
        }
        registry.query("idx", &["v1", "*"]).unwrap();
        registry.query("idx", &["v1", "v*"]).unwrap();
        registry.query("idx", &["v*", "*"]).unwrap();
        registry.query("idx", &["*", "*"]).unwrap();
    }

    #[test]
    fn test_multi_column_partial_match() {
        let registry = registry_with(
            &[
                ("d1", json!({"k1": "v1", "k2": "v2"})),
                ("d2", json!({"k1": "v1", "k2": "x2"})),
                ("d3", json!({"k1": "NN", "k2": "v2"})),
            ],
            &["k1", "k2"],
        );
        assert_eq!(
            vec!["d1".to_string(), "d2".to_string()],
            registry.query("idx", &["v1", "*"]).unwrap()
        );
    }

    #[test]
    fn test_cross_product_keys() {
        let registry = registry_with(
            &[("d1", json!({"a": ["x", "y"], "b": "z"}))],
            &["a", "b"],
        );
        let keys = registry.keys("idx").unwrap();
        assert_eq!(
            vec![
                vec!["x".to_string(), "z".to_string()],
                vec!["y".to_string(), "z".to_string()],
            ],
            keys
        );
    }

    #[test]
    fn test_missing_column_drops_document() {
        let registry = registry_with(
            &[("d1", json!({"a": "x"})), ("d2", json!({"a": "x", "b": "y"}))],
            &["a", "b"],
        );
        assert_eq!(vec!["d2".to_string()], registry.query("idx", &["*", "*"]).unwrap());
    }

    #[test]
    fn test_update_doc_rewrites_rows() {
        let mut registry = registry_with(&[("d1", json!({"key": "value"}))], &["key"]);
        registry.update_doc("d1", Some(&json!({"key": "altval"})));
        assert!(registry.query("idx", &["value"]).unwrap().is_empty());
        assert_eq!(vec!["d1".to_string()], registry.query("idx", &["altval"]).unwrap());
        registry.update_doc("d1", None);
        assert!(registry.query("idx", &["*"]).unwrap().is_empty());
    }

    #[test]
    fn test_range_start_end() {
        let registry = registry_with(
            &[
                ("d1", json!({"key": "value3"})),
                ("d2", json!({"key": "value2"})),
                ("d3", json!({"key": "value4"})),
                ("d4", json!({"key": "value1"})),
            ],
            &["key"],
        );
        assert_eq!(
            vec!["d2".to_string(), "d1".to_string()],
            registry
                .range("idx", Some(&["value2"]), Some(&["value3"]))
                .unwrap()
        );
        assert_eq!(
            vec!["d2".to_string(), "d1".to_string(), "d3".to_string()],
            registry.range("idx", Some(&["value2"]), None).unwrap()
        );
        assert_eq!(
            vec!["d4".to_string(), "d2".to_string()],
            registry.range("idx", None, Some(&["value2"])).unwrap()
        );
    }

    #[test]
    fn test_range_with_glob_bounds() {
        let registry = registry_with(
            &[
                ("d1", json!({"key": "value4"})),
                ("d2", json!({"key": "value23"})),
                ("d3", json!({"key": "value2"})),
                ("d4", json!({"key": "value22"})),
                ("d5", json!({"key": "value1"})),
            ],
            &["key"],
        );
        assert_eq!(
            vec![
                "d3".to_string(),
                "d4".to_string(),
                "d2".to_string(),
                "d1".to_string()
            ],
            registry.range("idx", Some(&["value2*"]), None).unwrap()
        );
        assert_eq!(
            vec![
                "d5".to_string(),
                "d3".to_string(),
                "d4".to_string(),
                "d2".to_string()
            ],
            registry.range("idx", None, Some(&["value2*"])).unwrap()
        );
    }

    #[test]
    fn test_range_multi_column() {
        let registry = registry_with(
            &[
                ("d1", json!({"k1": "value3", "k2": "value4"})),
                ("d2", json!({"k1": "value2", "k2": "value23"})),
                ("d3", json!({"k1": "value2", "k2": "value2"})),
                ("d4", json!({"k1": "value1", "k2": "value1"})),
            ],
            &["k1", "k2"],
        );
        assert_eq!(
            vec!["d3".to_string(), "d2".to_string(), "d1".to_string()],
            registry
                .range("idx", Some(&["value2", "value2*"]), None)
                .unwrap()
        );
        assert_eq!(
            vec!["d4".to_string(), "d3".to_string(), "d2".to_string()],
            registry
                .range("idx", None, Some(&["value2", "value2*"]))
                .unwrap()
        );
        assert_eq!(
            vec!["d3".to_string(), "d2".to_string()],
            registry
                .range("idx", Some(&["value2", "*"]), None)
                .unwrap()
        );
    }

    #[test]
    fn test_range_globbing_rules() {
        let registry = registry_with(&[], &["k1", "k2"]);
        for bound in [["*", "v2"], ["*", "v*"]] {
            assert!(matches!(
                registry.range("idx", Some(&bound), None),
                Err(StoreError::InvalidGlobbing)
            ));
            assert!(matches!(
                registry.range("idx", None, Some(&bound)),
                Err(StoreError::InvalidGlobbing)
            ));
        }
    }

    #[test]
    fn test_doc_under_several_matching_keys_reported_once() {
        let registry = registry_with(
            &[("d1", json!({"name": "foo bar"}))],
            &["split_words(name)"],
        );
        assert_eq!(vec!["d1".to_string()], registry.query("idx", &["*"]).unwrap());
        assert_eq!(
            vec!["d1".to_string()],
            registry.range("idx", None, None).unwrap()
        );
    }

    #[test]
    fn test_keys_are_unique_and_sorted() {
        let registry = registry_with(
            &[
                ("d1", json!({"key": "value2"})),
                ("d2", json!({"key": "value1"})),
                ("d3", json!({"key": "value2"})),
            ],
            &["key"],
        );
        assert_eq!(
            vec![vec!["value1".to_string()], vec!["value2".to_string()]],
            registry.keys("idx").unwrap()
        );
    }
}
