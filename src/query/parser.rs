use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// A compiled index expression: a tree of getters evaluated against a
/// document's JSON content. Every node yields a list of values; the final
/// index keys are the string values left over at the root.
#[derive(Debug, Clone, PartialEq)]
pub enum Getter {
    /// Walk the object by dotted path.
    Field(Vec<String>),
    /// Lowercase string values, dropping non-strings.
    Lower(Box<Getter>),
    /// Zero-pad integers to the given width, dropping non-integers.
    Number(Box<Getter>, usize),
    /// Map booleans to "1"/"0", dropping non-booleans.
    Bool(Box<Getter>),
    /// Unique whitespace-separated tokens of each string, first-seen order.
    SplitWords(Box<Getter>),
    /// "1" when the inner getter yields nothing, "0" otherwise.
    IsNull(Box<Getter>),
}

impl Getter {
    pub fn get(&self, content: &Value) -> Vec<Value> {
        match self {
            Getter::Field(path) => extract_field(content, path),
            Getter::Lower(inner) => inner
                .get(content)
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(Value::String(s.to_lowercase())),
                    _ => None,
                })
                .collect(),
            Getter::Number(inner, width) => inner
                .get(content)
                .into_iter()
                .filter_map(|v| match v {
                    Value::Number(n) => n
                        .as_i64()
                        .map(|i| Value::String(format!("{:0width$}", i, width = *width))),
                    _ => None,
                })
                .collect(),
            Getter::Bool(inner) => inner
                .get(content)
                .into_iter()
                .filter_map(|v| match v {
                    Value::Bool(b) => Some(Value::String(if b { "1" } else { "0" }.to_string())),
                    _ => None,
                })
                .collect(),
            Getter::SplitWords(inner) => {
                let mut words: Vec<Value> = Vec::new();
                for v in inner.get(content) {
                    if let Value::String(s) = v {
                        for word in s.split_whitespace() {
                            if !words.iter().any(|w| w == word) {
                                words.push(Value::String(word.to_string()));
                            }
                        }
                    }
                }
                words
            }
            Getter::IsNull(inner) => {
                let empty = inner.get(content).is_empty();
                vec![Value::String(if empty { "1" } else { "0" }.to_string())]
            }
        }
    }
}

fn extract_field(content: &Value, path: &[String]) -> Vec<Value> {
    let mut current = content;
    for segment in path {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return Vec::new(),
            },
            _ => return Vec::new(),
        }
    }
    match current {
        Value::Object(_) | Value::Null => Vec::new(),
        // Arrays are filtered down to their primitive elements.
        Value::Array(items) => items
            .iter()
            .filter(|item| !matches!(item, Value::Object(_) | Value::Array(_) | Value::Null))
            .cloned()
            .collect(),
        other => vec![other.clone()],
    }
}

type TransformCtor = fn(Getter, &[&str]) -> StoreResult<Getter>;

/// Registration table from transform name to constructor; adding a
/// transform means adding a row here.
const TRANSFORMS: &[(&str, TransformCtor)] = &[
    ("lower", |inner, args| {
        expect_no_args("lower", args)?;
        Ok(Getter::Lower(Box::new(inner)))
    }),
    ("number", |inner, args| {
        let [width] = args else {
            return Err(StoreError::IndexDefinitionParse(
                "number() takes a field and a width".to_string(),
            ));
        };
        let width: usize = width.parse().map_err(|_| {
            StoreError::IndexDefinitionParse(format!("invalid number() width: {}", width))
        })?;
        Ok(Getter::Number(Box::new(inner), width))
    }),
    ("bool", |inner, args| {
        expect_no_args("bool", args)?;
        Ok(Getter::Bool(Box::new(inner)))
    }),
    ("split_words", |inner, args| {
        expect_no_args("split_words", args)?;
        Ok(Getter::SplitWords(Box::new(inner)))
    }),
    ("is_null", |inner, args| {
        expect_no_args("is_null", args)?;
        Ok(Getter::IsNull(Box::new(inner)))
    }),
];

fn expect_no_args(name: &str, args: &[&str]) -> StoreResult<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(StoreError::IndexDefinitionParse(format!(
            "{}() takes no extra arguments",
            name
        )))
    }
}

/// Parse one index expression into a getter tree.
pub fn parse(expression: &str) -> StoreResult<Getter> {
    inner_parse(expression)
}

/// Parse a whole index definition (one getter per expression).
pub fn parse_all(expressions: &[String]) -> StoreResult<Vec<Getter>> {
    expressions.iter().map(|e| parse(e)).collect()
}

fn take_word(partial: &str) -> (&str, &str) {
    match partial.find(['(', ')']) {
        Some(idx) => partial.split_at(idx),
        None => (partial, ""),
    }
}

fn inner_parse(expression: &str) -> StoreResult<Getter> {
    let (word, rest) = take_word(expression);
    if let Some(inside) = rest.strip_prefix('(') {
        let inside = inside.strip_suffix(')').ok_or_else(|| {
            StoreError::IndexDefinitionParse(format!(
                "invalid transformation function: {}",
                rest
            ))
        })?;
        let ctor = TRANSFORMS
            .iter()
            .find(|(name, _)| *name == word)
            .map(|(_, ctor)| ctor)
            .ok_or_else(|| {
                StoreError::IndexDefinitionParse(format!("unknown operation: {}", word))
            })?;
        let mut parts = split_args(inside);
        let extracted = parts.remove(0);
        let inner = inner_parse(extracted)?;
        ctor(inner, &parts)
    } else {
        if !rest.is_empty() {
            return Err(StoreError::IndexDefinitionParse(format!(
                "unhandled characters: {}",
                rest
            )));
        }
        if word.is_empty() {
            return Err(StoreError::IndexDefinitionParse(
                "missing field specifier".to_string(),
            ));
        }
        if word.ends_with('.') {
            return Err(StoreError::IndexDefinitionParse(format!(
                "invalid field specifier: {}",
                word
            )));
        }
        Ok(Getter::Field(
            word.split('.').map(|s| s.to_string()).collect(),
        ))
    }
}

/// Split transform arguments at top-level commas only, trimming whitespace.
fn split_args(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(s[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}
