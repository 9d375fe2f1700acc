//! Query key descriptors and their normalized identity
//!
//! A [`QueryKey`] is what callers build: an ordered list of primitive parts,
//! usually a resource path followed by scoping identifiers. The store never
//! compares descriptors directly; it compares the [`CacheKey`] produced by
//! [`QueryKey::cache_key`], so descriptors rebuilt on every call still land on
//! the same entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Normalized, comparable identity of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// The normalized form as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied key descriptor
///
/// Parts are kept as JSON values. Strings, numbers, booleans and null are the
/// expected contents; objects and arrays are accepted without validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryKey {
    parts: Vec<Value>,
}

impl QueryKey {
    /// Start a key with its leading part, typically a resource path
    pub fn new(root: impl Into<Value>) -> Self {
        Self {
            parts: vec![root.into()],
        }
    }

    /// A key with no parts
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a key from already-converted parts
    pub fn from_parts(parts: Vec<Value>) -> Self {
        Self { parts }
    }

    /// Append a scoping part
    pub fn with(mut self, part: impl Into<Value>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// The ordered parts of this key
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// True when the key has no parts
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// True when `prefix`'s parts equal the leading parts of this key
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.parts.len() <= self.parts.len()
            && prefix
                .parts
                .iter()
                .zip(&self.parts)
                .all(|(a, b)| a == b)
    }

    /// Normalize into the store's identity
    ///
    /// The ordered parts are serialized as compact JSON. Object members are
    /// rebuilt in name order at every depth, so only the sequence order of
    /// the parts matters, whatever map ordering `serde_json` was built with.
    pub fn cache_key(&self) -> CacheKey {
        let parts: Vec<Value> = self.parts.iter().map(sorted_members).collect();
        // Serializing a Vec<Value> cannot fail: every Value is representable.
        let normalized = serde_json::to_string(&parts).unwrap_or_default();
        CacheKey(normalized)
    }
}

fn sorted_members(value: &Value) -> Value {
    match value {
        Value::Object(members) => {
            let mut names: Vec<&String> = members.keys().collect();
            names.sort();
            Value::Object(
                names
                    .into_iter()
                    .map(|name| (name.clone(), sorted_members(&members[name])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_members).collect()),
        other => other.clone(),
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cache_key().as_str())
    }
}

impl From<&str> for QueryKey {
    fn from(s: &str) -> Self {
        QueryKey::new(s)
    }
}

impl From<String> for QueryKey {
    fn from(s: String) -> Self {
        QueryKey::new(s)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        QueryKey::from_parts(parts)
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

impl<A, B> From<(A, B)> for QueryKey
where
    A: Into<Value>,
    B: Into<Value>,
{
    fn from((a, b): (A, B)) -> Self {
        QueryKey::new(a).with(b)
    }
}

impl<A, B, C> From<(A, B, C)> for QueryKey
where
    A: Into<Value>,
    B: Into<Value>,
    C: Into<Value>,
{
    fn from((a, b, c): (A, B, C)) -> Self {
        QueryKey::new(a).with(b).with(c)
    }
}

/// Build a [`QueryKey`] from a list of parts
///
/// ```rust
/// use ouroboros_query::query_key;
///
/// let key = query_key!["projects", 42, "reviews"];
/// assert_eq!(key.cache_key().as_str(), r#"["projects",42,"reviews"]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::cache::key::QueryKey::empty()
    };
    ($($part:expr),+ $(,)?) => {{
        let key = $crate::cache::key::QueryKey::empty();
        $(let key = key.with($part);)+
        key
    }};
}
