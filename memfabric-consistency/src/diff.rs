//! Structural diffs between two payloads.
//!
//! Paths are JSON-pointer-like: `""` is the root, map fields append
//! `/<field>` and array elements append `/<index>`.

use memfabric_types::Value;
use serde::{Deserialize, Serialize};

/// A changed location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub path: String,
    pub old: Value,
    pub new: Value,
}

/// Differences between two versions of a key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from_version: u64,
    pub to_version: u64,
    pub added: Vec<(String, Value)>,
    pub removed: Vec<(String, Value)>,
    pub modified: Vec<Modification>,
}

impl VersionDiff {
    /// Diffs `old` against `new`.
    #[must_use]
    pub fn between(from_version: u64, old: &Value, to_version: u64, new: &Value) -> Self {
        let mut diff = Self {
            from_version,
            to_version,
            ..Default::default()
        };
        diff.walk(String::new(), old, new);
        diff
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Number of changed locations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    fn walk(&mut self, path: String, old: &Value, new: &Value) {
        match (old, new) {
            (Value::Map(a), Value::Map(b)) => {
                for (field, old_value) in a {
                    let child = format!("{path}/{}", escape(field));
                    match b.get(field) {
                        Some(new_value) => self.walk(child, old_value, new_value),
                        None => self.removed.push((child, old_value.clone())),
                    }
                }
                for (field, new_value) in b {
                    if !a.contains_key(field) {
                        self.added
                            .push((format!("{path}/{}", escape(field)), new_value.clone()));
                    }
                }
            }
            (Value::Array(a), Value::Array(b)) => {
                for (i, old_value) in a.iter().enumerate() {
                    let child = format!("{path}/{i}");
                    match b.get(i) {
                        Some(new_value) => self.walk(child, old_value, new_value),
                        None => self.removed.push((child, old_value.clone())),
                    }
                }
                for (i, new_value) in b.iter().enumerate().skip(a.len()) {
                    self.added.push((format!("{path}/{i}"), new_value.clone()));
                }
            }
            _ if old != new => self.modified.push(Modification {
                path,
                old: old.clone(),
                new: new.clone(),
            }),
            _ => {}
        }
    }
}

/// RFC 6901 escaping for a single path segment.
fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
