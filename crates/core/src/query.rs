//! Query parameters and body field extraction
//!
//! Queries are equality filters over dotted paths into the document body
//! (`schoolReference.schoolId = 123`). Every query source compares the
//! same rendering of a scalar:
//! - strings as-is
//! - numbers as their JSON text
//! - booleans as "true" / "false"
//!
//! Paths descend through objects only. Arrays and nulls never match.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Render a scalar JSON value for comparison; `None` for anything else
pub fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Rendered scalar found at a dotted path, if any
pub fn scalar_at_path(body: &Value, path: &str) -> Option<String> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    render_scalar(current)
}

/// Every (dotted path, rendered scalar) pair in a body
///
/// Output is sorted by path.
pub fn flatten_body(body: &Value) -> Vec<(String, String)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    walk(&path, child, out);
                }
            }
            other => {
                if prefix.is_empty() {
                    return;
                }
                if let Some(rendered) = render_scalar(other) {
                    out.push((prefix.to_string(), rendered));
                }
            }
        }
    }

    let mut out = Vec::new();
    walk("", body, &mut out);
    out.sort();
    out
}

/// Check that a filter field is a dotted path of `[A-Za-z0-9_]` segments
pub fn validate_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidFilter(format!("'{}' is not a valid field path", path)))
    }
}

// ============================================================================
// FilterParameters
// ============================================================================

/// Equality filters, all of which must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterParameters(BTreeMap<String, String>);

impl FilterParameters {
    /// No filters; matches every document of the resource
    pub fn new() -> Self {
        FilterParameters(BTreeMap::new())
    }

    /// Builder: require `path` to equal `value`
    pub fn with(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(path.into(), value.into());
        self
    }

    /// Iterate (path, value) filters in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of filters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no filters
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check every filter path
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFilter` for the first malformed path.
    pub fn validate(&self) -> Result<()> {
        for path in self.0.keys() {
            validate_path(path)?;
        }
        Ok(())
    }

    /// Whether a body satisfies every filter
    pub fn matches(&self, body: &Value) -> bool {
        self.iter()
            .all(|(path, value)| scalar_at_path(body, path).as_deref() == Some(value))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FilterParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        FilterParameters(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// Offset/limit window applied after filtering, over id order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Matches to skip
    pub offset: usize,
    /// Maximum matches to return; `None` for all
    pub limit: Option<usize>,
}

impl Pagination {
    /// Window of at most `limit` results starting at `offset`
    pub fn new(offset: usize, limit: usize) -> Self {
        Pagination {
            offset,
            limit: Some(limit),
        }
    }

    /// Apply the window to id-ordered results
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_scalar() {
        assert_eq!(render_scalar(&json!("abc")), Some("abc".to_string()));
        assert_eq!(render_scalar(&json!(123)), Some("123".to_string()));
        assert_eq!(render_scalar(&json!(1.5)), Some("1.5".to_string()));
        assert_eq!(render_scalar(&json!(false)), Some("false".to_string()));
        assert_eq!(render_scalar(&json!(null)), None);
        assert_eq!(render_scalar(&json!([1])), None);
    }

    #[test]
    fn test_scalar_at_path_descends_objects_only() {
        let body = json!({
            "schoolReference": {"schoolId": 123},
            "grades": [{"name": "First"}],
        });
        assert_eq!(scalar_at_path(&body, "schoolReference.schoolId"), Some("123".to_string()));
        assert_eq!(scalar_at_path(&body, "schoolReference"), None);
        assert_eq!(scalar_at_path(&body, "grades.name"), None);
        assert_eq!(scalar_at_path(&body, "missing"), None);
    }

    #[test]
    fn test_flatten_body() {
        let body = json!({
            "nameOfInstitution": "Grand Bend",
            "address": {"city": "Austin", "zip": 78701},
            "tags": ["a", "b"],
            "closed": null,
        });
        let flat = flatten_body(&body);
        assert_eq!(
            flat,
            vec![
                ("address.city".to_string(), "Austin".to_string()),
                ("address.zip".to_string(), "78701".to_string()),
                ("nameOfInstitution".to_string(), "Grand Bend".to_string()),
            ]
        );
    }

    #[test]
    fn test_flatten_scalar_root_is_empty() {
        assert!(flatten_body(&json!(42)).is_empty());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("schoolId").is_ok());
        assert!(validate_path("schoolReference.school_id2").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("a..b").is_err());
        assert!(validate_path("a'; DROP TABLE documents; --").is_err());
        assert!(validate_path("$.a").is_err());
    }

    #[test]
    fn test_filter_matches() {
        let body = json!({"schoolId": 123, "nameOfInstitution": "O'Neil High"});
        let filters = FilterParameters::new()
            .with("schoolId", "123")
            .with("nameOfInstitution", "O'Neil High");
        assert!(filters.matches(&body));
        assert!(!FilterParameters::new().with("schoolId", "124").matches(&body));
        assert!(FilterParameters::new().matches(&body));
    }

    #[test]
    fn test_filter_from_iter_and_validate() {
        let filters: FilterParameters = [("ok", "1"), ("bad path", "2")].into_iter().collect();
        assert_eq!(filters.len(), 2);
        assert!(matches!(filters.validate(), Err(Error::InvalidFilter(_))));
    }

    #[test]
    fn test_pagination_apply() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(Pagination::new(2, 3).apply(items.clone()), vec![2, 3, 4]);
        assert_eq!(Pagination::default().apply(items.clone()).len(), 10);
        assert!(Pagination::new(20, 5).apply(items).is_empty());
    }
}
