//! Parameterized SQL builder
//!
//! SQL text can only be extended with `&'static str` fragments, so every
//! value that originates outside this crate (filter paths, filter values,
//! ids, pagination) has to go through [`ParameterizedQuery::bind`] and ends
//! up as a bound `?` parameter.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};

/// SQL text plus its positional parameters
#[derive(Debug, Clone, Default)]
pub struct ParameterizedQuery {
    sql: String,
    params: Vec<Value>,
}

impl ParameterizedQuery {
    /// Start a query from a static fragment
    pub fn new(fragment: &'static str) -> Self {
        ParameterizedQuery {
            sql: fragment.to_string(),
            params: Vec::new(),
        }
    }

    /// Append a static fragment
    pub fn push(&mut self, fragment: &'static str) -> &mut Self {
        self.sql.push_str(fragment);
        self
    }

    /// Append a `?` placeholder bound to `value`
    pub fn bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.sql.push('?');
        self.params.push(value.into());
        self
    }

    /// Append `(?, ?, ...)` bound to each value
    ///
    /// An empty list renders `(NULL)`, which matches nothing in `IN`.
    pub fn bind_list<I, V>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.sql.push('(');
        let mut first = true;
        for value in values {
            if !first {
                self.sql.push_str(", ");
            }
            first = false;
            self.bind(value);
        }
        if first {
            self.sql.push_str("NULL");
        }
        self.sql.push(')');
        self
    }

    /// Append a comparison of the body scalar at `json_path` with `value`
    ///
    /// Booleans compare as "true"/"false" and integers as text, so the
    /// comparison agrees with the in-memory filter. SQLite prints reals
    /// with fewer digits than JSON does, so a real compares numerically,
    /// and only against a value written in its shortest round-trip form.
    /// Arrays, objects and nulls never match.
    pub fn push_body_scalar_eq(&mut self, json_path: String, value: String) -> &mut Self {
        let real = canonical_real(&value).map_or(Value::Null, Value::Real);
        self.push("(CASE json_type(edfi_doc, ")
            .bind(json_path.clone())
            .push(") WHEN 'true' THEN ")
            .bind(value.clone())
            .push(" = 'true' WHEN 'false' THEN ")
            .bind(value.clone())
            .push(" = 'false' WHEN 'integer' THEN CAST(json_extract(edfi_doc, ")
            .bind(json_path.clone())
            .push(") AS TEXT) = ")
            .bind(value.clone())
            .push(" WHEN 'real' THEN json_extract(edfi_doc, ")
            .bind(json_path.clone())
            .push(") = ")
            .bind(real)
            .push(" WHEN 'text' THEN json_extract(edfi_doc, ")
            .bind(json_path)
            .push(") = ")
            .bind(value)
            .push(" ELSE 0 END)")
    }

    /// The SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The bound parameters, in placeholder order
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Run the query and map every row
    pub fn query_map<T, F>(&self, conn: &Connection, mut f: F) -> rusqlite::Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = conn.prepare(&self.sql)?;
        let rows = stmt.query_map(params_from_iter(self.params.iter()), |row| f(row))?;
        rows.collect()
    }

    /// Execute a statement, returning the number of changed rows
    pub fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(&self.sql, params_from_iter(self.params.iter()))
    }
}

/// The f64 a filter value names, if the value is that f64's JSON rendering
fn canonical_real(value: &str) -> Option<f64> {
    let parsed: f64 = value.parse().ok()?;
    let rendered = serde_json::Number::from_f64(parsed)?.to_string();
    (rendered == value).then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_appends_placeholders() {
        let mut q = ParameterizedQuery::new("SELECT 1 WHERE a = ");
        q.bind("x".to_string()).push(" AND b IN ").bind_list(vec![1i64, 2, 3]);
        assert_eq!(q.sql(), "SELECT 1 WHERE a = ? AND b IN (?, ?, ?)");
        assert_eq!(q.params().len(), 4);
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        let mut q = ParameterizedQuery::new("SELECT 1 WHERE 1 IN ");
        q.bind_list(Vec::<i64>::new());
        assert_eq!(q.sql(), "SELECT 1 WHERE 1 IN (NULL)");
        let rows = q.query_map(&conn, |row| row.get::<_, i64>(0)).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_values_with_quotes_are_bound_not_interpolated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (edfi_doc TEXT NOT NULL)").unwrap();
        conn.execute(
            "INSERT INTO t VALUES (?1)",
            [r#"{"name": "O'Neil'); DROP TABLE t; --"}"#],
        )
        .unwrap();

        let mut q = ParameterizedQuery::new("SELECT count(*) FROM t WHERE ");
        q.push_body_scalar_eq("$.name".to_string(), "O'Neil'); DROP TABLE t; --".to_string());
        assert!(!q.sql().contains("O'Neil"));
        let count = q.query_map(&conn, |row| row.get::<_, i64>(0)).unwrap();
        assert_eq!(count, vec![1]);
    }

    #[test]
    fn test_body_scalar_rendering() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (edfi_doc TEXT NOT NULL)").unwrap();
        conn.execute(
            "INSERT INTO t VALUES (?1)",
            [r#"{"n": 123, "f": 1.5, "b": true, "s": "abc", "a": [1], "z": null}"#],
        )
        .unwrap();

        let matches = |path: &str, value: &str| {
            let mut q = ParameterizedQuery::new("SELECT count(*) FROM t WHERE ");
            q.push_body_scalar_eq(path.to_string(), value.to_string());
            q.query_map(&conn, |row| row.get::<_, i64>(0)).unwrap()[0] == 1
        };

        assert!(matches("$.n", "123"));
        assert!(matches("$.f", "1.5"));
        assert!(matches("$.b", "true"));
        assert!(!matches("$.b", "1"));
        assert!(matches("$.s", "abc"));
        assert!(!matches("$.a", "[1]"));
        assert!(!matches("$.z", "null"));
        assert!(!matches("$.missing", ""));
    }

    #[test]
    fn test_real_matches_shortest_json_rendering() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (edfi_doc TEXT NOT NULL)").unwrap();
        conn.execute(
            "INSERT INTO t VALUES (?1)",
            [r#"{"gpa": 0.30000000000000004, "avg": 100.0}"#],
        )
        .unwrap();

        let matches = |path: &str, value: &str| {
            let mut q = ParameterizedQuery::new("SELECT count(*) FROM t WHERE ");
            q.push_body_scalar_eq(path.to_string(), value.to_string());
            q.query_map(&conn, |row| row.get::<_, i64>(0)).unwrap()[0] == 1
        };

        assert!(matches("$.gpa", "0.30000000000000004"));
        assert!(!matches("$.gpa", "0.3"));
        assert!(matches("$.avg", "100.0"));
        // Same number, not the JSON rendering
        assert!(!matches("$.avg", "100"));
        assert!(!matches("$.avg", "1e2"));
    }

    #[test]
    fn test_canonical_real() {
        assert_eq!(canonical_real("1.5"), Some(1.5));
        assert_eq!(canonical_real("0.30000000000000004"), Some(0.30000000000000004));
        assert_eq!(canonical_real("1.50"), None);
        assert_eq!(canonical_real("abc"), None);
        assert_eq!(canonical_real("NaN"), None);
    }
}
