//! Query-related data models.
//!
//! This module defines the compiled query handed to the core by the query builder
//! and the result set returned by adapters.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// SQL text plus its ordered parameters, as produced by a query builder.
///
/// Placeholders in `sql` are backend-specific (`?`, `$1`, ...) and are passed
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
}

impl CompiledQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append a positional parameter.
    pub fn bind(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl From<&str> for CompiledQuery {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for CompiledQuery {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

/// Rows and counters returned by one statement execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
    /// For statements that do not return rows (INSERT/UPDATE/DELETE/DDL).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

impl ResultSet {
    /// Create a result for write operations.
    pub fn write_result(rows_affected: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(rows_affected),
        }
    }

    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First value of the first row, handy for `SELECT COUNT(*)`-style queries.
    pub fn scalar(&self) -> Option<&JsonValue> {
        let first = self.rows.first()?;
        match self.columns.first() {
            Some(col) => first.get(col),
            None => first.values().next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_deserialize() {
        let params: Vec<QueryParam> = serde_json::from_str(r#"[null, true, 42, 1.5, "x"]"#).unwrap();
        assert!(params[0].is_null());
        assert_eq!(params[1], QueryParam::Bool(true));
        assert_eq!(params[2], QueryParam::Int(42));
        assert_eq!(params[3], QueryParam::Float(1.5));
        assert_eq!(params[4], QueryParam::String("x".into()));
    }

    #[test]
    fn test_query_param_from_option() {
        let none: Option<i64> = None;
        assert!(QueryParam::from(none).is_null());
        assert_eq!(QueryParam::from(Some("a")), QueryParam::String("a".into()));
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let param = QueryParam::Bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(serde_json::to_value(&param).unwrap(), json!("3q2+7w=="));
    }

    #[test]
    fn test_compiled_query_bind_order() {
        let q = CompiledQuery::new("INSERT INTO t (a, b, c) VALUES (?, ?, ?)")
            .bind(1)
            .bind("two")
            .bind(None::<bool>);
        assert_eq!(q.params.len(), 3);
        assert_eq!(q.params[0].type_name(), "int");
        assert_eq!(q.params[1].type_name(), "string");
        assert_eq!(q.params[2].type_name(), "null");
    }

    #[test]
    fn test_result_set_scalar() {
        let mut row = serde_json::Map::new();
        row.insert("n".into(), json!(7));
        let rs = ResultSet {
            columns: vec!["n".into()],
            rows: vec![row],
            rows_affected: None,
        };
        assert_eq!(rs.scalar(), Some(&json!(7)));
        assert!(ResultSet::write_result(3).scalar().is_none());
    }
}
