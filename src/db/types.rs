//! Row decoding for the sqlx-backed adapters.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies a column's backend type name into a logical category
//! 2. The `RowToJson` impl for each backend row type decodes the value for that category
//!
//! Values that fail to decode under their category fall back to text, then to NULL.

use crate::models::DatabaseType;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Map, Value as JsonValue};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Temporal,
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked before floats: "numeric" would otherwise be ambiguous
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity is really a float
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower.contains("serial") || lower == "tiny" {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("date") || lower.contains("time") {
        return TypeCategory::Temporal;
    }

    TypeCategory::Text
}

/// Encode binary column data for JSON output.
pub fn binary_value(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn try_decode<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<T, _>(idx).ok()
}

fn decode_temporal<'r, R>(row: &'r R, idx: usize) -> Option<JsonValue>
where
    R: Row,
    usize: ColumnIndex<R>,
    chrono::DateTime<chrono::Utc>: Decode<'r, R::Database> + Type<R::Database>,
    chrono::NaiveDateTime: Decode<'r, R::Database> + Type<R::Database>,
    chrono::NaiveDate: Decode<'r, R::Database> + Type<R::Database>,
    chrono::NaiveTime: Decode<'r, R::Database> + Type<R::Database>,
{
    try_decode::<_, chrono::DateTime<chrono::Utc>>(row, idx)
        .map(|v| v.to_rfc3339())
        .or_else(|| try_decode::<_, chrono::NaiveDateTime>(row, idx).map(|v| v.to_string()))
        .or_else(|| try_decode::<_, chrono::NaiveDate>(row, idx).map(|v| v.to_string()))
        .or_else(|| try_decode::<_, chrono::NaiveTime>(row, idx).map(|v| v.to_string()))
        .map(JsonValue::String)
}

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

fn decode_raw_decimal_mysql(row: &MySqlRow, idx: usize) -> Option<JsonValue> {
    try_decode::<_, RawDecimal>(row, idx).map(|v| JsonValue::String(v.0))
}

fn decode_raw_decimal_pg(row: &PgRow, idx: usize) -> Option<JsonValue> {
    try_decode::<_, RawDecimal>(row, idx).map(|v| JsonValue::String(v.0))
}

fn decode_real_sqlite(row: &SqliteRow, idx: usize) -> Option<JsonValue> {
    try_decode::<_, f64>(row, idx).map(float_value)
}

fn text_checked<R>(row: &R, idx: usize) -> Option<String>
where
    R: Row,
    usize: ColumnIndex<R>,
    String: for<'r> Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<String, _>(idx).ok()
}

// SQLite converts any stored value to text on request
fn text_sqlite(row: &SqliteRow, idx: usize) -> Option<String> {
    row.try_get_unchecked::<String, _>(idx).ok()
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> Map<String, JsonValue>;
    fn column_names(&self) -> Vec<String>;
}

macro_rules! impl_row_to_json {
    (
        $row:ty,
        $db:expr,
        ints = [$($int:ty),+],
        decimal = $decimal:path,
        text = $text:path
    ) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> Map<String, JsonValue> {
                self.columns()
                    .iter()
                    .map(|col| {
                        let idx = col.ordinal();
                        let is_null = self.try_get_raw(idx).map_or(true, |v| v.is_null());
                        if is_null {
                            return (col.name().to_string(), JsonValue::Null);
                        }

                        let type_name = col.type_info().name();
                        let value = match categorize_type(type_name, $db) {
                            TypeCategory::Integer => None::<JsonValue>
                                $(.or_else(|| try_decode::<_, $int>(self, idx).map(JsonValue::from)))+,
                            TypeCategory::Float => try_decode::<_, f64>(self, idx)
                                .or_else(|| try_decode::<_, f32>(self, idx).map(f64::from))
                                .map(float_value),
                            TypeCategory::Decimal => $decimal(self, idx),
                            TypeCategory::Boolean => {
                                try_decode::<_, bool>(self, idx).map(JsonValue::Bool)
                            }
                            TypeCategory::Binary => {
                                try_decode::<_, Vec<u8>>(self, idx).map(|v| binary_value(&v))
                            }
                            TypeCategory::Json => try_decode::<_, JsonValue>(self, idx),
                            TypeCategory::Temporal => decode_temporal(self, idx),
                            TypeCategory::Text => None,
                        };

                        let value = value.or_else(|| {
                            $text(self, idx).map(|s| {
                                if type_name.to_lowercase().contains("json") {
                                    serde_json::from_str(&s).unwrap_or(JsonValue::String(s))
                                } else {
                                    JsonValue::String(s)
                                }
                            })
                        });

                        let value = value.unwrap_or_else(|| {
                            tracing::debug!(column = col.name(), type_name, "Undecodable column value");
                            JsonValue::Null
                        });
                        (col.name().to_string(), value)
                    })
                    .collect()
            }

            fn column_names(&self) -> Vec<String> {
                self.columns()
                    .iter()
                    .map(|col| col.name().to_string())
                    .collect()
            }
        }
    };
}

impl_row_to_json!(
    MySqlRow,
    DatabaseType::MySQL,
    ints = [i8, i16, i32, i64, u8, u16, u32, u64],
    decimal = decode_raw_decimal_mysql,
    text = text_checked
);

impl_row_to_json!(
    PgRow,
    DatabaseType::PostgreSQL,
    ints = [i16, i32, i64],
    decimal = decode_raw_decimal_pg,
    text = text_checked
);

impl_row_to_json!(
    SqliteRow,
    DatabaseType::SQLite,
    ints = [i64, i32],
    decimal = decode_real_sqlite,
    text = text_sqlite
);
