//! Row decoding.
//!
//! Converts driver rows into [`Row`] maps of column name to JSON scalar.
//!
//! # Architecture
//!
//! Conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies a column's type name into a logical category
//! 2. Backend-specific decoders pick the concrete Rust type for that category
//!
//! SQLite columns are classified by the runtime storage class of the value, since
//! expression columns (`SELECT 1 AS x`) carry no declared type.

use crate::models::{DatabaseType, Row};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row as SqlxRow, Type, TypeInfo, ValueRef};
use tracing::debug;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    TimestampTz,
    Timestamp,
    Date,
    Time,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();
    // "varchar(20)", "int unsigned", "double precision"
    let base = lower
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or("");

    match base {
        "int2" | "int4" | "int8" | "smallint" | "int" | "integer" | "bigint" | "tinyint"
        | "mediumint" | "serial" | "bigserial" | "year" => TypeCategory::Integer,
        "float4" | "float8" | "real" | "double" | "float" => TypeCategory::Float,
        // SQLite's NUMERIC affinity stores plain numbers
        "numeric" | "decimal" if db == DatabaseType::SQLite => TypeCategory::Float,
        "numeric" | "decimal" => TypeCategory::Decimal,
        "bool" | "boolean" => TypeCategory::Boolean,
        "json" | "jsonb" => TypeCategory::Json,
        "bytea" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
            TypeCategory::Binary
        }
        "timestamptz" => TypeCategory::TimestampTz,
        "timestamp" | "datetime" => TypeCategory::Timestamp,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "text" | "varchar" | "char" | "bpchar" | "name" | "character" | "tinytext"
        | "mediumtext" | "longtext" | "enum" | "set" | "clob" => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

/// Encode binary column data for JSON output.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Decode column `idx` as `T`, mapping SQL NULL and decode failures to JSON null.
fn decode_as<'r, R, T>(row: &'r R, idx: usize, into_json: impl FnOnce(T) -> JsonValue) -> JsonValue
where
    R: SqlxRow,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(Some(v)) => into_json(v),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            debug!(column = idx, error = %e, "Failed to decode column");
            JsonValue::Null
        }
    }
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> Row;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                (col.name().to_string(), postgres::decode_column(self, idx, type_name))
            })
            .collect()
    }
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                (col.name().to_string(), mysql::decode_column(self, idx, type_name))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let declared = col.type_info().name().to_string();
                (col.name().to_string(), sqlite::decode_column(self, idx, &declared))
            })
            .collect()
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use rust_decimal::Decimal;

    pub fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> JsonValue {
        match categorize_type(type_name, DatabaseType::PostgreSQL) {
            TypeCategory::Integer => match type_name {
                "INT2" => decode_as::<_, i16>(row, idx, JsonValue::from),
                "INT4" => decode_as::<_, i32>(row, idx, JsonValue::from),
                _ => decode_as::<_, i64>(row, idx, JsonValue::from),
            },
            TypeCategory::Float if type_name == "FLOAT4" => {
                decode_as::<_, f32>(row, idx, |v| float_value(v as f64))
            }
            TypeCategory::Float => decode_as::<_, f64>(row, idx, float_value),
            TypeCategory::Decimal => {
                decode_as::<_, Decimal>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Boolean => decode_as::<_, bool>(row, idx, JsonValue::Bool),
            TypeCategory::Json => decode_as::<_, JsonValue>(row, idx, |v| v),
            TypeCategory::Binary => decode_as::<_, Vec<u8>>(row, idx, |v| encode_binary(&v)),
            TypeCategory::TimestampTz => {
                decode_as::<_, DateTime<Utc>>(row, idx, |v| JsonValue::String(v.to_rfc3339()))
            }
            TypeCategory::Timestamp => {
                decode_as::<_, NaiveDateTime>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Date => {
                decode_as::<_, NaiveDate>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Time => {
                decode_as::<_, NaiveTime>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Text | TypeCategory::Unknown => {
                decode_as::<_, String>(row, idx, JsonValue::String)
            }
        }
    }
}

mod mysql {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use rust_decimal::Decimal;

    pub fn decode_column(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        match categorize_type(type_name, DatabaseType::MySQL) {
            TypeCategory::Integer if type_name.contains("UNSIGNED") => {
                decode_as::<_, u64>(row, idx, JsonValue::from)
            }
            TypeCategory::Integer => decode_as::<_, i64>(row, idx, JsonValue::from),
            TypeCategory::Float if type_name == "FLOAT" => {
                decode_as::<_, f32>(row, idx, |v| float_value(v as f64))
            }
            TypeCategory::Float => decode_as::<_, f64>(row, idx, float_value),
            TypeCategory::Decimal => {
                decode_as::<_, Decimal>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Boolean => decode_as::<_, bool>(row, idx, JsonValue::Bool),
            TypeCategory::Json => decode_as::<_, JsonValue>(row, idx, |v| v),
            TypeCategory::Binary => decode_as::<_, Vec<u8>>(row, idx, |v| encode_binary(&v)),
            TypeCategory::TimestampTz | TypeCategory::Timestamp => {
                decode_as::<_, NaiveDateTime>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Date => {
                decode_as::<_, NaiveDate>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Time => {
                decode_as::<_, NaiveTime>(row, idx, |v| JsonValue::String(v.to_string()))
            }
            TypeCategory::Text | TypeCategory::Unknown => {
                decode_as::<_, String>(row, idx, JsonValue::String)
            }
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, declared_type: &str) -> JsonValue {
        let storage_class = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return JsonValue::Null,
            Ok(raw) => raw.type_info().name().to_string(),
            Err(e) => {
                debug!(column = idx, error = %e, "Failed to read column");
                return JsonValue::Null;
            }
        };

        // Booleans and JSON are stored as INTEGER/TEXT; only the declaration tells them apart
        let category = match categorize_type(declared_type, DatabaseType::SQLite) {
            c @ (TypeCategory::Boolean | TypeCategory::Json) => c,
            _ => categorize_type(&storage_class, DatabaseType::SQLite),
        };

        match category {
            TypeCategory::Integer => decode_as::<_, i64>(row, idx, JsonValue::from),
            TypeCategory::Float | TypeCategory::Decimal => {
                decode_as::<_, f64>(row, idx, float_value)
            }
            TypeCategory::Boolean => decode_as::<_, bool>(row, idx, JsonValue::Bool),
            TypeCategory::Binary => decode_as::<_, Vec<u8>>(row, idx, |v| encode_binary(&v)),
            TypeCategory::Json => decode_as::<_, String>(row, idx, |v| {
                serde_json::from_str(&v).unwrap_or(JsonValue::String(v))
            }),
            _ => decode_as::<_, String>(row, idx, JsonValue::String),
        }
    }
}
