//! Row decoding into the backend-neutral [`Row`] representation.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Backend-specific decoders handle the actual value extraction

use crate::models::{DatabaseType, Row};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row as _, Type, TypeInfo, ValueRef};

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
    Uuid,
    Timestamp,
    Date,
    Time,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    match lower.as_str() {
        "bool" | "boolean" => return TypeCategory::Boolean,
        "json" | "jsonb" => return TypeCategory::Json,
        "uuid" => return TypeCategory::Uuid,
        "date" => return TypeCategory::Date,
        "time" | "timetz" => return TypeCategory::Time,
        "interval" | "point" => return TypeCategory::Unknown,
        "real" | "float4" | "float8" => return TypeCategory::Float,
        "bytea" => return TypeCategory::Binary,
        _ => {}
    }

    // SQLite's NUMERIC affinity stores floats
    if lower.contains("decimal") || lower.contains("numeric") {
        return if db == DatabaseType::SQLite {
            TypeCategory::Float
        } else {
            TypeCategory::Decimal
        };
    }
    if lower.contains("timestamp") || lower.contains("datetime") {
        return TypeCategory::Timestamp;
    }
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }
    if lower.contains("float") || lower.contains("double") {
        return TypeCategory::Float;
    }
    if lower.contains("blob") || lower.contains("binary") {
        return TypeCategory::Binary;
    }
    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }
    TypeCategory::Unknown
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
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("numeric")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(pg_numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

/// Render the PostgreSQL binary NUMERIC wire format (base-10000 digit groups).
fn pg_numeric_to_string(buf: &[u8]) -> Result<String, BoxDynError> {
    const SIGN_NEGATIVE: u16 = 0x4000;
    const SIGN_NAN: u16 = 0xC000;

    if buf.len() < 8 {
        return Err("NUMERIC value shorter than its header".into());
    }
    let read = |at: usize| [buf[at], buf[at + 1]];
    let ndigits = u16::from_be_bytes(read(0)) as usize;
    let weight = i16::from_be_bytes(read(2)) as i32;
    let sign = u16::from_be_bytes(read(4));
    let dscale = u16::from_be_bytes(read(6)) as usize;

    if sign == SIGN_NAN {
        return Ok("NaN".to_string());
    }
    let digits: Vec<i16> = buf[8..]
        .chunks_exact(2)
        .take(ndigits)
        .map(|c| i16::from_be_bytes([c[0], c[1]]))
        .collect();
    let group = |idx: i32| -> i16 {
        usize::try_from(idx)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == SIGN_NEGATIVE {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for idx in 1..=weight {
            out.push_str(&format!("{:04}", group(idx)));
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

/// Encode binary column data as a base64 JSON string.
pub fn binary_value(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Decode a nullable column, treating decode failures as absent.
fn column<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn is_null<R>(row: &R, idx: usize) -> bool
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
{
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> Row;
}

macro_rules! impl_row_to_json {
    ($row:ty, $db:expr, $decoder:path) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> Row {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let value = if is_null(self, idx) {
                            JsonValue::Null
                        } else {
                            let category = categorize_type(col.type_info().name(), $db);
                            $decoder(self, idx, category)
                        };
                        (col.name().to_string(), value)
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_row_to_json!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_row_to_json!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        let value = match category {
            TypeCategory::Integer => column::<_, i16>(row, idx)
                .map(i64::from)
                .or_else(|| column::<_, i32>(row, idx).map(i64::from))
                .or_else(|| column::<_, i64>(row, idx))
                .map(JsonValue::from),
            TypeCategory::Float => column::<_, f64>(row, idx)
                .or_else(|| column::<_, f32>(row, idx).map(f64::from))
                .map(float_value),
            TypeCategory::Decimal => {
                column::<_, RawDecimal>(row, idx).map(|d| JsonValue::String(d.0))
            }
            TypeCategory::Boolean => column::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Binary => column::<_, Vec<u8>>(row, idx).map(|b| binary_value(&b)),
            TypeCategory::Json => column::<_, JsonValue>(row, idx),
            TypeCategory::Uuid => {
                column::<_, uuid::Uuid>(row, idx).map(|u| JsonValue::String(u.to_string()))
            }
            TypeCategory::Timestamp => column::<_, DateTime<Utc>>(row, idx)
                .map(|t| t.to_rfc3339())
                .or_else(|| column::<_, NaiveDateTime>(row, idx).map(|t| t.to_string()))
                .map(JsonValue::String),
            TypeCategory::Date => {
                column::<_, NaiveDate>(row, idx).map(|d| JsonValue::String(d.to_string()))
            }
            TypeCategory::Time => {
                column::<_, NaiveTime>(row, idx).map(|t| JsonValue::String(t.to_string()))
            }
            TypeCategory::Text | TypeCategory::Unknown => {
                column::<_, String>(row, idx).map(JsonValue::String)
            }
        };
        value.unwrap_or_else(|| {
            tracing::debug!(column = idx, ?category, "Unsupported PostgreSQL value, returning null");
            JsonValue::Null
        })
    }
}

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        let value = match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Float => column::<_, f64>(row, idx)
                .or_else(|| column::<_, f32>(row, idx).map(f64::from))
                .map(float_value),
            TypeCategory::Decimal => {
                column::<_, RawDecimal>(row, idx).map(|d| JsonValue::String(d.0))
            }
            TypeCategory::Boolean => column::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Binary => column::<_, Vec<u8>>(row, idx).map(|b| binary_value(&b)),
            TypeCategory::Json => column::<_, JsonValue>(row, idx),
            TypeCategory::Timestamp => column::<_, DateTime<Utc>>(row, idx)
                .map(|t| t.to_rfc3339())
                .or_else(|| column::<_, NaiveDateTime>(row, idx).map(|t| t.to_string()))
                .map(JsonValue::String),
            TypeCategory::Date => {
                column::<_, NaiveDate>(row, idx).map(|d| JsonValue::String(d.to_string()))
            }
            TypeCategory::Time => {
                column::<_, NaiveTime>(row, idx).map(|t| JsonValue::String(t.to_string()))
            }
            TypeCategory::Text | TypeCategory::Uuid | TypeCategory::Unknown => {
                column::<_, String>(row, idx)
                    .map(JsonValue::String)
                    .or_else(|| column::<_, Vec<u8>>(row, idx).map(|b| binary_value(&b)))
            }
        };
        value.unwrap_or(JsonValue::Null)
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<JsonValue> {
        column::<_, i8>(row, idx)
            .map(i64::from)
            .or_else(|| column::<_, i16>(row, idx).map(i64::from))
            .or_else(|| column::<_, i32>(row, idx).map(i64::from))
            .or_else(|| column::<_, i64>(row, idx))
            .map(JsonValue::from)
            .or_else(|| column::<_, u64>(row, idx).map(JsonValue::from))
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        let value = match category {
            TypeCategory::Integer => column::<_, i64>(row, idx).map(JsonValue::from),
            TypeCategory::Float | TypeCategory::Decimal => {
                column::<_, f64>(row, idx).map(float_value)
            }
            TypeCategory::Boolean => column::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Binary => column::<_, Vec<u8>>(row, idx).map(|b| binary_value(&b)),
            TypeCategory::Json => column::<_, String>(row, idx)
                .map(|s| serde_json::from_str(&s).unwrap_or(JsonValue::String(s))),
            _ => None,
        };
        // Values may not match the declared affinity; fall back on storage class.
        value
            .or_else(|| column::<_, i64>(row, idx).map(JsonValue::from))
            .or_else(|| column::<_, f64>(row, idx).map(float_value))
            .or_else(|| column::<_, String>(row, idx).map(JsonValue::String))
            .or_else(|| column::<_, Vec<u8>>(row, idx).map(|b| binary_value(&b)))
            .unwrap_or(JsonValue::Null)
    }
}
