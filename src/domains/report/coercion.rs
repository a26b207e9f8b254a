//! Conversion of database-native scalars into transport-safe cell values.

use crate::domains::report::types::{CellValue, ResultRow};
use crate::errors::{ExportError, ExportResult};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::sync::Arc;

/// A scalar as the driver hands it over, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    NaiveTimestamp(NaiveDateTime),
    NullableBool(Option<bool>),
    NullableInt(Option<i64>),
    NullableFloat(Option<f64>),
    NullableText(Option<String>),
    NullableTimestamp(Option<DateTime<Utc>>),
    /// Anything the driver reports that has no cell representation.
    Unsupported(String),
}

/// Render a timestamp the way the export expects it, e.g. `2024-05-01T10:00:00Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Coerce one native value; `column` is only used for error reporting.
pub fn coerce(column: &str, value: NativeValue) -> ExportResult<CellValue> {
    let cell = match value {
        NativeValue::Null => CellValue::Null,
        NativeValue::Bool(b) => CellValue::Bool(b),
        NativeValue::I8(v) => CellValue::Int(v.into()),
        NativeValue::I16(v) => CellValue::Int(v.into()),
        NativeValue::I32(v) => CellValue::Int(v.into()),
        NativeValue::I64(v) => CellValue::Int(v),
        NativeValue::U8(v) => CellValue::Int(v.into()),
        NativeValue::U16(v) => CellValue::Int(v.into()),
        NativeValue::U32(v) => CellValue::Int(v.into()),
        NativeValue::U64(v) => match i64::try_from(v) {
            Ok(v) => CellValue::Int(v),
            Err(_) => {
                return Err(ExportError::CoercionFailed {
                    column: column.to_string(),
                    type_name: format!("u64 ({} exceeds i64)", v),
                })
            }
        },
        NativeValue::F32(v) => CellValue::Float(v.into()),
        NativeValue::F64(v) => CellValue::Float(v),
        NativeValue::Text(s) => CellValue::Text(s),
        NativeValue::Bytes(b) => CellValue::Text(String::from_utf8_lossy(&b).into_owned()),
        NativeValue::Timestamp(ts) => CellValue::Text(format_timestamp(&ts)),
        NativeValue::NaiveTimestamp(ts) => CellValue::Text(format_timestamp(&ts.and_utc())),
        NativeValue::NullableBool(v) => v.map_or(CellValue::Null, CellValue::Bool),
        NativeValue::NullableInt(v) => v.map_or(CellValue::Null, CellValue::Int),
        NativeValue::NullableFloat(v) => v.map_or(CellValue::Null, CellValue::Float),
        NativeValue::NullableText(v) => v.map_or(CellValue::Null, CellValue::Text),
        NativeValue::NullableTimestamp(v) => {
            v.map_or(CellValue::Null, |ts| CellValue::Text(format_timestamp(&ts)))
        }
        NativeValue::Unsupported(type_name) => {
            return Err(ExportError::CoercionFailed {
                column: column.to_string(),
                type_name,
            })
        }
    };
    Ok(cell)
}

/// Pull column `idx` out of a SQLite row as a native value.
///
/// The declared column type decides booleans and timestamps; everything else
/// follows the storage class of the value itself.
pub fn native_from_sqlite(row: &SqliteRow, idx: usize) -> ExportResult<NativeValue> {
    let column = row.column(idx);
    let decode_err = |e: sqlx::Error| ExportError::CoercionFailed {
        column: column.name().to_string(),
        type_name: e.to_string(),
    };

    let raw = row.try_get_raw(idx).map_err(decode_err)?;
    if raw.is_null() {
        return Ok(NativeValue::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let declared = column.type_info().name().to_ascii_uppercase();

    let value = match declared.as_str() {
        "BOOLEAN" => NativeValue::Bool(row.try_get_unchecked::<bool, _>(idx).map_err(decode_err)?),
        "DATETIME" if storage != "REAL" => {
            NativeValue::NaiveTimestamp(row.try_get_unchecked::<NaiveDateTime, _>(idx).map_err(decode_err)?)
        }
        _ => match storage.as_str() {
            "INTEGER" | "BOOLEAN" => NativeValue::I64(row.try_get_unchecked::<i64, _>(idx).map_err(decode_err)?),
            "REAL" => NativeValue::F64(row.try_get_unchecked::<f64, _>(idx).map_err(decode_err)?),
            "TEXT" | "DATE" | "TIME" | "DATETIME" => {
                NativeValue::Text(row.try_get_unchecked::<String, _>(idx).map_err(decode_err)?)
            }
            "BLOB" => NativeValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(idx).map_err(decode_err)?),
            other => NativeValue::Unsupported(other.to_string()),
        },
    };
    Ok(value)
}

/// Column names of a row, shared by every row of the same result set.
pub fn column_names(row: &SqliteRow) -> Arc<Vec<String>> {
    Arc::new(row.columns().iter().map(|c| c.name().to_string()).collect())
}

/// Coerce a full SQLite row into a [`ResultRow`].
pub fn coerce_sqlite_row(row: &SqliteRow, columns: &Arc<Vec<String>>) -> ExportResult<ResultRow> {
    let mut values = Vec::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        let native = native_from_sqlite(row, idx)?;
        values.push(coerce(name, native)?);
    }
    Ok(ResultRow::new(columns.clone(), values))
}
