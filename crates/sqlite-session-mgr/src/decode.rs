//! Decoding of SQLite rows into JSON values.
//!
//! NULL maps to JSON null, INTEGER/BOOLEAN to a JSON number (i64), REAL to a
//! JSON number (f64), TEXT to a JSON string, and BLOB to a base64 string
//! (standard alphabet). Column order is preserved via `IndexMap`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::{Error, Result};

/// Decode a whole row into a column-name → JSON-value mapping.
pub fn row_to_json(row: &SqliteRow) -> Result<IndexMap<String, JsonValue>> {
   let mut out = IndexMap::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      out.insert(column.name().to_string(), value_to_json(row, i)?);
   }
   Ok(out)
}

fn value_to_json(row: &SqliteRow, index: usize) -> Result<JsonValue> {
   let raw = row.try_get_raw(index)?;
   if raw.is_null() {
      return Ok(JsonValue::Null);
   }
   let type_name = raw.type_info().name().to_string();

   match type_name.as_str() {
      "TEXT" | "DATETIME" | "DATE" | "TIME" => {
         Ok(JsonValue::String(row.try_get::<String, _>(index)?))
      }
      "INTEGER" | "BOOLEAN" | "NUMERIC" => Ok(JsonValue::from(row.try_get::<i64, _>(index)?)),
      "REAL" => {
         let v: f64 = row.try_get(index)?;
         Ok(serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null))
      }
      "BLOB" => {
         let bytes: Vec<u8> = row.try_get(index)?;
         Ok(JsonValue::String(BASE64.encode(bytes)))
      }
      other => Err(Error::UnsupportedDatatype(other.to_string())),
   }
}
