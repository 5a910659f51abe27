use serde_json::Value as JsonValue;
use sqlx::postgres::{PgTypeInfo, PgTypeKind, PgValueRef};
use sqlx::{TypeInfo, Value, ValueRef};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

use crate::Error;

const TEXT_TYPES: [&str; 6] = ["TEXT", "VARCHAR", "BPCHAR", "NAME", "CHAR", "CITEXT"];

/// Convert a PostgreSQL value to a JSON value.
///
/// Follows what `row_to_json` produces where it can, so rows read through
/// [`StatementExecutor::fetch_all`](crate::StatementExecutor::fetch_all) look
/// like the `data` of a notification: timestamps as RFC 3339 text, `json`/`jsonb`
/// as nested JSON.
///
/// Note: BYTEA values are returned as base64-encoded strings since JSON
/// has no native binary type. NUMERIC has no lossless JSON mapping here; cast it
/// in SQL (`::text` or `::float8`). Arrays, ranges and composite values are
/// not decoded either; aggregate them with `to_jsonb` in SQL instead.
pub fn to_json(value: PgValueRef) -> Result<JsonValue, Error> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let column_type = value.type_info().into_owned();
   let value = ValueRef::to_owned(&value);

   let result = match column_type.name() {
      "BOOL" => JsonValue::Bool(value.try_decode::<bool>()?),

      "INT2" => JsonValue::from(value.try_decode::<i16>()?),
      "INT4" => JsonValue::from(value.try_decode::<i32>()?),
      "INT8" => JsonValue::from(value.try_decode::<i64>()?),
      "OID" => JsonValue::from(value.try_decode::<sqlx::postgres::types::Oid>()?.0),

      "FLOAT4" => JsonValue::from(value.try_decode::<f32>()?),
      "FLOAT8" => JsonValue::from(value.try_decode::<f64>()?),

      name if TEXT_TYPES.contains(&name) => JsonValue::String(value.try_decode::<String>()?),

      "JSON" | "JSONB" => value.try_decode::<JsonValue>()?,

      "UUID" => JsonValue::String(value.try_decode::<uuid::Uuid>()?.to_string()),

      "BYTEA" => JsonValue::String(base64_encode(&value.try_decode::<Vec<u8>>()?)),

      "TIMESTAMPTZ" => {
         let ts = value.try_decode::<OffsetDateTime>()?;
         JsonValue::String(format_rfc3339(ts)?)
      }

      "TIMESTAMP" => {
         // Same text as row_to_json: no offset
         let ts = value.try_decode::<PrimitiveDateTime>()?;
         let text = format_rfc3339(ts.assume_utc())?;
         JsonValue::String(text.trim_end_matches('Z').to_string())
      }

      "DATE" => JsonValue::String(value.try_decode::<Date>()?.to_string()),

      "TIME" => JsonValue::String(value.try_decode::<Time>()?.to_string()),

      "VOID" => JsonValue::Null,

      _ if is_textual(&column_type) => JsonValue::String(value.try_decode_unchecked::<String>()?),

      other => {
         return Err(Error::UnsupportedDatatype(format!(
            "Unknown PostgreSQL type: {other}"
         )));
      }
   };

   Ok(result)
}

/// Enum labels and domains over a text type arrive in text wire format.
fn is_textual(type_info: &PgTypeInfo) -> bool {
   match type_info.kind() {
      PgTypeKind::Enum(_) => true,
      PgTypeKind::Domain(base) => is_textual(base),
      _ => TEXT_TYPES.contains(&type_info.name()),
   }
}

fn format_rfc3339(ts: OffsetDateTime) -> Result<String, Error> {
   ts.format(&Rfc3339)
      .map_err(|e| Error::Other(format!("failed to format timestamp: {e}")))
}

/// Base64 encode binary data for JSON serialization.
fn base64_encode(data: &[u8]) -> String {
   use base64::Engine;
   base64::engine::general_purpose::STANDARD.encode(data)
}
